//! Query client for the ohsome contributions endpoints.
//!
//! One call per cell and interval. Rate limiting (HTTP 429) and transport
//! failures are retried with a linear backoff; every other failure is
//! returned to the caller immediately.

use crate::client::transport::{RawResponse, Transport};
use crate::models::{Cell, TimeInterval};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Retry schedule for a single query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt.
    pub max_retries: u32,
    /// Delay unit; retry `n` waits `base_delay * n`.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
        }
    }

    /// Delay inserted before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        self.base_delay * retry
    }

    /// Upper bound on requests issued for one query.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }
}

/// Terminal failure of a query.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueryError {
    /// Rate limited or transport failure on every allowed attempt.
    #[error("transient failure after {attempts} attempts: {cause}")]
    Transient { attempts: u32, cause: String },

    /// Non-retryable HTTP status.
    #[error("request rejected with HTTP {status}: {body}")]
    Permanent {
        attempts: u32,
        status: u16,
        body: String,
    },

    /// Success status but the body is not JSON.
    #[error("malformed response: {reason}")]
    Malformed { attempts: u32, reason: String },
}

impl QueryError {
    /// Requests issued before giving up.
    pub fn attempts(&self) -> u32 {
        match self {
            QueryError::Transient { attempts, .. }
            | QueryError::Permanent { attempts, .. }
            | QueryError::Malformed { attempts, .. } => *attempts,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, QueryError::Transient { .. })
    }
}

/// A decoded response body together with the attempts it took.
#[derive(Debug, Clone, PartialEq)]
pub struct Fetched {
    pub body: Value,
    pub attempts: u32,
}

/// Which service endpoint a query targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    /// Flat per-contribution-type totals.
    Count,
    /// Per-boundary time-bucketed counts.
    TimeSeries,
}

impl Endpoint {
    fn path(&self) -> &'static str {
        match self {
            Endpoint::Count => "contributions/count",
            Endpoint::TimeSeries => "contributions/count/groupBy/boundary",
        }
    }
}

/// Client for per-cell activity queries.
pub struct QueryClient<T: Transport> {
    transport: Arc<T>,
    base_url: String,
    filter: Option<String>,
    policy: RetryPolicy,
}

impl<T: Transport> QueryClient<T> {
    /// Create a client over a shared transport handle.
    pub fn new(transport: Arc<T>, base_url: impl Into<String>, policy: RetryPolicy) -> Self {
        Self {
            transport,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            filter: None,
            policy,
        }
    }

    /// Restrict counted contributions with an ohsome filter expression.
    pub fn with_filter(mut self, filter: Option<String>) -> Self {
        self.filter = filter.filter(|f| !f.trim().is_empty());
        self
    }

    /// Fetch contribution counts for one cell over `interval`.
    pub async fn fetch(&self, cell: &Cell, interval: &TimeInterval) -> Result<Fetched, QueryError> {
        self.send(Endpoint::Count, cell, interval).await
    }

    /// Fetch the time-bucketed contribution counts for one cell.
    pub async fn fetch_timeseries(
        &self,
        cell: &Cell,
        interval: &TimeInterval,
    ) -> Result<Fetched, QueryError> {
        self.send(Endpoint::TimeSeries, cell, interval).await
    }

    fn form(&self, cell: &Cell, interval: &TimeInterval) -> Vec<(&'static str, String)> {
        let mut form = vec![
            ("bpolys", cell.to_bpolys()),
            ("time", interval.to_string()),
            ("groupBy", "contributionType".to_string()),
        ];
        if let Some(ref filter) = self.filter {
            form.push(("filter", filter.clone()));
        }
        form
    }

    async fn send(
        &self,
        endpoint: Endpoint,
        cell: &Cell,
        interval: &TimeInterval,
    ) -> Result<Fetched, QueryError> {
        let url = format!("{}/{}", self.base_url, endpoint.path());
        let form = self.form(cell, interval);

        let mut attempt = 0;
        loop {
            attempt += 1;

            let cause = match self.transport.post_form(&url, &form).await {
                Ok(response) if response.is_success() => {
                    return decode(response, attempt);
                }
                Ok(response) if response.status == 429 => "rate limited (HTTP 429)".to_string(),
                Ok(response) => {
                    return Err(QueryError::Permanent {
                        attempts: attempt,
                        status: response.status,
                        body: response.body,
                    });
                }
                Err(e) => e.to_string(),
            };

            if attempt > self.policy.max_retries {
                return Err(QueryError::Transient {
                    attempts: attempt,
                    cause,
                });
            }

            let delay = self.policy.delay_for(attempt);
            warn!(
                cell_id = cell.id,
                attempt,
                max_attempts = self.policy.max_attempts(),
                delay_ms = delay.as_millis() as u64,
                "{}; retrying",
                cause
            );
            tokio::time::sleep(delay).await;
        }
    }
}

fn decode(response: RawResponse, attempts: u32) -> Result<Fetched, QueryError> {
    match serde_json::from_str::<Value>(&response.body) {
        Ok(body) => {
            debug!(attempts, "Decoded {} byte response", response.body.len());
            Ok(Fetched { body, attempts })
        }
        Err(e) => Err(QueryError::Malformed {
            attempts,
            reason: e.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::transport::testing::{ScriptedTransport, Step};
    use crate::client::transport::TransportError;
    use serde_json::json;
    use tokio::time::Instant;

    const BREAKDOWN: &str = r#"{"result":[
        {"value":5.0,"contributionType":"creation"},
        {"value":2.0,"contributionType":"modification"},
        {"value":1.0,"contributionType":"deletion"}]}"#;

    fn cell(id: i64) -> Cell {
        Cell::new(id, json!({"type": "Polygon", "coordinates": []}))
    }

    fn interval() -> TimeInterval {
        "2018-11-01/2021-05-01/P1D".parse().unwrap()
    }

    fn client(transport: Arc<ScriptedTransport>) -> QueryClient<ScriptedTransport> {
        QueryClient::new(
            transport,
            "https://api.example.org/v1/",
            RetryPolicy::new(3, Duration::from_secs(2)),
        )
    }

    #[test]
    fn test_linear_delay_schedule() {
        let policy = RetryPolicy::new(3, Duration::from_millis(500));
        assert_eq!(policy.delay_for(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for(2), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(3), Duration::from_millis(1500));
        assert_eq!(policy.max_attempts(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_then_success() {
        let transport = Arc::new(
            ScriptedTransport::new(Step::status(500)).script(
                1,
                vec![Step::status(429), Step::status(429), Step::ok(BREAKDOWN)],
            ),
        );
        let client = client(transport.clone());

        let started = Instant::now();
        let fetched = client.fetch(&cell(1), &interval()).await.unwrap();

        assert_eq!(fetched.attempts, 3);
        assert_eq!(transport.calls_for(1), 3);
        // 1x base + 2x base
        assert_eq!(started.elapsed(), Duration::from_secs(6));
        assert_eq!(
            crate::analysis::score(crate::analysis::extract_breakdown(&fetched.body)),
            8
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_failures_exhaust_retries() {
        let transport = Arc::new(ScriptedTransport::new(Step::Fail(TransportError::Timeout(30))));
        let client = client(transport.clone());

        let started = Instant::now();
        let err = client.fetch(&cell(2), &interval()).await.unwrap_err();

        assert!(err.is_transient());
        assert_eq!(err.attempts(), 4);
        assert_eq!(transport.calls_for(2), 4);
        assert_eq!(started.elapsed(), Duration::from_secs(2 + 4 + 6));
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_status_is_not_retried() {
        let transport = Arc::new(ScriptedTransport::new(Step::status(400)));
        let client = client(transport.clone());

        let started = Instant::now();
        let err = client.fetch(&cell(3), &interval()).await.unwrap_err();

        assert!(matches!(err, QueryError::Permanent { status: 400, attempts: 1, .. }));
        assert_eq!(transport.calls_for(3), 1);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_non_json_body_is_malformed() {
        let transport = Arc::new(ScriptedTransport::new(Step::ok("<html>oops</html>")));
        let client = client(transport.clone());

        let err = client.fetch(&cell(4), &interval()).await.unwrap_err();
        assert!(matches!(err, QueryError::Malformed { attempts: 1, .. }));
    }

    #[tokio::test]
    async fn test_endpoint_urls() {
        let transport = Arc::new(ScriptedTransport::new(Step::ok("{}")));
        let client = client(transport.clone());

        client.fetch(&cell(5), &interval()).await.unwrap();
        client.fetch_timeseries(&cell(5), &interval()).await.unwrap();

        assert_eq!(
            transport.urls(),
            vec![
                "https://api.example.org/v1/contributions/count".to_string(),
                "https://api.example.org/v1/contributions/count/groupBy/boundary".to_string(),
            ]
        );
    }

    #[test]
    fn test_form_includes_filter_only_when_set() {
        let transport = Arc::new(ScriptedTransport::new(Step::ok("{}")));
        let plain = client(transport.clone());
        let keys: Vec<_> = plain.form(&cell(1), &interval()).iter().map(|(k, _)| *k).collect();
        assert_eq!(keys, vec!["bpolys", "time", "groupBy"]);

        let filtered = client(transport).with_filter(Some("highway=*".to_string()));
        let form = filtered.form(&cell(1), &interval());
        assert_eq!(form.last(), Some(&("filter", "highway=*".to_string())));
    }
}
