//! HTTP transport for the ohsome API.
//!
//! The query client talks to the network through the [`Transport`] trait so
//! that one pooled handle can be shared by every worker and replaced by a
//! scripted double in tests.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Status and body of a completed HTTP exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    pub status: u16,
    pub body: String,
}

impl RawResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Failures below the HTTP status level. All of them are transient.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("request timed out after {0}s")]
    Timeout(u64),
    #[error("cannot connect to {0}")]
    Connect(String),
    #[error("request failed: {0}")]
    Other(String),
}

/// A form-posting HTTP transport.
///
/// Implementations must be safe to share across tasks; every request is
/// independent of the others.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn post_form(
        &self,
        url: &str,
        form: &[(&'static str, String)],
    ) -> Result<RawResponse, TransportError>;
}

/// [`Transport`] backed by a pooled `reqwest::Client`.
pub struct HttpTransport {
    client: reqwest::Client,
    timeout_seconds: u64,
}

impl HttpTransport {
    /// Build a transport whose every request carries `timeout_seconds`.
    pub fn new(timeout_seconds: u64) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_seconds))
            .user_agent(concat!("cellpulse/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            timeout_seconds,
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn post_form(
        &self,
        url: &str,
        form: &[(&'static str, String)],
    ) -> Result<RawResponse, TransportError> {
        debug!("POST {}", url);

        let response = self
            .client
            .post(url)
            .form(form)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TransportError::Timeout(self.timeout_seconds)
                } else if e.is_connect() {
                    TransportError::Connect(url.to_string())
                } else {
                    TransportError::Other(e.to_string())
                }
            })?;

        let status = response.status().as_u16();
        let body = response.text().await.map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout(self.timeout_seconds)
            } else {
                TransportError::Other(format!("failed to read body: {}", e))
            }
        })?;

        Ok(RawResponse::new(status, body))
    }
}

#[cfg(test)]
pub mod testing {
    //! Scripted transport double.

    use super::*;
    use crate::models::CellId;
    use serde_json::Value;
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// One scripted reply.
    #[derive(Debug, Clone)]
    pub enum Step {
        Respond(RawResponse),
        Fail(TransportError),
    }

    impl Step {
        pub fn ok(body: impl Into<String>) -> Self {
            Step::Respond(RawResponse::new(200, body))
        }

        pub fn status(status: u16) -> Self {
            Step::Respond(RawResponse::new(status, format!("status {}", status)))
        }
    }

    /// Replays per-cell scripts and records call statistics.
    ///
    /// Cells are identified by the `id` property of the single feature in
    /// `bpolys`. Once a script runs dry the fallback step is used.
    pub struct ScriptedTransport {
        scripts: Mutex<HashMap<CellId, VecDeque<Step>>>,
        fallback: Step,
        latency: Duration,
        calls: Mutex<HashMap<CellId, usize>>,
        urls: Mutex<Vec<String>>,
        in_flight: AtomicUsize,
        peak_in_flight: AtomicUsize,
    }

    impl ScriptedTransport {
        pub fn new(fallback: Step) -> Self {
            Self {
                scripts: Mutex::new(HashMap::new()),
                fallback,
                latency: Duration::ZERO,
                calls: Mutex::new(HashMap::new()),
                urls: Mutex::new(Vec::new()),
                in_flight: AtomicUsize::new(0),
                peak_in_flight: AtomicUsize::new(0),
            }
        }

        pub fn with_latency(mut self, latency: Duration) -> Self {
            self.latency = latency;
            self
        }

        pub fn script(self, id: CellId, steps: Vec<Step>) -> Self {
            self.scripts
                .lock()
                .unwrap()
                .insert(id, steps.into_iter().collect());
            self
        }

        pub fn calls_for(&self, id: CellId) -> usize {
            self.calls.lock().unwrap().get(&id).copied().unwrap_or(0)
        }

        pub fn total_calls(&self) -> usize {
            self.calls.lock().unwrap().values().sum()
        }

        pub fn urls(&self) -> Vec<String> {
            self.urls.lock().unwrap().clone()
        }

        pub fn peak_in_flight(&self) -> usize {
            self.peak_in_flight.load(Ordering::SeqCst)
        }

        fn cell_id(form: &[(&'static str, String)]) -> CellId {
            form.iter()
                .find(|(k, _)| *k == "bpolys")
                .and_then(|(_, v)| serde_json::from_str::<Value>(v).ok())
                .and_then(|v| v["features"][0]["properties"]["id"].as_i64())
                .unwrap_or(-1)
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn post_form(
            &self,
            url: &str,
            form: &[(&'static str, String)],
        ) -> Result<RawResponse, TransportError> {
            let id = Self::cell_id(form);
            *self.calls.lock().unwrap().entry(id).or_default() += 1;
            self.urls.lock().unwrap().push(url.to_string());

            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak_in_flight.fetch_max(now, Ordering::SeqCst);

            if !self.latency.is_zero() {
                tokio::time::sleep(self.latency).await;
            }

            let step = self
                .scripts
                .lock()
                .unwrap()
                .get_mut(&id)
                .and_then(|q| q.pop_front())
                .unwrap_or_else(|| self.fallback.clone());

            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            match step {
                Step::Respond(response) => Ok(response),
                Step::Fail(error) => Err(error),
            }
        }
    }
}
