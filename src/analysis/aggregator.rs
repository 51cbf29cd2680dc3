//! Response aggregation.
//!
//! Reduces ohsome responses to contribution breakdowns and activity
//! scores. Extraction is lenient: anything that does not have the
//! expected shape yields `None` (and a zero score) instead of an error.

use crate::models::{ContributionBreakdown, ContributionKind, TimeBucket};
use serde_json::Value;

/// Extract the per-kind breakdown from a count response.
///
/// Expects `result` to be an array of `{value, contributionType}` records.
/// Records of unrecognized kinds are ignored. A recognized record without
/// a usable non-negative `value` invalidates the whole response.
pub fn extract_breakdown(response: &Value) -> Option<ContributionBreakdown> {
    let records = response.get("result")?.as_array()?;
    let mut breakdown = ContributionBreakdown::default();

    for record in records {
        let record = record.as_object()?;
        let Some(kind) = record
            .get("contributionType")
            .and_then(Value::as_str)
            .and_then(ContributionKind::parse)
        else {
            continue;
        };
        let value = count_value(record.get("value")?)?;
        breakdown.add(kind, value);
    }

    Some(breakdown)
}

/// Activity score: the sum of creations, modifications and deletions, or
/// zero when no breakdown could be extracted.
pub fn score(breakdown: Option<ContributionBreakdown>) -> u64 {
    breakdown.map_or(0, |b| b.total())
}

/// Extract a time series from a `groupBy/boundary` response.
///
/// Expects `result.features[].properties.result[]` records of the form
/// `{timestamp, groups: [{group, value}]}`. Buckets from all features are
/// merged by timestamp and returned in timestamp order.
pub fn extract_timeseries(response: &Value) -> Option<Vec<TimeBucket>> {
    let features = response.get("result")?.get("features")?.as_array()?;
    let mut buckets: Vec<TimeBucket> = Vec::new();

    for feature in features {
        let entries = feature.get("properties")?.get("result")?.as_array()?;

        for entry in entries {
            let timestamp = entry.get("timestamp")?.as_str()?;
            let mut breakdown = ContributionBreakdown::default();

            for group in entry.get("groups")?.as_array()? {
                let Some(kind) = group
                    .get("group")
                    .and_then(Value::as_str)
                    .and_then(ContributionKind::parse)
                else {
                    continue;
                };
                breakdown.add(kind, count_value(group.get("value")?)?);
            }

            match buckets.iter_mut().find(|b| b.timestamp == timestamp) {
                Some(existing) => {
                    existing.breakdown.add(ContributionKind::Creation, breakdown.creation);
                    existing
                        .breakdown
                        .add(ContributionKind::Modification, breakdown.modification);
                    existing.breakdown.add(ContributionKind::Deletion, breakdown.deletion);
                }
                None => buckets.push(TimeBucket {
                    timestamp: timestamp.to_string(),
                    breakdown,
                }),
            }
        }
    }

    buckets.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
    Some(buckets)
}

/// Read a count. The service reports counts as floats; negative or
/// non-finite values are rejected.
fn count_value(value: &Value) -> Option<u64> {
    if let Some(n) = value.as_u64() {
        return Some(n);
    }
    let f = value.as_f64()?;
    if f.is_finite() && f >= 0.0 {
        Some(f.round() as u64)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sums_recognized_kinds() {
        let response = json!({"result": [
            {"value": 5.0, "contributionType": "creation"},
            {"value": 2.0, "contributionType": "modification"},
            {"value": 1, "contributionType": "deletion"},
        ]});
        assert_eq!(
            extract_breakdown(&response),
            Some(ContributionBreakdown::new(5, 2, 1))
        );
        assert_eq!(score(extract_breakdown(&response)), 8);
    }

    #[test]
    fn test_ignores_unknown_kinds() {
        let response = json!({"result": [
            {"value": 5.0, "contributionType": "creation"},
            {"value": 100.0, "contributionType": "tagChange"},
            {"value": 3.0},
        ]});
        assert_eq!(score(extract_breakdown(&response)), 5);
    }

    #[test]
    fn test_missing_result_scores_zero() {
        assert_eq!(extract_breakdown(&json!({"metadata": {}})), None);
        assert_eq!(score(extract_breakdown(&json!({"metadata": {}}))), 0);
        assert_eq!(score(extract_breakdown(&json!(null))), 0);
        assert_eq!(score(extract_breakdown(&json!({"result": "nope"}))), 0);
    }

    #[test]
    fn test_empty_result_is_zero_activity() {
        assert_eq!(
            extract_breakdown(&json!({"result": []})),
            Some(ContributionBreakdown::default())
        );
    }

    #[test]
    fn test_recognized_record_without_value_invalidates() {
        let response = json!({"result": [
            {"value": 5.0, "contributionType": "creation"},
            {"contributionType": "deletion"},
        ]});
        assert_eq!(extract_breakdown(&response), None);
        assert_eq!(score(extract_breakdown(&response)), 0);

        let negative = json!({"result": [{"value": -1.0, "contributionType": "creation"}]});
        assert_eq!(score(extract_breakdown(&negative)), 0);
    }

    #[test]
    fn test_extract_timeseries() {
        let response = json!({"result": {"type": "FeatureCollection", "features": [{
            "type": "Feature",
            "properties": {"groupByObject": "523", "result": [
                {"timestamp": "2018-12-01T00:00:00Z", "groups": [
                    {"group": "creation", "value": 4.0},
                    {"group": "deletion", "value": 1.0},
                ]},
                {"timestamp": "2018-11-01T00:00:00Z", "groups": [
                    {"group": "creation", "value": 1.0},
                    {"group": "modification", "value": 2.0},
                    {"group": "other", "value": 9.0},
                ]},
            ]},
        }]}});

        let series = extract_timeseries(&response).unwrap();
        assert_eq!(series.len(), 2);
        assert_eq!(series[0].timestamp, "2018-11-01T00:00:00Z");
        assert_eq!(series[0].breakdown, ContributionBreakdown::new(1, 2, 0));
        assert_eq!(series[1].breakdown.total(), 5);
    }

    #[test]
    fn test_extract_timeseries_malformed() {
        assert_eq!(extract_timeseries(&json!({"result": []})), None);
        assert_eq!(extract_timeseries(&json!({})), None);
    }
}
