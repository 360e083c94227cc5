//! Heartbeat compaction for buffered requests
//!
//! After an outage the queue can hold thousands of heartbeats that the
//! server would merge anyway. Compaction folds runs of adjacent heartbeats
//! for the same bucket into as few requests as possible before they are sent.
//!
//! The reduction is left to right: each heartbeat is offered to the current
//! accumulator together with that heartbeat's own pulse tolerance, so runs
//! mixing different tolerances merge exactly as the server would have merged
//! them one by one.

use crate::error::{Error, Result};
use crate::types::{Event, MergeFn};

use super::store::RequestStore;
use super::QueuedRequest;

const PULSETIME_PARAM: &str = "pulsetime=";

/// Largest accepted pulse tolerance (one year). Anything above is treated
/// as unparseable and replaced by the fallback.
pub const MAX_PULSETIME_SECS: f64 = 365.0 * 24.0 * 3600.0;

/// Read the pulse tolerance (seconds) from a heartbeat endpoint
pub fn parse_pulsetime(endpoint: &str) -> Result<f64> {
    let query = endpoint
        .split_once('?')
        .map(|(_, query)| query)
        .unwrap_or_default();

    query
        .split('&')
        .find_map(|pair| pair.strip_prefix(PULSETIME_PARAM))
        .and_then(|value| value.parse::<f64>().ok())
        .filter(|value| (0.0..=MAX_PULSETIME_SECS).contains(value))
        .ok_or_else(|| Error::PulseParse {
            endpoint: endpoint.to_string(),
        })
}

/// Pulse tolerance for `endpoint`, or `fallback` with a warning
pub fn pulsetime_or(endpoint: &str, fallback: f64) -> f64 {
    match parse_pulsetime(endpoint) {
        Ok(pulsetime) => pulsetime,
        Err(e) => {
            tracing::warn!(error = %e, fallback, "Couldn't detect pulsetime, using fallback");
            fallback
        }
    }
}

/// The endpoint with its query replaced by `pulsetime=0`
pub fn zero_pulsetime_endpoint(endpoint: &str) -> String {
    format!("{}?{}0", endpoint_family(endpoint), PULSETIME_PARAM)
}

/// Endpoint without its query string; requests with equal families target
/// the same bucket's heartbeat endpoint
pub fn endpoint_family(endpoint: &str) -> &str {
    endpoint
        .split_once('?')
        .map(|(path, _)| path)
        .unwrap_or(endpoint)
}

/// Merge a run of heartbeat requests for one bucket.
///
/// The first output keeps the first request's endpoint. Every later output
/// starts at a point where two heartbeats refused to merge, so it is sent
/// with zero tolerance to stop the server merging it again.
///
/// Endpoints are only rewritten when at least one merge happened. Runs
/// shorter than two requests, and runs where no heartbeat merged, are
/// returned unchanged.
pub fn compact(requests: &[QueuedRequest], merge: &MergeFn, fallback_pulsetime: f64) -> Vec<QueuedRequest> {
    if requests.len() <= 1 {
        return requests.to_vec();
    }

    let first_endpoint = requests[0].endpoint.clone();
    let zero_endpoint = zero_pulsetime_endpoint(&first_endpoint);

    let mut reduced: Vec<QueuedRequest> = Vec::with_capacity(requests.len());
    let mut acc: Option<Event> = None;

    // A request whose payload is not an event never enters the accumulator
    // and is passed through as-is.
    let emit = |reduced: &mut Vec<QueuedRequest>, payload: serde_json::Value| {
        let endpoint = if reduced.is_empty() {
            first_endpoint.clone()
        } else {
            zero_endpoint.clone()
        };
        reduced.push(QueuedRequest { endpoint, payload });
    };

    for request in requests {
        let heartbeat = match Event::from_json(&request.payload) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(error = %e, endpoint = %request.endpoint, "Queued heartbeat is not an event, not merging");
                if let Some(last) = acc.take() {
                    emit(&mut reduced, last.to_json());
                }
                emit(&mut reduced, request.payload.clone());
                continue;
            }
        };

        acc = match acc.take() {
            None => Some(heartbeat),
            Some(last) => {
                let pulsetime = pulsetime_or(&request.endpoint, fallback_pulsetime);
                match merge(&last, &heartbeat, pulsetime) {
                    Some(merged) => Some(merged),
                    None => {
                        emit(&mut reduced, last.to_json());
                        Some(heartbeat)
                    }
                }
            }
        };
    }

    if let Some(last) = acc {
        emit(&mut reduced, last.to_json());
    }

    if reduced.len() == requests.len() {
        return requests.to_vec();
    }
    reduced
}

/// Outcome of compacting a whole store
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CompactionReport {
    /// Requests in the store before compaction
    pub before: usize,
    /// Requests in the store afterwards
    pub after: usize,
    /// Runs that were rewritten
    pub runs_rewritten: usize,
}

/// Compact every run of adjacent same-bucket heartbeats in the store.
///
/// Works on a snapshot; each shrunk run is rewritten in its own transaction
/// so other entries never move. The store's cursor is cleared by the
/// rewrite and the next `peek` picks up the new head.
pub fn compact_store(store: &RequestStore, merge: &MergeFn, fallback_pulsetime: f64) -> Result<CompactionReport> {
    let snapshot = store.snapshot()?;
    let mut report = CompactionReport {
        before: snapshot.len(),
        after: snapshot.len(),
        runs_rewritten: 0,
    };

    let mut start = 0;
    while start < snapshot.len() {
        let family = endpoint_family(&snapshot[start].request.endpoint);
        let end = snapshot[start..]
            .iter()
            .position(|entry| endpoint_family(&entry.request.endpoint) != family)
            .map(|offset| start + offset)
            .unwrap_or(snapshot.len());

        let run = &snapshot[start..end];
        if run.len() > 1 && family.ends_with("/heartbeat") {
            let requests: Vec<QueuedRequest> = run.iter().map(|e| e.request.clone()).collect();
            let compacted = compact(&requests, merge, fallback_pulsetime);

            if compacted.len() < run.len() {
                let ids: Vec<i64> = run.iter().map(|e| e.id).collect();
                store.replace_run(&ids, &compacted)?;
                report.after -= run.len() - compacted.len();
                report.runs_rewritten += 1;
            }
        }

        start = end;
    }

    if report.runs_rewritten > 0 {
        tracing::info!(
            before = report.before,
            after = report.after,
            runs = report.runs_rewritten,
            "Compacted queued heartbeats"
        );
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{default_merge, EventData};
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn heartbeat(t: i64, pulsetime: &str) -> QueuedRequest {
        let mut data = EventData::new();
        data.insert("app".to_string(), json!("editor"));
        let event = Event::new(Utc.timestamp_opt(1_700_000_000 + t, 0).unwrap(), data);
        QueuedRequest {
            endpoint: format!("buckets/B/heartbeat?pulsetime={}", pulsetime),
            payload: event.to_json(),
        }
    }

    fn durations(requests: &[QueuedRequest]) -> Vec<f64> {
        requests
            .iter()
            .map(|r| Event::from_json(&r.payload).unwrap().duration)
            .collect()
    }

    #[test]
    fn test_parse_pulsetime() {
        assert_eq!(parse_pulsetime("buckets/a/heartbeat?pulsetime=10").unwrap(), 10.0);
        assert_eq!(parse_pulsetime("buckets/a/heartbeat?pulsetime=2.5").unwrap(), 2.5);
        assert_eq!(parse_pulsetime("buckets/a/heartbeat?x=1&pulsetime=7").unwrap(), 7.0);
        assert!(parse_pulsetime("buckets/a/heartbeat").is_err());
        assert!(parse_pulsetime("buckets/a/heartbeat?pulsetime=abc").is_err());
        assert!(parse_pulsetime("buckets/a/heartbeat?pulsetime=-1").is_err());
        assert!(parse_pulsetime("buckets/a/heartbeat?pulsetime=NaN").is_err());
        assert!(parse_pulsetime("buckets/a/heartbeat?pulsetime=10000000000000").is_err());
    }

    #[test]
    fn test_pulsetime_fallback() {
        assert_eq!(pulsetime_or("buckets/a/heartbeat", 30.0), 30.0);
        assert_eq!(pulsetime_or("buckets/a/heartbeat?pulsetime=4", 30.0), 4.0);
    }

    #[test]
    fn test_zero_pulsetime_endpoint() {
        assert_eq!(
            zero_pulsetime_endpoint("buckets/a/heartbeat?pulsetime=10"),
            "buckets/a/heartbeat?pulsetime=0"
        );
        assert_eq!(
            zero_pulsetime_endpoint("buckets/a/heartbeat"),
            "buckets/a/heartbeat?pulsetime=0"
        );
    }

    #[test]
    fn test_single_request_is_untouched() {
        let merge = default_merge();
        assert!(compact(&[], &merge, 30.0).is_empty());

        let one = vec![heartbeat(0, "10")];
        assert_eq!(compact(&one, &merge, 30.0), one);
    }

    #[test]
    fn test_mergeable_requests_shrink() {
        let merge = default_merge();
        let requests = vec![heartbeat(0, "10"), heartbeat(5, "10"), heartbeat(9, "10")];

        let out = compact(&requests, &merge, 30.0);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].endpoint, "buckets/B/heartbeat?pulsetime=10");
        assert_eq!(durations(&out), vec![9.0]);
    }

    #[test]
    fn test_gaps_above_tolerance_are_identity() {
        let merge = default_merge();
        let requests = vec![heartbeat(0, "10"), heartbeat(20, "10"), heartbeat(40, "10")];

        assert_eq!(compact(&requests, &merge, 30.0), requests);
    }

    #[test]
    fn test_split_after_merge_gets_zero_tolerance() {
        let merge = default_merge();
        let requests = vec![heartbeat(0, "10"), heartbeat(5, "10"), heartbeat(40, "10")];

        let out = compact(&requests, &merge, 30.0);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].endpoint, "buckets/B/heartbeat?pulsetime=10");
        assert_eq!(out[1].endpoint, "buckets/B/heartbeat?pulsetime=0");
        assert_eq!(out[1].payload, requests[2].payload);
    }

    #[test]
    fn test_huge_pulsetime_falls_back() {
        let store = RequestStore::open_in_memory().unwrap();
        let merge = default_merge();

        store.put(&heartbeat(0, "10000000000000")).unwrap();
        store.put(&heartbeat(5, "10000000000000")).unwrap();
        store.put(&heartbeat(500, "1e300")).unwrap();

        // 5s gap merges under the 30s fallback, the 495s gap does not
        let report = compact_store(&store, &merge, 30.0).unwrap();
        assert_eq!(report.after, 2);

        let requests: Vec<QueuedRequest> =
            store.snapshot().unwrap().into_iter().map(|e| e.request).collect();
        assert_eq!(durations(&requests), vec![5.0, 0.0]);
    }

    #[test]
    fn test_uses_each_requests_own_pulsetime() {
        let merge = default_merge();
        // gap of 15s: too wide for 10s, narrow enough for 20s
        let requests = vec![heartbeat(0, "10"), heartbeat(15, "20")];
        assert_eq!(compact(&requests, &merge, 30.0).len(), 1);

        let requests = vec![heartbeat(0, "20"), heartbeat(15, "10")];
        assert_eq!(compact(&requests, &merge, 30.0).len(), 2);
    }

    #[test]
    fn test_missing_pulsetime_uses_fallback() {
        let merge = default_merge();
        let mut second = heartbeat(25, "0");
        second.endpoint = "buckets/B/heartbeat".to_string();

        let requests = vec![heartbeat(0, "10"), second];
        assert_eq!(compact(&requests, &merge, 30.0).len(), 1);
        assert_eq!(compact(&requests, &merge, 5.0).len(), 2);
    }

    #[test]
    fn test_non_event_payload_is_boundary() {
        let merge = default_merge();
        let odd = QueuedRequest {
            endpoint: "buckets/B/heartbeat?pulsetime=10".to_string(),
            payload: json!({"not": "an event"}),
        };
        let requests = vec![heartbeat(0, "10"), odd.clone(), heartbeat(1, "10")];

        let out = compact(&requests, &merge, 30.0);
        assert_eq!(out.len(), 3);
        assert_eq!(out[1].payload, odd.payload);
    }

    #[test]
    fn test_compact_store_respects_other_buckets() {
        let store = RequestStore::open_in_memory().unwrap();
        let merge = default_merge();

        let mut other = heartbeat(2, "10");
        other.endpoint = "buckets/C/heartbeat?pulsetime=10".to_string();

        store.put(&heartbeat(0, "10")).unwrap();
        store.put(&heartbeat(1, "10")).unwrap();
        store.put(&other).unwrap();
        store.put(&heartbeat(3, "10")).unwrap();
        store.put(&heartbeat(4, "10")).unwrap();

        let report = compact_store(&store, &merge, 30.0).unwrap();
        assert_eq!(report.before, 5);
        assert_eq!(report.after, 3);
        assert_eq!(report.runs_rewritten, 2);

        let endpoints: Vec<String> = store
            .snapshot()
            .unwrap()
            .into_iter()
            .map(|e| e.request.endpoint)
            .collect();
        assert_eq!(
            endpoints,
            vec![
                "buckets/B/heartbeat?pulsetime=10",
                "buckets/C/heartbeat?pulsetime=10",
                "buckets/B/heartbeat?pulsetime=10",
            ]
        );
    }
}
