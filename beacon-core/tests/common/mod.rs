//! Shared fixtures for beacon-core integration tests

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use beacon_core::transport::{Params, Transport};
use beacon_core::{Error, Event, EventData, Result};
use chrono::{TimeZone, Utc};
use serde_json::{json, Value};

/// In-memory stand-in for the tracking server
#[derive(Default)]
pub struct MockTransport {
    state: Mutex<MockState>,
}

#[derive(Default)]
struct MockState {
    online: bool,
    /// Fail this many bucket listings even while online
    probe_failures: usize,
    /// Fail the n-th heartbeat POST attempt (1-based)
    fail_heartbeat_attempt: Option<usize>,
    heartbeat_attempts: usize,
    buckets: BTreeMap<String, Value>,
    posts: Vec<(String, Value)>,
    deletes: Vec<String>,
}

impl MockTransport {
    pub fn online() -> Arc<Self> {
        let mock = Self::default();
        mock.set_online(true);
        Arc::new(mock)
    }

    pub fn offline() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_online(&self, online: bool) {
        self.state.lock().unwrap().online = online;
    }

    pub fn fail_probes(&self, count: usize) {
        self.state.lock().unwrap().probe_failures = count;
    }

    pub fn fail_heartbeat_attempt(&self, attempt: usize) {
        self.state.lock().unwrap().fail_heartbeat_attempt = Some(attempt);
    }

    pub fn add_bucket(&self, id: &str) {
        self.state
            .lock()
            .unwrap()
            .buckets
            .insert(id.to_string(), json!({"id": id, "type": "test"}));
    }

    pub fn bucket_ids(&self) -> Vec<String> {
        self.state.lock().unwrap().buckets.keys().cloned().collect()
    }

    /// Successful POSTs in the order the server accepted them
    pub fn posts(&self) -> Vec<(String, Value)> {
        self.state.lock().unwrap().posts.clone()
    }

    pub fn heartbeat_posts(&self) -> Vec<(String, Value)> {
        self.posts()
            .into_iter()
            .filter(|(endpoint, _)| endpoint.contains("/heartbeat"))
            .collect()
    }

    pub fn bucket_creations(&self) -> Vec<String> {
        self.posts()
            .into_iter()
            .filter(|(endpoint, _)| endpoint.starts_with("buckets/") && !endpoint.contains("/heartbeat"))
            .map(|(endpoint, _)| endpoint)
            .collect()
    }

    pub fn deletes(&self) -> Vec<String> {
        self.state.lock().unwrap().deletes.clone()
    }
}

fn refused() -> Error {
    Error::transport(None, "connection refused")
}

impl Transport for MockTransport {
    fn get(&self, endpoint: &str, params: &Params<'_>) -> Result<Value> {
        let mut state = self.state.lock().unwrap();
        if !state.online {
            return Err(refused());
        }

        match endpoint {
            "buckets/" => {
                if state.probe_failures > 0 {
                    state.probe_failures -= 1;
                    return Err(Error::transport(Some(503), "warming up"));
                }
                Ok(Value::Object(state.buckets.clone().into_iter().collect()))
            }
            "info" => Ok(json!({"hostname": "mock", "testing": true})),
            e if e.ends_with("/events/count") => Ok(Value::String("3".to_string())),
            e if e.ends_with("/events") => {
                let limit = params
                    .iter()
                    .find(|(k, _)| *k == "limit")
                    .and_then(|(_, v)| v.parse::<usize>().ok())
                    .unwrap_or(usize::MAX);
                let events: Vec<Value> = (0..3)
                    .map(|t| heartbeat_event(t, "editor").to_json())
                    .take(limit)
                    .collect();
                Ok(Value::Array(events))
            }
            _ => Err(Error::transport(Some(404), "not found")),
        }
    }

    fn post(&self, endpoint: &str, payload: &Value, params: &Params<'_>) -> Result<Value> {
        let mut state = self.state.lock().unwrap();
        if !state.online {
            return Err(refused());
        }

        if endpoint.contains("/heartbeat") {
            state.heartbeat_attempts += 1;
            if state.fail_heartbeat_attempt == Some(state.heartbeat_attempts) {
                return Err(Error::transport(Some(500), "internal error"));
            }
        } else if let Some(id) = endpoint.strip_prefix("buckets/").filter(|id| !id.contains('/')) {
            let id = urlencoding::decode(id).map(|s| s.into_owned()).unwrap_or_default();
            if state.buckets.contains_key(&id) {
                return Err(Error::transport(Some(304), "bucket exists"));
            }
            let mut listed = payload.clone();
            listed["id"] = json!(id);
            state.buckets.insert(id, listed);
        }

        state.posts.push((endpoint.to_string(), payload.clone()));

        if endpoint == "query/" {
            return Ok(json!([{"params": params.iter().map(|(k, v)| format!("{}={}", k, v)).collect::<Vec<_>>()}]));
        }
        Ok(payload.clone())
    }

    fn delete(&self, endpoint: &str, _payload: &Value) -> Result<Value> {
        let mut state = self.state.lock().unwrap();
        if !state.online {
            return Err(refused());
        }
        state.deletes.push(endpoint.to_string());
        Ok(Value::Null)
    }
}

/// Zero-duration event at `t` seconds past a fixed epoch
pub fn heartbeat_event(t: i64, app: &str) -> Event {
    let mut data = EventData::new();
    data.insert("app".to_string(), json!(app));
    Event::new(Utc.timestamp_opt(1_700_000_000 + t, 0).unwrap(), data)
}
