//! Connection probing
//!
//! A probe is one idempotent round trip: list the server's buckets, then
//! create every registered bucket the server does not have yet. Success
//! means the server is reachable and ready for queued heartbeats.

use std::sync::Arc;

use serde_json::{json, Value};

use crate::error::Result;
use crate::transport::Transport;

use super::BucketRegistry;

/// Identity sent along when creating buckets
#[derive(Debug, Clone)]
pub struct ClientIdentity {
    pub name: String,
    pub hostname: String,
}

/// Decides connected vs disconnected for the dispatch loop
pub struct ConnectionProber {
    transport: Arc<dyn Transport>,
    buckets: BucketRegistry,
    identity: ClientIdentity,
}

impl ConnectionProber {
    pub fn new(transport: Arc<dyn Transport>, buckets: BucketRegistry, identity: ClientIdentity) -> Self {
        Self {
            transport,
            buckets,
            identity,
        }
    }

    /// Returns true when the server answered and all registered buckets exist
    pub fn probe(&self) -> bool {
        match self.create_missing_buckets() {
            Ok(created) => {
                tracing::info!(
                    client = %self.identity.name,
                    buckets_created = created,
                    "Connection to server established"
                );
                true
            }
            Err(e) if e.is_transport() => {
                tracing::debug!(error = %e, "Connection probe failed");
                false
            }
            Err(e) => {
                tracing::warn!(error = %e, "Connection probe got an unexpected answer");
                false
            }
        }
    }

    fn create_missing_buckets(&self) -> Result<usize> {
        let listing = self.transport.get("buckets/", &[])?;
        let registered = self.buckets.read().unwrap().clone();

        let mut created = 0;
        for bucket in registered.iter().filter(|b| !bucket_listed(&listing, &b.id)) {
            let endpoint = format!("buckets/{}", urlencoding::encode(&bucket.id));
            let payload = json!({
                "client": self.identity.name,
                "hostname": self.identity.hostname,
                "type": bucket.event_type,
            });
            self.transport.post(&endpoint, &payload, &[])?;
            tracing::info!(bucket = %bucket.id, event_type = %bucket.event_type, "Created bucket");
            created += 1;
        }

        Ok(created)
    }
}

/// The listing is an object keyed by bucket id
fn bucket_listed(listing: &Value, id: &str) -> bool {
    match listing {
        Value::Object(map) => map.contains_key(id),
        Value::Array(items) => items
            .iter()
            .any(|item| item.get("id").and_then(Value::as_str) == Some(id)),
        _ => false,
    }
}
