//! Client facade for the tracking server
//!
//! Most calls go straight to the server and return its answer or error.
//! Heartbeats and bucket creation can instead be `queued`: they are handed
//! to the offline [`RequestQueue`] and delivered in the background once the
//! server is reachable.
//!
//! ```rust,no_run
//! use beacon_core::{Client, Config, Event};
//!
//! let config = Config::load().expect("failed to load config");
//! let mut client = Client::builder("watcher-afk").config(config).build().unwrap();
//!
//! client.create_bucket("afk_host", "afkstatus", true).unwrap();
//! client.connect().unwrap();
//!
//! let event = Event::new(chrono::Utc::now(), Default::default());
//! client.heartbeat("afk_host", &event, 60.0, true).unwrap();
//!
//! client.disconnect().unwrap();
//! ```

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use crate::config::{Config, QueueConfig};
use crate::error::{Error, Result};
use crate::queue::{
    store_path, Bucket, BucketRegistry, ClientIdentity, DispatchStats, QueueStatus, RequestQueue,
};
use crate::transport::{HttpTransport, Transport};
use crate::types::{default_merge, BucketInfo, Event, MergeFn};

/// Builder for [`Client`]
pub struct ClientBuilder {
    name: String,
    testing: bool,
    config: Config,
    hostname: Option<String>,
    transport: Option<Arc<dyn Transport>>,
    queue_dir: Option<PathBuf>,
    merge: Option<MergeFn>,
}

impl ClientBuilder {
    /// Use this configuration instead of the defaults
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Talk to the testing server
    pub fn testing(mut self, testing: bool) -> Self {
        self.testing = testing;
        self
    }

    /// Hostname reported when creating buckets
    pub fn hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    /// Replace the HTTP transport
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Directory holding the durable queue (default `Config::queue_dir()`)
    pub fn queue_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.queue_dir = Some(dir.into());
        self
    }

    /// Replace the heartbeat merge rule used by queue compaction
    pub fn merge(mut self, merge: MergeFn) -> Self {
        self.merge = Some(merge);
        self
    }

    pub fn build(self) -> Result<Client> {
        if self.name.trim().is_empty() {
            return Err(Error::Config("client name must not be empty".to_string()));
        }
        self.config.queue.validate()?;

        let transport = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HttpTransport::new(self.config.server_for(self.testing))?),
        };
        let queue_dir = self.queue_dir.unwrap_or_else(Config::queue_dir);

        let mut client = Client {
            identity: ClientIdentity {
                name: self.name.clone(),
                hostname: self.hostname.unwrap_or_else(local_hostname),
            },
            transport,
            buckets: Arc::new(RwLock::new(Vec::new())),
            queue_path: store_path(&queue_dir, &self.name),
            queue_config: self.config.queue,
            merge: self.merge.unwrap_or_else(default_merge),
            request_queue: None,
        };
        client.request_queue = Some(client.open_queue()?);
        Ok(client)
    }
}

/// Synchronous client with an optional background request queue
pub struct Client {
    identity: ClientIdentity,
    transport: Arc<dyn Transport>,
    buckets: BucketRegistry,
    queue_path: PathBuf,
    queue_config: QueueConfig,
    merge: MergeFn,
    // Always `Some` after `build`; an `Option` so `disconnect` can swap it.
    request_queue: Option<RequestQueue>,
}

impl Client {
    pub fn builder(name: impl Into<String>) -> ClientBuilder {
        ClientBuilder {
            name: name.into(),
            testing: false,
            config: Config::default(),
            hostname: None,
            transport: None,
            queue_dir: None,
            merge: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.identity.name
    }

    pub fn hostname(&self) -> &str {
        &self.identity.hostname
    }

    /// Location of this client's durable queue
    pub fn queue_path(&self) -> &PathBuf {
        &self.queue_path
    }

    // ============================================
    // Server info and events
    // ============================================

    /// Server info (hostname, version, testing flag)
    pub fn get_info(&self) -> Result<Value> {
        self.transport.get("info", &[])
    }

    /// Events in a bucket, newest first
    pub fn get_events(
        &self,
        bucket_id: &str,
        limit: Option<usize>,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Vec<Event>> {
        let endpoint = format!("buckets/{}/events", encode(bucket_id));

        let mut params = Vec::new();
        if let Some(limit) = limit {
            params.push(("limit", limit.to_string()));
        }
        push_range(&mut params, start, end);

        let events = self.transport.get(&endpoint, &params)?;
        Ok(serde_json::from_value(events)?)
    }

    /// Insert a single event and return it as stored by the server
    pub fn insert_event(&self, bucket_id: &str, event: &Event) -> Result<Event> {
        let endpoint = format!("buckets/{}/events", encode(bucket_id));
        let stored = self.transport.post(&endpoint, &event.to_json(), &[])?;
        Event::from_json(&stored)
    }

    pub fn insert_events(&self, bucket_id: &str, events: &[Event]) -> Result<()> {
        let endpoint = format!("buckets/{}/events", encode(bucket_id));
        let payload = Value::Array(events.iter().map(Event::to_json).collect());
        self.transport.post(&endpoint, &payload, &[])?;
        Ok(())
    }

    /// Number of events in a bucket within an optional time range
    pub fn get_event_count(
        &self,
        bucket_id: &str,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<i64> {
        let endpoint = format!("buckets/{}/events/count", encode(bucket_id));
        let mut params = Vec::new();
        push_range(&mut params, start, end);

        let count = self.transport.get(&endpoint, &params)?;
        count
            .as_i64()
            .or_else(|| count.as_str().and_then(|s| s.trim().parse().ok()))
            .ok_or_else(|| Error::transport(None, format!("unexpected event count: {}", count)))
    }

    /// Send a heartbeat, merging with the bucket's last event on the server.
    ///
    /// With `queued = true` the heartbeat goes to the durable queue and this
    /// returns `Ok(None)` as soon as it is stored; delivery failures are
    /// handled by the worker and never reach the caller.
    pub fn heartbeat(
        &self,
        bucket_id: &str,
        event: &Event,
        pulsetime: f64,
        queued: bool,
    ) -> Result<Option<Event>> {
        let endpoint = format!(
            "buckets/{}/heartbeat?pulsetime={}",
            encode(bucket_id),
            pulsetime
        );

        if queued {
            self.queue()?.add_request(&endpoint, event.to_json())?;
            return Ok(None);
        }

        let merged = self.transport.post(&endpoint, &event.to_json(), &[])?;
        Ok(Some(Event::from_json(&merged)?))
    }

    // ============================================
    // Buckets
    // ============================================

    /// Buckets on the server keyed by id
    pub fn get_buckets(&self) -> Result<HashMap<String, BucketInfo>> {
        let listing = self.transport.get("buckets/", &[])?;
        Ok(serde_json::from_value(listing)?)
    }

    /// Create a bucket.
    ///
    /// With `queued = true` the bucket is only registered; the queue worker
    /// creates it (if missing) every time it connects.
    pub fn create_bucket(&self, bucket_id: &str, event_type: &str, queued: bool) -> Result<()> {
        if queued {
            let mut buckets = self.buckets.write().unwrap();
            if !buckets.iter().any(|b| b.id == bucket_id) {
                buckets.push(Bucket {
                    id: bucket_id.to_string(),
                    event_type: event_type.to_string(),
                });
            }
            return Ok(());
        }

        let endpoint = format!("buckets/{}", encode(bucket_id));
        let payload = json!({
            "client": self.identity.name,
            "hostname": self.identity.hostname,
            "type": event_type,
        });
        self.transport.post(&endpoint, &payload, &[])?;
        Ok(())
    }

    pub fn delete_bucket(&self, bucket_id: &str) -> Result<()> {
        let endpoint = format!("buckets/{}", encode(bucket_id));
        self.transport.delete(&endpoint, &json!({}))?;
        Ok(())
    }

    /// Buckets registered for creation by the queue worker
    pub fn registered_buckets(&self) -> Vec<Bucket> {
        self.buckets.read().unwrap().clone()
    }

    // ============================================
    // Query
    // ============================================

    /// Run a server-side query over one or more time periods.
    ///
    /// Caching a result requires a query `name`.
    pub fn query(
        &self,
        query: &str,
        timeperiods: &[(DateTime<Utc>, DateTime<Utc>)],
        name: Option<&str>,
        cache: bool,
    ) -> Result<Value> {
        let name = name.unwrap_or_default();
        if cache && name.is_empty() {
            return Err(Error::Config(
                "a query must be named to be cached".to_string(),
            ));
        }

        let periods: Vec<String> = timeperiods
            .iter()
            .map(|(start, end)| format!("{}/{}", start.to_rfc3339(), end.to_rfc3339()))
            .collect();
        let lines: Vec<&str> = query.lines().collect();
        let payload = json!({ "query": lines, "timeperiods": periods });
        let params = [("name", name.to_string()), ("cache", u8::from(cache).to_string())];

        self.transport.post("query/", &payload, &params)
    }

    // ============================================
    // Queue lifecycle
    // ============================================

    /// Start the background queue worker if it is not running
    pub fn connect(&mut self) -> Result<()> {
        self.queue_mut()?.start()
    }

    /// Stop the worker and replace it with a fresh, unstarted queue on the
    /// same store, so a later `connect` resumes where this one stopped.
    ///
    /// Returns the stopped worker's stats, or the store error that killed it.
    pub fn disconnect(&mut self) -> Result<Option<DispatchStats>> {
        let mut old = self
            .request_queue
            .take()
            .ok_or(Error::QueueStopped)?;
        old.stop();
        let joined = old.join();
        drop(old);

        self.request_queue = Some(self.open_queue()?);
        joined
    }

    /// State of the background queue
    pub fn queue_status(&self) -> Result<QueueStatus> {
        self.queue()?.status()
    }

    /// Number of requests waiting for delivery
    pub fn queued_len(&self) -> Result<usize> {
        self.queue()?.len()
    }

    fn queue(&self) -> Result<&RequestQueue> {
        self.request_queue.as_ref().ok_or(Error::QueueStopped)
    }

    fn queue_mut(&mut self) -> Result<&mut RequestQueue> {
        self.request_queue.as_mut().ok_or(Error::QueueStopped)
    }

    fn open_queue(&self) -> Result<RequestQueue> {
        RequestQueue::open(
            &self.queue_path,
            Arc::clone(&self.transport),
            Arc::clone(&self.buckets),
            self.identity.clone(),
            Arc::clone(&self.merge),
            self.queue_config.clone(),
        )
    }
}

fn encode(segment: &str) -> std::borrow::Cow<'_, str> {
    urlencoding::encode(segment)
}

fn push_range(
    params: &mut Vec<(&'static str, String)>,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
) {
    if let Some(start) = start {
        params.push(("start", start.to_rfc3339()));
    }
    if let Some(end) = end {
        params.push(("end", end.to_rfc3339()));
    }
}

/// Best-effort name of this machine
fn local_hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .ok()
        .or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .ok()
                .map(|s| s.trim().to_string())
        })
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}
