//! Offline request queue
//!
//! Heartbeats sent with `queued = true` are written to a durable local store
//! and delivered by a background worker, so producers never block on the
//! network and nothing is lost while the server is down.
//!
//! ## Architecture
//!
//! - [`store::RequestStore`]: SQLite-backed FIFO with a peek/complete cursor
//! - [`prober::ConnectionProber`]: checks the server and creates registered buckets
//! - [`dispatch::DispatchLoop`]: the worker's connected/disconnected state machine
//! - [`compactor`]: merges buffered heartbeats before they are sent
//!
//! [`RequestQueue`] wires these together and owns the worker thread.

pub mod compactor;
pub mod dispatch;
pub mod prober;
pub mod schema;
pub mod store;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;

use serde::{Deserialize, Serialize};

use crate::config::QueueConfig;
use crate::error::{Error, Result};
use crate::transport::Transport;
use crate::types::MergeFn;

pub use dispatch::{ConnectionState, DispatchLoop, DispatchStats, QueueStatus, Step, StopSignal};
pub use prober::{ClientIdentity, ConnectionProber};
pub use store::{RequestStore, StoredRequest};

/// Bump whenever the stored request shape changes. Stores written with a
/// different version live in different files and are never read.
pub const QUEUE_FORMAT_VERSION: u32 = 1;

/// A request waiting for delivery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedRequest {
    /// Endpoint relative to the API root, including any query string
    pub endpoint: String,
    pub payload: serde_json::Value,
}

/// A bucket that must exist on the server before its heartbeats are sent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bucket {
    pub id: String,
    pub event_type: String,
}

/// Buckets registered by the producer, shared read-only with the worker
pub type BucketRegistry = Arc<RwLock<Vec<Bucket>>>;

/// Store file for a client: `{queue_dir}/{client}.v{QUEUE_FORMAT_VERSION}.db`
pub fn store_path(queue_dir: &Path, client_name: &str) -> PathBuf {
    queue_dir.join(format!("{}.v{}.db", client_name, QUEUE_FORMAT_VERSION))
}

/// Queue stores of the current format in `queue_dir`, as `(client, path)`
/// pairs sorted by client name.
///
/// Stores written by other format versions are skipped.
pub fn discover_stores(queue_dir: &Path) -> Result<Vec<(String, PathBuf)>> {
    let suffix = format!(".v{}.db", QUEUE_FORMAT_VERSION);
    let pattern = queue_dir.join(format!("*{}", suffix));
    let pattern_str = pattern.to_string_lossy();

    let entries = glob::glob(&pattern_str)
        .map_err(|e| Error::Config(format!("invalid queue directory pattern: {}", e)))?;

    let mut stores: Vec<(String, PathBuf)> = entries
        .flatten()
        .filter_map(|path| {
            let name = path.file_name()?.to_str()?.strip_suffix(&suffix)?.to_string();
            Some((name, path))
        })
        .collect();
    stores.sort();
    Ok(stores)
}

/// Durable queue plus the background worker draining it.
///
/// A queue runs its worker at most once. After [`RequestQueue::stop`] a new
/// `RequestQueue` must be opened on the same path to resume.
pub struct RequestQueue {
    client: String,
    store: Arc<RequestStore>,
    stop: Arc<StopSignal>,
    status: Arc<Mutex<QueueStatus>>,
    worker: Option<DispatchLoop>,
    handle: Option<JoinHandle<Result<DispatchStats>>>,
}

impl RequestQueue {
    /// Open the store at `path` and prepare (but not start) the worker
    pub fn open(
        path: &Path,
        transport: Arc<dyn Transport>,
        buckets: BucketRegistry,
        identity: ClientIdentity,
        merge: MergeFn,
        config: QueueConfig,
    ) -> Result<Self> {
        let store = Arc::new(RequestStore::open(path)?);
        Ok(Self::with_store(store, transport, buckets, identity, merge, config))
    }

    /// Build around an already opened store
    pub fn with_store(
        store: Arc<RequestStore>,
        transport: Arc<dyn Transport>,
        buckets: BucketRegistry,
        identity: ClientIdentity,
        merge: MergeFn,
        config: QueueConfig,
    ) -> Self {
        let stop = Arc::new(StopSignal::new());
        let status = Arc::new(Mutex::new(QueueStatus::default()));
        let client = identity.name.clone();
        let prober = ConnectionProber::new(Arc::clone(&transport), buckets, identity);
        let worker = DispatchLoop::new(
            Arc::clone(&store),
            transport,
            prober,
            merge,
            config,
            Arc::clone(&stop),
        )
        .with_status(Arc::clone(&status));

        Self {
            client,
            store,
            stop,
            status,
            worker: Some(worker),
            handle: None,
        }
    }

    /// Spawn the worker thread. A no-op while it is running.
    ///
    /// Everything the worker logs is inside a `queue` span carrying the
    /// client name.
    pub fn start(&mut self) -> Result<()> {
        if self.is_alive() {
            return Ok(());
        }
        let worker = self.worker.take().ok_or(Error::QueueStopped)?;
        let span = tracing::info_span!("queue", client = %self.client);

        let handle = std::thread::Builder::new()
            .name("beacon-queue".to_string())
            .spawn(move || span.in_scope(|| worker.run()))?;
        self.handle = Some(handle);
        Ok(())
    }

    /// True while the worker thread is running
    pub fn is_alive(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Ask the worker to stop after its current step
    pub fn stop(&self) {
        self.stop.stop();
    }

    /// Wait for the worker to finish.
    ///
    /// Returns the worker's stats, `None` if it was never started, or the
    /// store error that killed it.
    pub fn join(&mut self) -> Result<Option<DispatchStats>> {
        match self.handle.take() {
            Some(handle) => match handle.join() {
                Ok(result) => result.map(Some),
                Err(_) => Err(Error::WorkerPanicked),
            },
            None => Ok(None),
        }
    }

    /// Queue a heartbeat request. Returns once it is durably stored.
    pub fn add_request(&self, endpoint: &str, payload: serde_json::Value) -> Result<()> {
        if !compactor::endpoint_family(endpoint).ends_with("/heartbeat") {
            return Err(Error::NotQueueable(endpoint.to_string()));
        }
        if !payload.is_object() {
            return Err(Error::InvalidPayload);
        }

        self.store.put(&QueuedRequest {
            endpoint: endpoint.to_string(),
            payload,
        })?;
        Ok(())
    }

    /// Requests waiting for delivery
    pub fn len(&self) -> Result<usize> {
        self.store.len()
    }

    pub fn is_empty(&self) -> Result<bool> {
        self.store.is_empty()
    }

    /// Connection state, counters and queue depth
    pub fn status(&self) -> Result<QueueStatus> {
        let mut status = self.status.lock().unwrap().clone();
        status.queued = self.store.len()?;
        Ok(status)
    }
}

impl Drop for RequestQueue {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.stop();
            if let Err(e) = self.join() {
                tracing::warn!(error = %e, "Request queue worker ended with an error");
            }
        }
    }
}
