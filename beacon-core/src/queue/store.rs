//! Durable FIFO of requests awaiting delivery
//!
//! Backed by one SQLite file per `(client, format version)`. Every `put`
//! commits before returning (WAL, `synchronous = FULL`), and a request is
//! deleted only by `complete`, so a crash between send and acknowledgment
//! leaves the request at the head of the queue.

use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};
use sha2::{Digest, Sha256};

use crate::error::{Result, StoreError};

use super::QueuedRequest;

/// How long a writer waits for the other handle's transaction to finish
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// A queued request together with its row identity
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRequest {
    /// Row id, monotonically increasing in enqueue order
    pub id: i64,
    /// Stable id for correlating log lines across retries and restarts
    pub request_id: String,
    pub request: QueuedRequest,
}

/// Crash-safe FIFO store with a peek/complete cursor
pub struct RequestStore {
    conn: Mutex<Connection>,
    /// The peeked-but-not-completed head, if any
    current: Mutex<Option<StoredRequest>>,
}

impl RequestStore {
    /// Open or create a store at the given path
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(StoreError::from)?;
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = FULL;
            ",
        )?;
        super::schema::run_migrations(&conn)?;

        tracing::debug!(path = %path.display(), "Opened request queue store");

        Ok(Self {
            conn: Mutex::new(conn),
            current: Mutex::new(None),
        })
    }

    /// Open an in-memory store (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        super::schema::run_migrations(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            current: Mutex::new(None),
        })
    }

    /// Append a request. Returns once the write is committed.
    pub fn put(&self, request: &QueuedRequest) -> Result<i64> {
        let payload = serde_json::to_string(&request.payload)?;
        let checksum = checksum(&request.endpoint, &payload);
        let request_id = uuid::Uuid::new_v4().to_string();

        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO requests (request_id, endpoint, payload, checksum, enqueued_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                request_id,
                request.endpoint,
                payload,
                checksum,
                Utc::now().to_rfc3339()
            ],
        )?;
        let id = conn.last_insert_rowid();

        tracing::trace!(id, %request_id, endpoint = %request.endpoint, "Queued request");
        Ok(id)
    }

    /// Oldest request not yet completed, without removing it.
    ///
    /// Repeated calls return the same request until `complete` is called.
    pub fn peek(&self) -> Result<Option<QueuedRequest>> {
        Ok(self.peek_entry()?.map(|entry| entry.request))
    }

    /// Like `peek`, but includes the row identity
    pub fn peek_entry(&self) -> Result<Option<StoredRequest>> {
        let mut current = self.current.lock().unwrap();
        if let Some(entry) = current.as_ref() {
            return Ok(Some(entry.clone()));
        }

        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT id, request_id, endpoint, payload, checksum FROM requests ORDER BY id LIMIT 1",
                [],
                RawRow::from_row,
            )
            .optional()?;
        drop(conn);

        let entry = match row {
            Some(raw) => raw.decode()?,
            None => return Ok(None),
        };
        *current = Some(entry.clone());
        Ok(Some(entry))
    }

    /// Remove the previously peeked request.
    ///
    /// Without a prior `peek` this is a no-op and returns `false`.
    pub fn complete(&self) -> Result<bool> {
        let mut current = self.current.lock().unwrap();
        let entry = match current.take() {
            Some(entry) => entry,
            None => return Ok(false),
        };

        let conn = self.conn.lock().unwrap();
        let removed = conn.execute("DELETE FROM requests WHERE id = ?1", [entry.id])?;
        if removed == 0 {
            tracing::warn!(
                id = entry.id,
                request_id = %entry.request_id,
                "Completed request was already gone from the queue"
            );
        }
        Ok(removed > 0)
    }

    /// Number of requests waiting, including a peeked one
    pub fn len(&self) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM requests", [], |r| r.get(0))?;
        Ok(count as usize)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// All queued requests in FIFO order
    pub fn snapshot(&self) -> Result<Vec<StoredRequest>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, request_id, endpoint, payload, checksum FROM requests ORDER BY id",
        )?;
        let rows = stmt
            .query_map([], RawRow::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter().map(RawRow::decode).collect()
    }

    /// Atomically replace a run of rows with fewer requests.
    ///
    /// `ids` must be the ascending row ids of the run. The replacements are
    /// written into the first `replacement.len()` rows and the remaining rows
    /// are deleted, so the run keeps its place in the queue. Clears the
    /// cursor afterwards.
    pub fn replace_run(&self, ids: &[i64], replacement: &[QueuedRequest]) -> Result<()> {
        debug_assert!(replacement.len() <= ids.len());

        let mut current = self.current.lock().unwrap();
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        for (id, request) in ids.iter().zip(replacement) {
            let payload = serde_json::to_string(&request.payload)?;
            let checksum = checksum(&request.endpoint, &payload);
            tx.execute(
                "UPDATE requests SET endpoint = ?1, payload = ?2, checksum = ?3 WHERE id = ?4",
                params![request.endpoint, payload, checksum, id],
            )?;
        }
        for id in &ids[replacement.len().min(ids.len())..] {
            tx.execute("DELETE FROM requests WHERE id = ?1", [id])?;
        }

        tx.commit()?;
        *current = None;
        Ok(())
    }
}

/// Row as read from SQLite, before checksum verification
struct RawRow {
    id: i64,
    request_id: String,
    endpoint: String,
    payload: String,
    checksum: String,
}

impl RawRow {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            request_id: row.get(1)?,
            endpoint: row.get(2)?,
            payload: row.get(3)?,
            checksum: row.get(4)?,
        })
    }

    fn decode(self) -> Result<StoredRequest> {
        if checksum(&self.endpoint, &self.payload) != self.checksum {
            return Err(StoreError::Corrupt {
                id: self.id,
                reason: "checksum mismatch".to_string(),
            }
            .into());
        }

        let payload = serde_json::from_str(&self.payload).map_err(|e| StoreError::Corrupt {
            id: self.id,
            reason: format!("payload is not JSON: {}", e),
        })?;

        Ok(StoredRequest {
            id: self.id,
            request_id: self.request_id,
            request: QueuedRequest {
                endpoint: self.endpoint,
                payload,
            },
        })
    }
}

/// 32-char hex digest of SHA-256(endpoint + "\n" + payload)
fn checksum(endpoint: &str, payload: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(endpoint.as_bytes());
    hasher.update(b"\n");
    hasher.update(payload.as_bytes());
    let result = hasher.finalize();

    hex::encode(&result[..16])
}
