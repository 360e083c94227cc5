//! Error types for beacon-core

use thiserror::Error;

/// Main error type for the beacon-core library
#[derive(Error, Debug)]
pub enum Error {
    /// Network or HTTP failure talking to the server
    #[error("transport error{}: {message}", .status.map(|s| format!(" ({})", s)).unwrap_or_default())]
    Transport {
        /// HTTP status code, if the server answered at all
        status: Option<u16>,
        message: String,
    },

    /// Durable queue failure (fatal to the dispatch loop)
    #[error("queue store error: {0}")]
    Store(#[from] StoreError),

    /// Pulse tolerance could not be read from a heartbeat endpoint
    #[error("could not parse pulsetime from endpoint {endpoint:?}")]
    PulseParse { endpoint: String },

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding/decoding error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Only heartbeat requests may be queued
    #[error("endpoint {0:?} cannot be queued, only heartbeats are buffered")]
    NotQueueable(String),

    /// Queued payloads must be JSON objects
    #[error("queued payload must be a JSON object")]
    InvalidPayload,

    /// A request queue's worker cannot be started twice
    #[error("request queue worker already ran; open a new queue to resume")]
    QueueStopped,

    /// The background worker thread panicked
    #[error("request queue worker panicked")]
    WorkerPanicked,
}

impl Error {
    /// Build a transport error from a status code and message
    pub fn transport(status: Option<u16>, message: impl Into<String>) -> Self {
        Error::Transport {
            status,
            message: message.into(),
        }
    }

    /// True for failures the dispatch loop recovers from by reconnecting
    pub fn is_transport(&self) -> bool {
        matches!(self, Error::Transport { .. })
    }
}

/// Errors raised by the durable request store
#[derive(Error, Debug)]
pub enum StoreError {
    /// SQLite error
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO error while preparing the store location
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A stored row failed its checksum or could not be decoded
    #[error("corrupt queue entry {id}: {reason}")]
    Corrupt { id: i64, reason: String },
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::Store(StoreError::Database(err))
    }
}

/// Result type alias for beacon-core
pub type Result<T> = std::result::Result<T, Error>;
