//! # beacon-core
//!
//! Core library for beacon - an offline-tolerant client for activity
//! tracking servers.
//!
//! This library provides:
//! - A synchronous client for the server's REST API
//! - A durable, crash-safe request queue for heartbeats
//! - Heartbeat compaction before queued requests are sent
//! - Configuration management
//! - Logging infrastructure
//!
//! ## Architecture
//!
//! Requests flow through two paths:
//! - **Direct:** `Client` → `Transport` → server; errors go to the caller
//! - **Queued:** `Client` → `RequestStore` (SQLite) → `DispatchLoop` → server;
//!   failures are retried by the background worker
//!
//! ## Example
//!
//! ```rust,no_run
//! use beacon_core::{Client, Config};
//!
//! let config = Config::load().expect("failed to load config");
//! let mut client = Client::builder("watcher-window")
//!     .config(config)
//!     .build()
//!     .expect("failed to build client");
//! client.connect().expect("failed to start request queue");
//! ```

// Re-export commonly used items at the crate root
pub use client::{Client, ClientBuilder};
pub use config::Config;
pub use error::{Error, Result, StoreError};
pub use queue::{ConnectionState, QueueStatus, QueuedRequest, RequestQueue, RequestStore};
pub use transport::{HttpTransport, Transport};
pub use types::*;

// Public modules
pub mod client;
pub mod config;
pub mod error;
pub mod logging;
pub mod queue;
pub mod transport;
pub mod types;
