//! Queue store schema and migrations
//!
//! Uses SQLite with embedded migrations managed via PRAGMA user_version.
//! This versions the table layout inside one store file; the request
//! format itself is versioned by the file name (see `QUEUE_FORMAT_VERSION`).

use rusqlite::Connection;

use crate::error::StoreError;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 1;

/// SQL migrations, indexed by version number
const MIGRATIONS: &[&str] = &[
    // Version 1: FIFO of requests awaiting delivery
    r#"
    CREATE TABLE IF NOT EXISTS requests (
        id               INTEGER PRIMARY KEY AUTOINCREMENT,
        request_id       TEXT NOT NULL,
        endpoint         TEXT NOT NULL,
        payload          JSON NOT NULL,
        checksum         TEXT NOT NULL,
        enqueued_at      DATETIME NOT NULL
    );
    "#,
];

/// Run all pending migrations
pub fn run_migrations(conn: &Connection) -> Result<(), StoreError> {
    let current_version: i32 = conn
        .query_row("PRAGMA user_version", [], |r| r.get(0))
        .unwrap_or(0);

    for (i, migration) in MIGRATIONS.iter().enumerate() {
        let version = (i + 1) as i32;
        if version > current_version {
            tracing::debug!(version, "Running queue migration");
            conn.execute_batch(migration)?;
            conn.execute(&format!("PRAGMA user_version = {}", version), [])?;
        }
    }

    Ok(())
}
