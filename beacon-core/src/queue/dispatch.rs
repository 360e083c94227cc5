//! The dispatch loop: background state machine that drains the queue
//!
//! ```text
//!            probe ok                      post failed
//! Disconnected ──────────▶ Connected ─────────────────▶ Disconnected
//!     │  ▲ probe failed:       │  ▲ post ok: complete, loop
//!     │  └─ wait reconnect     │  └─ empty: wait poll
//!     └──── stop ──▶ Stopped ◀─┘ stop
//! ```
//!
//! Every wait goes through [`StopSignal::wait`], so a stop request is seen
//! within one reconnect/poll interval. An HTTP call already in flight is
//! allowed to finish.

use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::config::QueueConfig;
use crate::error::Result;
use crate::transport::Transport;
use crate::types::MergeFn;

use super::compactor::compact_store;
use super::prober::ConnectionProber;
use super::store::RequestStore;

/// Connection state owned by the dispatch loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
    /// Terminal; reached only through the stop signal or a fatal store error
    Stopped,
}

/// What a single [`DispatchLoop::step`] did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Probe succeeded, now connected
    Connected,
    /// Probe failed, waited one reconnect interval
    BackedOff,
    /// Head request delivered and removed
    Delivered,
    /// Queue empty, waited one poll interval
    Idle,
    /// Head request failed, now disconnected; the request stays queued
    DeliveryFailed,
    Stopped,
}

/// Counters for the lifetime of one dispatch loop
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DispatchStats {
    pub probes: usize,
    pub backoff_waits: usize,
    pub delivered: usize,
    pub delivery_failures: usize,
    /// Store compactions that rewrote at least one run
    pub compactions: usize,
    /// Requests removed by compaction
    pub requests_compacted: usize,
}

/// Externally visible state of a request queue
#[derive(Debug, Clone, PartialEq)]
pub struct QueueStatus {
    pub state: ConnectionState,
    pub stats: DispatchStats,
    /// Requests waiting in the store
    pub queued: usize,
    /// Set when the loop died on a store failure
    pub fatal_error: Option<String>,
}

impl Default for QueueStatus {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            stats: DispatchStats::default(),
            queued: 0,
            fatal_error: None,
        }
    }
}

/// Cooperative stop flag with interruptible waits
#[derive(Debug, Default)]
pub struct StopSignal {
    stopped: Mutex<bool>,
    cv: Condvar,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        let mut stopped = self.stopped.lock().unwrap();
        *stopped = true;
        self.cv.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        *self.stopped.lock().unwrap()
    }

    /// Sleep up to `timeout`. Returns true if stop was (or gets) requested.
    pub fn wait(&self, timeout: Duration) -> bool {
        let stopped = self.stopped.lock().unwrap();
        if *stopped || timeout.is_zero() {
            return *stopped;
        }
        let (stopped, _) = self
            .cv
            .wait_timeout_while(stopped, timeout, |stopped| !*stopped)
            .unwrap();
        *stopped
    }
}

/// Single-consumer worker that moves requests from the store to the server
pub struct DispatchLoop {
    store: Arc<RequestStore>,
    transport: Arc<dyn Transport>,
    prober: ConnectionProber,
    merge: MergeFn,
    config: QueueConfig,
    stop: Arc<StopSignal>,
    state: ConnectionState,
    stats: DispatchStats,
    status: Arc<Mutex<QueueStatus>>,
}

impl DispatchLoop {
    pub fn new(
        store: Arc<RequestStore>,
        transport: Arc<dyn Transport>,
        prober: ConnectionProber,
        merge: MergeFn,
        config: QueueConfig,
        stop: Arc<StopSignal>,
    ) -> Self {
        Self {
            store,
            transport,
            prober,
            merge,
            config,
            stop,
            state: ConnectionState::Disconnected,
            stats: DispatchStats::default(),
            status: Arc::new(Mutex::new(QueueStatus::default())),
        }
    }

    /// Publish state and stats into a shared status cell
    pub fn with_status(mut self, status: Arc<Mutex<QueueStatus>>) -> Self {
        self.status = status;
        self
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn stats(&self) -> &DispatchStats {
        &self.stats
    }

    /// Run until stopped.
    ///
    /// Transport failures never end the loop. A store failure does: it is
    /// logged, recorded in the shared status and returned.
    pub fn run(mut self) -> Result<DispatchStats> {
        tracing::debug!("Request queue worker started");
        loop {
            match self.step() {
                Ok(Step::Stopped) => break,
                Ok(_) => {}
                Err(e) => {
                    tracing::error!(error = %e, "Request queue store failed, worker stopping");
                    self.state = ConnectionState::Stopped;
                    let mut status = self.status.lock().unwrap();
                    status.state = self.state;
                    status.stats = self.stats.clone();
                    status.fatal_error = Some(e.to_string());
                    return Err(e);
                }
            }
        }
        tracing::debug!(stats = ?self.stats, "Request queue worker stopped");
        Ok(self.stats)
    }

    /// Perform one state transition
    pub fn step(&mut self) -> Result<Step> {
        let step = match self.state {
            ConnectionState::Stopped => Step::Stopped,
            _ if self.stop.is_stopped() => Step::Stopped,
            ConnectionState::Disconnected => self.step_disconnected()?,
            ConnectionState::Connected => self.step_connected()?,
        };
        if step == Step::Stopped {
            self.state = ConnectionState::Stopped;
        }

        let mut status = self.status.lock().unwrap();
        status.state = self.state;
        status.stats = self.stats.clone();
        Ok(step)
    }

    fn step_disconnected(&mut self) -> Result<Step> {
        self.stats.probes += 1;
        if self.prober.probe() {
            self.state = ConnectionState::Connected;
            if self.config.compact_on_reconnect {
                self.compact()?;
            }
            return Ok(Step::Connected);
        }

        let interval = self.config.reconnect_interval();
        tracing::warn!(
            queued = self.store.len()?,
            retry_in = ?interval,
            "Not connected to server"
        );

        self.stats.backoff_waits += 1;
        if self.stop.wait(interval) {
            return Ok(Step::Stopped);
        }
        Ok(Step::BackedOff)
    }

    fn step_connected(&mut self) -> Result<Step> {
        let entry = match self.store.peek_entry()? {
            Some(entry) => entry,
            None => {
                if self.stop.wait(self.config.poll_interval()) {
                    return Ok(Step::Stopped);
                }
                return Ok(Step::Idle);
            }
        };

        let request = &entry.request;
        match self.transport.post(&request.endpoint, &request.payload, &[]) {
            Ok(_) => {
                self.store.complete()?;
                self.stats.delivered += 1;
                tracing::trace!(request_id = %entry.request_id, endpoint = %request.endpoint, "Delivered queued request");
                Ok(Step::Delivered)
            }
            Err(e) => {
                self.state = ConnectionState::Disconnected;
                self.stats.delivery_failures += 1;
                tracing::warn!(
                    request_id = %entry.request_id,
                    error = %e,
                    "Failed to send request to server, will queue requests until connection is available"
                );
                Ok(Step::DeliveryFailed)
            }
        }
    }

    fn compact(&mut self) -> Result<()> {
        let report = compact_store(&self.store, &self.merge, self.config.default_pulsetime_secs)?;
        if report.runs_rewritten > 0 {
            self.stats.compactions += 1;
            self.stats.requests_compacted += report.before - report.after;
        }
        Ok(())
    }
}
