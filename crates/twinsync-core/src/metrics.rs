//! Metrics export.
//!
//! The core reports through the [`MetricsSink`] trait and never depends on a
//! concrete exporter. Calls are fire-and-forget: a sink must not block for
//! long and has no way to reject an update.
//!
//! Provided sinks:
//! - [`NoopSink`]: discards everything
//! - [`MemorySink`]: keeps the latest values plus a bounded history
//! - [`FanoutSink`]: forwards to several sinks
//! - [`crate::exporter::PrometheusSink`]: Prometheus registry with text exposition
//! - [`crate::session::SessionSink`]: CSV session recording

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;

use crate::lifecycle::LifecycleState;
use crate::odte::OdteResult;

/// Receiver of twin measurements.
pub trait MetricsSink: Send + Sync {
    /// One propagation-delay observation, keyed by its physical timestamp.
    fn observe_delay(&self, physical_ts_ms: i64, delay_sec: f64);

    /// The lifecycle state just changed (or was initialised) to `state`.
    fn set_lifecycle_state(&self, state: LifecycleState);

    /// A new ODTE evaluation is available.
    fn set_odte(&self, result: &OdteResult);

    /// Configured expected message rate (messages per second).
    fn set_expected_msg_rate(&self, _msg_per_sec: f64) {}

    /// Physical asset uptime ratio in `[0, 1]`.
    fn set_physical_asset_uptime(&self, _uptime: f64) {}
}

/// Discards every update.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl MetricsSink for NoopSink {
    fn observe_delay(&self, _physical_ts_ms: i64, _delay_sec: f64) {}
    fn set_lifecycle_state(&self, _state: LifecycleState) {}
    fn set_odte(&self, _result: &OdteResult) {}
}

// ---------------------------------------------------------------------------
// In-memory sink
// ---------------------------------------------------------------------------

/// Default number of delay observations a [`MemorySink`] keeps.
pub const DEFAULT_DELAY_HISTORY: usize = 4096;

/// Copy of everything a [`MemorySink`] has seen.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    pub lifecycle_state: Option<LifecycleState>,
    pub state_history: Vec<LifecycleState>,
    pub odte: Option<OdteResult>,
    pub odte_updates: u64,
    /// Most recent `(physical_ts_ms, delay_sec)` pairs, oldest first.
    pub delays: Vec<(i64, f64)>,
    pub delay_count: u64,
    pub expected_msg_rate: Option<f64>,
    pub physical_asset_uptime: Option<f64>,
}

#[derive(Debug, Default)]
struct MemoryState {
    lifecycle_state: Option<LifecycleState>,
    state_history: VecDeque<LifecycleState>,
    odte: Option<OdteResult>,
    odte_updates: u64,
    delays: VecDeque<(i64, f64)>,
    delay_count: u64,
    expected_msg_rate: Option<f64>,
    physical_asset_uptime: Option<f64>,
}

/// Keeps the latest gauge values plus bounded delay and state histories in
/// memory. Both histories keep the most recent `capacity` entries.
#[derive(Debug)]
pub struct MemorySink {
    capacity: usize,
    state: Mutex<MemoryState>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_DELAY_HISTORY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(MemoryState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let s = self.lock();
        MetricsSnapshot {
            lifecycle_state: s.lifecycle_state,
            state_history: s.state_history.iter().copied().collect(),
            odte: s.odte,
            odte_updates: s.odte_updates,
            delays: s.delays.iter().copied().collect(),
            delay_count: s.delay_count,
            expected_msg_rate: s.expected_msg_rate,
            physical_asset_uptime: s.physical_asset_uptime,
        }
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsSink for MemorySink {
    fn observe_delay(&self, physical_ts_ms: i64, delay_sec: f64) {
        let mut s = self.lock();
        if s.delays.len() == self.capacity {
            s.delays.pop_front();
        }
        s.delays.push_back((physical_ts_ms, delay_sec));
        s.delay_count += 1;
    }

    fn set_lifecycle_state(&self, state: LifecycleState) {
        let mut s = self.lock();
        s.lifecycle_state = Some(state);
        if s.state_history.len() == self.capacity {
            s.state_history.pop_front();
        }
        s.state_history.push_back(state);
    }

    fn set_odte(&self, result: &OdteResult) {
        let mut s = self.lock();
        s.odte = Some(*result);
        s.odte_updates += 1;
    }

    fn set_expected_msg_rate(&self, msg_per_sec: f64) {
        self.lock().expected_msg_rate = Some(msg_per_sec);
    }

    fn set_physical_asset_uptime(&self, uptime: f64) {
        self.lock().physical_asset_uptime = Some(uptime);
    }
}

// ---------------------------------------------------------------------------
// Fan-out
// ---------------------------------------------------------------------------

/// Forwards every update to each inner sink in order.
#[derive(Default)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn MetricsSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn push(&mut self, sink: Arc<dyn MetricsSink>) {
        self.sinks.push(sink);
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl MetricsSink for FanoutSink {
    fn observe_delay(&self, physical_ts_ms: i64, delay_sec: f64) {
        for s in &self.sinks {
            s.observe_delay(physical_ts_ms, delay_sec);
        }
    }

    fn set_lifecycle_state(&self, state: LifecycleState) {
        for s in &self.sinks {
            s.set_lifecycle_state(state);
        }
    }

    fn set_odte(&self, result: &OdteResult) {
        for s in &self.sinks {
            s.set_odte(result);
        }
    }

    fn set_expected_msg_rate(&self, msg_per_sec: f64) {
        for s in &self.sinks {
            s.set_expected_msg_rate(msg_per_sec);
        }
    }

    fn set_physical_asset_uptime(&self, uptime: f64) {
        for s in &self.sinks {
            s.set_physical_asset_uptime(uptime);
        }
    }
}
