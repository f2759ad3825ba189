//! Digital twin instance.
//!
//! A [`DigitalTwin`] owns one cache, composer, lifecycle machine and metrics
//! sink. Nothing is shared between instances. Inbound messages go through
//! [`DigitalTwin::handle_message`]; the periodic ODTE evaluation is
//! [`DigitalTwin::run_cycle`], driven either by the caller or by the tokio task
//! returned from [`DigitalTwin::spawn_monitor`].

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::cache::{CacheStats, TimelinessCache};
use crate::clock::{Clock, SystemClock};
use crate::composer::{ComposeOutcome, ComposerStatus, TelemetryComposer};
use crate::config::{ConfigUpdate, TwinConfig};
use crate::error::{Result, TwinError};
use crate::lifecycle::{Evaluation, LifecycleMachine, LifecycleSnapshot, LifecycleState, Transition};
use crate::metrics::{MetricsSink, NoopSink};
use crate::odte::{AvailabilitySource, ConstantAvailability, OdteEstimator, OdteResult};
use crate::telemetry::{InboundMessage, OutboundMessage};

/// Outcome of one periodic evaluation.
#[derive(Debug)]
pub enum CycleOutcome {
    Evaluated {
        result: OdteResult,
        transition: Option<Transition>,
    },
    /// The estimator failed; lifecycle state was left untouched.
    Skipped(TwinError),
}

impl CycleOutcome {
    pub fn result(&self) -> Option<&OdteResult> {
        match self {
            Self::Evaluated { result, .. } => Some(result),
            Self::Skipped(_) => None,
        }
    }

    pub fn transition(&self) -> Option<&Transition> {
        match self {
            Self::Evaluated { transition, .. } => transition.as_ref(),
            Self::Skipped(_) => None,
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    messages: AtomicU64,
    rejected: AtomicU64,
    emitted: AtomicU64,
    cycles: AtomicU64,
    skipped_cycles: AtomicU64,
}

/// Snapshot for status endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct TwinStatus {
    pub digital_twin_id: String,
    pub target_device_id: String,
    pub state: LifecycleState,
    pub lifecycle: LifecycleSnapshot,
    pub odte: Option<OdteResult>,
    pub target_percentile: f64,
    pub cache: CacheStats,
    pub composer: ComposerStatus,
    pub messages: u64,
    pub rejected: u64,
    pub emitted: u64,
    pub cycles: u64,
    pub skipped_cycles: u64,
    pub uptime_ms: i64,
}

/// Builder for [`DigitalTwin`].
pub struct TwinBuilder {
    config: TwinConfig,
    sink: Arc<dyn MetricsSink>,
    clock: Arc<dyn Clock>,
    availability: Box<dyn AvailabilitySource>,
}

impl TwinBuilder {
    pub fn sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn availability(mut self, availability: Box<dyn AvailabilitySource>) -> Self {
        self.availability = availability;
        self
    }

    /// Validate the configuration and assemble the twin in `Started`.
    pub fn build(self) -> Result<DigitalTwin> {
        self.config.validate()?;
        let now = self.clock.now_ms();
        let cache = Arc::new(TimelinessCache::new(self.config.cache.retention_ms()));
        Ok(DigitalTwin {
            composer: TelemetryComposer::new(Arc::clone(&cache), Arc::clone(&self.sink)),
            lifecycle: LifecycleMachine::new(Arc::clone(&self.sink), now),
            estimator: OdteEstimator::new(self.availability),
            cache,
            sink: self.sink,
            clock: self.clock,
            config: RwLock::new(self.config),
            created_at_ms: now,
            last_odte: Mutex::new(None),
            outbound: Mutex::new(BTreeMap::new()),
            counters: Counters::default(),
        })
    }
}

pub struct DigitalTwin {
    config: RwLock<TwinConfig>,
    clock: Arc<dyn Clock>,
    cache: Arc<TimelinessCache>,
    composer: TelemetryComposer,
    lifecycle: LifecycleMachine,
    estimator: OdteEstimator,
    sink: Arc<dyn MetricsSink>,
    created_at_ms: i64,
    last_odte: Mutex<Option<OdteResult>>,
    outbound: Mutex<BTreeMap<String, OutboundMessage>>,
    counters: Counters,
}

fn relock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl DigitalTwin {
    pub fn builder(config: TwinConfig) -> TwinBuilder {
        TwinBuilder {
            config,
            sink: Arc::new(NoopSink),
            clock: Arc::new(SystemClock),
            availability: Box::new(ConstantAvailability::default()),
        }
    }

    /// Twin with the system clock and constant availability.
    pub fn new(config: TwinConfig, sink: Arc<dyn MetricsSink>) -> Result<Self> {
        Self::builder(config).sink(sink).build()
    }

    pub fn config(&self) -> TwinConfig {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn id(&self) -> String {
        self.config().digital_twin_id
    }

    pub fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    pub fn cache(&self) -> &TimelinessCache {
        &self.cache
    }

    pub fn state(&self) -> LifecycleState {
        self.lifecycle.current()
    }

    pub fn last_odte(&self) -> Option<OdteResult> {
        *relock(&self.last_odte)
    }

    /// Bridge is up: `Started → Unbound`, and export the static gauges.
    pub fn start(&self) -> Option<Transition> {
        let cfg = self.config();
        self.sink.set_expected_msg_rate(cfg.odte.expected_msg_sec);
        self.sink
            .set_physical_asset_uptime(self.estimator.availability());
        log::info!(
            "twin {} bridging device {}",
            cfg.digital_twin_id,
            cfg.target_device_id
        );
        self.lifecycle.begin_bridging(self.clock.now_ms())
    }

    /// Compose one inbound message. The first emitted record binds the twin.
    pub fn handle_message(&self, msg: &InboundMessage) -> Result<ComposeOutcome> {
        self.counters.messages.fetch_add(1, Ordering::Relaxed);
        let settings = self
            .config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .composition
            .clone();

        let now = self.clock.now_ms();
        let outcome = match self.composer.compose(msg, &settings, now) {
            Ok(o) => o,
            Err(e) => {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                log::warn!("dropping message on {}: {e}", msg.topic);
                return Err(e);
            }
        };

        if let ComposeOutcome::Emitted(out) = &outcome {
            self.counters.emitted.fetch_add(1, Ordering::Relaxed);
            relock(&self.outbound).insert(out.topic.clone(), out.clone());
            self.lifecycle.mark_bound(now);
        }
        Ok(outcome)
    }

    /// Latest record emitted on `topic`.
    pub fn outbound(&self, topic: &str) -> Option<OutboundMessage> {
        relock(&self.outbound).get(topic).cloned()
    }

    /// Latest record per output topic.
    pub fn outbound_all(&self) -> Vec<OutboundMessage> {
        relock(&self.outbound).values().cloned().collect()
    }

    /// One periodic evaluation: read the window, estimate, advance the lifecycle.
    pub fn run_cycle(&self) -> CycleOutcome {
        self.counters.cycles.fetch_add(1, Ordering::Relaxed);
        let now = self.clock.now_ms();
        let (params, window_ms, target, threshold) = {
            let cfg = self.config.read().unwrap_or_else(PoisonError::into_inner);
            (
                cfg.odte_params(),
                cfg.window_ms(),
                cfg.odte.target_percentile,
                cfg.lifecycle.unbound_threshold_ms,
            )
        };

        self.cache.purge_expired(now);
        let samples = self.cache.delays(now - window_ms, now, now);

        let result = match self.estimator.estimate(&samples, &params) {
            Ok(r) => r,
            Err(e) => {
                self.counters.skipped_cycles.fetch_add(1, Ordering::Relaxed);
                if e.is_transient() {
                    log::debug!("odte cycle skipped: {e}");
                } else {
                    log::warn!("odte cycle skipped: {e}");
                }
                return CycleOutcome::Skipped(e);
            }
        };

        log::debug!(
            "odte={:.4} (t={:.4} r={:.4} a={:.4}, n={})",
            result.odte,
            result.timeliness,
            result.reliability,
            result.availability,
            result.samples
        );
        self.sink.set_odte(&result);
        *relock(&self.last_odte) = Some(result);

        let last_seen = self
            .cache
            .last_observation_ms()
            .unwrap_or(self.created_at_ms);
        let eval = Evaluation {
            odte: result.odte,
            target_percentile: target,
            silence_ms: now - last_seen,
            unbound_threshold_ms: threshold,
        };
        let transition = self.lifecycle.evaluate(&eval, now);
        CycleOutcome::Evaluated { result, transition }
    }

    /// Apply a runtime configuration update. Returns the fields that changed.
    pub fn update_config(&self, update: &ConfigUpdate) -> Vec<&'static str> {
        let (applied, rate) = {
            let mut cfg = self.config.write().unwrap_or_else(PoisonError::into_inner);
            (update.apply(&mut cfg), cfg.odte.expected_msg_sec)
        };
        if applied.contains(&"expected_msg_sec") {
            self.sink.set_expected_msg_rate(rate);
        }
        if !applied.is_empty() {
            log::info!("config updated: {}", applied.join(", "));
        }
        applied
    }

    pub fn status(&self) -> TwinStatus {
        let cfg = self.config();
        let lifecycle = self.lifecycle.snapshot();
        TwinStatus {
            digital_twin_id: cfg.digital_twin_id,
            target_device_id: cfg.target_device_id,
            state: lifecycle.state,
            lifecycle,
            odte: self.last_odte(),
            target_percentile: cfg.odte.target_percentile,
            cache: self.cache.stats(),
            composer: self.composer.status(),
            messages: self.counters.messages.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            emitted: self.counters.emitted.load(Ordering::Relaxed),
            cycles: self.counters.cycles.load(Ordering::Relaxed),
            skipped_cycles: self.counters.skipped_cycles.load(Ordering::Relaxed),
            uptime_ms: self.clock.now_ms() - self.created_at_ms,
        }
    }

    /// Spawn the periodic evaluation task on the current tokio runtime.
    ///
    /// The first cycle runs after `startup_delay_ms + cycle_period_ms`.
    pub fn spawn_monitor(self: &Arc<Self>) -> MonitorHandle {
        let (period, delay) = {
            let cfg = self.config.read().unwrap_or_else(PoisonError::into_inner);
            (
                Duration::from_millis(cfg.lifecycle.cycle_period_ms.max(1)),
                Duration::from_millis(cfg.lifecycle.startup_delay_ms),
            )
        };
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let twin = Arc::clone(self);

        let task = tokio::spawn(async move {
            let first = tokio::time::Instant::now() + delay + period;
            let mut ticker = tokio::time::interval_at(first, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        twin.run_cycle();
                    }
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            log::debug!("monitor for twin {} stopped", twin.id());
        });

        MonitorHandle { stop_tx, task }
    }
}

/// Handle to a running monitor task.
pub struct MonitorHandle {
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl MonitorHandle {
    /// Stop the timer and wait for the task to exit. An evaluation already in
    /// progress completes first.
    pub async fn stop(self) {
        let _ = self.stop_tx.send(true);
        if let Err(e) = self.task.await {
            log::warn!("monitor task ended abnormally: {e}");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}
