//! # twinsync-core
//!
//! **How closely is the twin tracking the device?**
//!
//! `twinsync-core` measures the synchronization quality of a digital twin. A
//! physical device streams telemetry through a bridge; for every message the
//! twin records the physical-to-digital propagation delay, and a periodic
//! evaluation turns the recent delays into an ODTE score (Observed Degree of
//! Twinning Effectiveness) that drives the twin's lifecycle state.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use twinsync_core::{DigitalTwin, InboundMessage, MemorySink, TwinConfig};
//!
//! let sink = Arc::new(MemorySink::new());
//! let twin = DigitalTwin::new(TwinConfig::default(), sink.clone()).unwrap();
//! twin.start();
//!
//! let now = twin.now_ms();
//! let payload = format!(
//!     r#"{{"type":"device_state","timestamp":{},"value":{{"temperature":21.5,"energy":2.0}}}}"#,
//!     now - 120
//! );
//! twin.handle_message(&InboundMessage::new("device_state", payload, now)).unwrap();
//!
//! let outcome = twin.run_cycle();
//! println!("state={} odte={:?}", twin.state(), outcome.result());
//! ```
//!
//! ## Architecture
//!
//! Inbound message → Composer (delay → Cache, aggregate → Outbound)
//!
//! Periodic cycle → Cache window → Estimator → Lifecycle → Metrics sink
//!
//! - [`TimelinessCache`]: delay samples keyed by physical timestamp, expiring
//!   a fixed time after their last write
//! - [`OdteEstimator`]: timeliness × reliability × availability
//! - [`LifecycleMachine`]: `Started → Unbound → Bound ⇄ Shadowed ⇄ UnSync`
//! - [`TelemetryComposer`]: single-value or composite windowed aggregation
//! - [`MetricsSink`]: where every measurement ends up (Prometheus, CSV
//!   session, memory)

pub mod cache;
pub mod clock;
pub mod composer;
pub mod config;
pub mod error;
pub mod exporter;
pub mod lifecycle;
pub mod metrics;
pub mod odte;
pub mod session;
pub mod telemetry;
pub mod twin;

pub use cache::{CacheStats, DelaySample, TimelinessCache};
pub use clock::{Clock, ManualClock, SystemClock, unix_ms_now};
pub use composer::{ComposeOutcome, ComposerStatus, TelemetryComposer};
pub use config::{
    BucketType, CompositionMode, ConfigUpdate, MetricsConfig, OutputFormat, TwinConfig,
};
pub use error::{Result, TwinError};
pub use exporter::PrometheusSink;
pub use lifecycle::{LifecycleMachine, LifecycleState, Transition, next_state};
pub use metrics::{FanoutSink, MemorySink, MetricsSink, MetricsSnapshot, NoopSink};
pub use odte::{AvailabilitySource, ConstantAvailability, OdteEstimator, OdteParams, OdteResult};
pub use session::{SessionConfig, SessionMeta, SessionSink, SessionWriter, list_sessions};
pub use telemetry::{AggregatedValue, InboundMessage, OutboundMessage, SenmlRecord, TelemetryRecord};
pub use twin::{CycleOutcome, DigitalTwin, MonitorHandle, TwinStatus};

/// Library version (from Cargo.toml).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
