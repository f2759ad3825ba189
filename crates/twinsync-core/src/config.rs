//! Twin configuration.
//!
//! Loaded from a JSON file; every field has a default so a partial file (or
//! `{}`) is a valid configuration. [`TwinConfig::validate`] rejects values the
//! estimator cannot work with. A small subset can be changed at runtime
//! through [`ConfigUpdate`].

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TwinError};
use crate::odte::OdteParams;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TwinConfig {
    pub digital_twin_id: String,
    pub target_device_id: String,
    pub odte: OdteConfig,
    pub lifecycle: LifecycleConfig,
    pub composition: CompositionConfig,
    pub cache: CacheConfig,
    pub metrics: MetricsConfig,
    pub http: HttpConfig,
    pub recording: RecordingConfig,
}

impl Default for TwinConfig {
    fn default() -> Self {
        Self {
            digital_twin_id: "twin-001".to_string(),
            target_device_id: "device-001".to_string(),
            odte: OdteConfig::default(),
            lifecycle: LifecycleConfig::default(),
            composition: CompositionConfig::default(),
            cache: CacheConfig::default(),
            metrics: MetricsConfig::default(),
            http: HttpConfig::default(),
            recording: RecordingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OdteConfig {
    /// Delay (seconds) a sample must stay under to count as timely.
    pub desired_timeliness_sec: f64,
    /// Nominal message rate of the physical device.
    pub expected_msg_sec: f64,
    pub sliding_window_sec: f64,
    /// ODTE level at or above which the twin is considered shadowing.
    pub target_percentile: f64,
}

impl Default for OdteConfig {
    fn default() -> Self {
        Self {
            desired_timeliness_sec: 0.5,
            expected_msg_sec: 1.0,
            sliding_window_sec: 10.0,
            target_percentile: 0.9,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    pub unbound_threshold_ms: i64,
    pub cycle_period_ms: u64,
    /// Delay before the first periodic evaluation.
    pub startup_delay_ms: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            unbound_threshold_ms: 10_000,
            cycle_period_ms: 1_000,
            startup_delay_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompositionMode {
    /// One resource value per message, averaged per resource key.
    SingleValue,
    /// A map of resource values per message, averaged across messages.
    Composite,
}

/// Encoding of composed output records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    /// `{type, timestamp, value}` telemetry record.
    Json,
    /// SenML pack, one record per resource key.
    Senml,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompositionConfig {
    pub mode: CompositionMode,
    /// Values per resource key before a single-value aggregate is emitted.
    pub single_value_window: usize,
    /// Composite messages collected before an aggregate is emitted.
    pub aggregation_window: usize,
    /// Resource keys kept from composite payloads. Empty keeps all.
    pub target_resources: Vec<String>,
    pub units: BTreeMap<String, String>,
    /// Topic carrying composite device-state payloads.
    pub state_topic: String,
    pub output_topic: String,
    pub output_format: OutputFormat,
    pub retained: bool,
}

impl Default for CompositionConfig {
    fn default() -> Self {
        let units = [("temperature", "Cel"), ("energy", "kW")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Self {
            mode: CompositionMode::Composite,
            single_value_window: 10,
            aggregation_window: 5,
            target_resources: vec!["temperature".to_string(), "energy".to_string()],
            units,
            state_topic: "device_state".to_string(),
            output_topic: "device/average".to_string(),
            output_format: OutputFormat::Json,
            retained: false,
        }
    }
}

impl CompositionConfig {
    pub fn unit_for(&self, resource: &str) -> Option<&str> {
        self.units.get(resource).map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub retention_sec: f64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { retention_sec: 60.0 }
    }
}

impl CacheConfig {
    pub fn retention_ms(&self) -> i64 {
        (self.retention_sec * 1000.0).round() as i64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BucketType {
    Default,
    Linear,
}

/// Histogram layout for the observation-delay metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub bucket_type: BucketType,
    pub bucket_start: f64,
    pub bucket_width: f64,
    pub bucket_count: usize,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            bucket_type: BucketType::Default,
            bucket_start: 0.0,
            bucket_width: 0.005,
            bucket_count: 20,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub host: String,
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8090,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingConfig {
    pub enabled: bool,
    pub output_dir: String,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            output_dir: "sessions".to_string(),
        }
    }
}

fn invalid(msg: impl Into<String>) -> TwinError {
    TwinError::InvalidParameters(msg.into())
}

impl TwinConfig {
    /// Read and validate a JSON configuration file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| TwinError::Config(format!("{}: {e}", path.display())))?;
        Self::from_json_str(&text)
            .map_err(|e| TwinError::Config(format!("{}: {e}", path.display())))
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        let o = &self.odte;
        if !(o.expected_msg_sec.is_finite() && o.expected_msg_sec > 0.0) {
            return Err(invalid("odte.expected_msg_sec must be > 0"));
        }
        if !(o.sliding_window_sec.is_finite() && o.sliding_window_sec > 0.0) {
            return Err(invalid("odte.sliding_window_sec must be > 0"));
        }
        if !(o.desired_timeliness_sec.is_finite() && o.desired_timeliness_sec > 0.0) {
            return Err(invalid("odte.desired_timeliness_sec must be > 0"));
        }
        if !(o.target_percentile.is_finite() && o.target_percentile >= 0.0) {
            return Err(invalid("odte.target_percentile must be >= 0"));
        }
        if self.lifecycle.unbound_threshold_ms <= 0 {
            return Err(invalid("lifecycle.unbound_threshold_ms must be > 0"));
        }
        if self.lifecycle.cycle_period_ms == 0 {
            return Err(invalid("lifecycle.cycle_period_ms must be > 0"));
        }
        let c = &self.composition;
        if c.single_value_window == 0 {
            return Err(invalid("composition.single_value_window must be >= 1"));
        }
        if c.aggregation_window == 0 {
            return Err(invalid("composition.aggregation_window must be >= 1"));
        }
        if self.cache.retention_ms() <= 0 {
            return Err(invalid("cache.retention_sec must be > 0"));
        }
        let m = &self.metrics;
        if m.bucket_type == BucketType::Linear && (m.bucket_width <= 0.0 || m.bucket_count == 0) {
            return Err(invalid(
                "metrics: linear buckets need bucket_width > 0 and bucket_count >= 1",
            ));
        }
        Ok(())
    }

    /// Estimator parameters derived from the `odte` section.
    pub fn odte_params(&self) -> OdteParams {
        OdteParams {
            desired_timeliness_sec: self.odte.desired_timeliness_sec,
            expected_msg_per_sec: self.odte.expected_msg_sec,
            window_sec: self.odte.sliding_window_sec,
        }
    }

    /// Sliding window length in milliseconds.
    pub fn window_ms(&self) -> i64 {
        (self.odte.sliding_window_sec * 1000.0).round() as i64
    }
}

// ---------------------------------------------------------------------------
// Runtime updates
// ---------------------------------------------------------------------------

/// Partial runtime reconfiguration. Absent, zero, negative and non-finite
/// values are ignored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigUpdate {
    pub expected_msg_sec: Option<f64>,
    pub desired_timeliness_sec: Option<f64>,
    pub target_percentile: Option<f64>,
    pub unbound_threshold_ms: Option<i64>,
}

fn positive(v: Option<f64>) -> Option<f64> {
    v.filter(|x| x.is_finite() && *x > 0.0)
}

impl ConfigUpdate {
    /// Apply the valid fields to `config`, returning the names of the fields
    /// that changed.
    pub fn apply(&self, config: &mut TwinConfig) -> Vec<&'static str> {
        let mut applied = Vec::new();
        if let Some(v) = positive(self.expected_msg_sec) {
            config.odte.expected_msg_sec = v;
            applied.push("expected_msg_sec");
        }
        if let Some(v) = positive(self.desired_timeliness_sec) {
            config.odte.desired_timeliness_sec = v;
            applied.push("desired_timeliness_sec");
        }
        if let Some(v) = positive(self.target_percentile) {
            config.odte.target_percentile = v;
            applied.push("target_percentile");
        }
        if let Some(v) = self.unbound_threshold_ms.filter(|v| *v > 0) {
            config.lifecycle.unbound_threshold_ms = v;
            applied.push("unbound_threshold_ms");
        }
        applied
    }
}
