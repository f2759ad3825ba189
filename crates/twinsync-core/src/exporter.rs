//! Prometheus exporter for twin metrics.
//!
//! Each sink owns its own [`Registry`], so several twins in one process do
//! not collide. [`PrometheusSink::render`] produces the text exposition format
//! served on `/metrics`.

use prometheus::{
    Encoder, Gauge, GaugeVec, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};

use crate::config::{BucketType, MetricsConfig};
use crate::error::Result;
use crate::lifecycle::LifecycleState;
use crate::metrics::MetricsSink;
use crate::odte::OdteResult;

const TWIN_LABEL: &str = "digital_twin_id";

pub struct PrometheusSink {
    twin_id: String,
    registry: Registry,
    observation: Histogram,
    msg_rate: Gauge,
    uptime: Gauge,
    lifecycle: GaugeVec,
    timeliness: GaugeVec,
    reliability: GaugeVec,
    availability: GaugeVec,
    odte: GaugeVec,
}

fn twin_gauge(name: &str, help: &str) -> Result<GaugeVec> {
    Ok(GaugeVec::new(Opts::new(name, help), &[TWIN_LABEL])?)
}

/// Histogram buckets for the observation-delay metric.
pub fn observation_buckets(config: &MetricsConfig) -> Result<Vec<f64>> {
    match config.bucket_type {
        BucketType::Default => Ok(prometheus::DEFAULT_BUCKETS.to_vec()),
        BucketType::Linear => Ok(prometheus::linear_buckets(
            config.bucket_start,
            config.bucket_width,
            config.bucket_count,
        )?),
    }
}

impl PrometheusSink {
    pub fn new(twin_id: impl Into<String>, config: &MetricsConfig) -> Result<Self> {
        let registry = Registry::new();

        let observation = Histogram::with_opts(
            HistogramOpts::new(
                "dt_entanglement_observation_sec",
                "Physical-to-digital propagation delay of observations (seconds)",
            )
            .buckets(observation_buckets(config)?),
        )?;
        let msg_rate = Gauge::new(
            "dt_entanglement_msg_rate_sec",
            "Expected physical message rate (messages per second)",
        )?;
        let uptime = Gauge::new(
            "dt_entanglement_physical_asset_uptime",
            "Physical asset uptime ratio",
        )?;
        let lifecycle = twin_gauge("dt_life_cycle_state", "Digital twin lifecycle state")?;
        let timeliness = twin_gauge("dt_odte_timeliness", "ODTE timeliness sub-score")?;
        let reliability = twin_gauge("dt_odte_reliability", "ODTE reliability sub-score")?;
        let availability = twin_gauge("dt_odte_availability", "ODTE availability sub-score")?;
        let odte = twin_gauge("dt_odte_value", "ODTE composite value")?;

        registry.register(Box::new(observation.clone()))?;
        registry.register(Box::new(msg_rate.clone()))?;
        registry.register(Box::new(uptime.clone()))?;
        for g in [&lifecycle, &timeliness, &reliability, &availability, &odte] {
            registry.register(Box::new(g.clone()))?;
        }

        Ok(Self {
            twin_id: twin_id.into(),
            registry,
            observation,
            msg_rate,
            uptime,
            lifecycle,
            timeliness,
            reliability,
            availability,
            odte,
        })
    }

    /// Text exposition of every registered metric.
    pub fn render(&self) -> Result<String> {
        let families = self.registry.gather();
        let mut buf = Vec::new();
        TextEncoder::new().encode(&families, &mut buf)?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    pub fn content_type(&self) -> String {
        TextEncoder::new().format_type().to_string()
    }

    fn set_twin(&self, vec: &GaugeVec, value: f64) {
        vec.with_label_values(&[self.twin_id.as_str()]).set(value);
    }
}

impl MetricsSink for PrometheusSink {
    fn observe_delay(&self, _physical_ts_ms: i64, delay_sec: f64) {
        self.observation.observe(delay_sec);
    }

    fn set_lifecycle_state(&self, state: LifecycleState) {
        self.set_twin(&self.lifecycle, state.gauge_value() as f64);
    }

    fn set_odte(&self, result: &OdteResult) {
        self.set_twin(&self.timeliness, result.timeliness);
        self.set_twin(&self.reliability, result.reliability);
        self.set_twin(&self.availability, result.availability);
        self.set_twin(&self.odte, result.odte);
    }

    fn set_expected_msg_rate(&self, msg_per_sec: f64) {
        self.msg_rate.set(msg_per_sec);
    }

    fn set_physical_asset_uptime(&self, uptime: f64) {
        self.uptime.set(uptime);
    }
}
