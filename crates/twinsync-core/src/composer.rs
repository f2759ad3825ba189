//! Telemetry composition.
//!
//! Turns raw device telemetry into windowed aggregates and feeds
//! propagation-delay samples to the timeliness cache.
//!
//! Two modes, selected by [`CompositionMode`]:
//!
//! - **Single value**: one reading per message. Readings are collected per
//!   resource key; when a key's list reaches `single_value_window` entries its
//!   mean is emitted on `{output_topic}/{key}` and the list is cleared. The
//!   delay of the message completing the window is recorded.
//! - **Composite**: a map of readings per message with one physical
//!   timestamp. Every valid message records its delay. Maps are collected
//!   until `aggregation_window` entries exist, then per-key means are emitted
//!   on `output_topic` and the history is cleared.
//!
//! Composite payloads are accepted only on the configured `state_topic` and
//! must carry at least one target resource.
//!
//! A message that fails to parse changes nothing: validation finishes before
//! any history or cache write.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;

use crate::cache::TimelinessCache;
use crate::config::{CompositionConfig, CompositionMode, OutputFormat};
use crate::error::{Result, TwinError};
use crate::metrics::MetricsSink;
use crate::telemetry::{
    AggregatedValue, InboundMessage, OutboundMessage, SenmlRecord, TelemetryRecord,
    parse_composite, parse_single,
};

/// Record type used for composite aggregates.
pub const COMPOSITE_RECORD_TYPE: &str = "device_state_average";

/// Result of composing one message.
#[derive(Debug, Clone, PartialEq)]
pub enum ComposeOutcome {
    /// A window completed and produced an output record.
    Emitted(OutboundMessage),
    /// The message was accepted but its window is not yet full.
    Pending { collected: usize, required: usize },
}

impl ComposeOutcome {
    pub fn is_emitted(&self) -> bool {
        matches!(self, Self::Emitted(_))
    }
}

/// Running mean. Adding `n` copies of `v` yields exactly `v`.
#[derive(Debug, Clone, Copy, Default)]
struct RunningMean {
    mean: f64,
    n: usize,
}

impl RunningMean {
    fn push(&mut self, x: f64) {
        self.n += 1;
        self.mean += (x - self.mean) / self.n as f64;
    }
}

fn mean_of(values: &[f64]) -> f64 {
    let mut m = RunningMean::default();
    for &v in values {
        m.push(v);
    }
    m.mean
}

#[derive(Debug, Default)]
struct ComposerState {
    single: HashMap<String, Vec<f64>>,
    history: Vec<BTreeMap<String, f64>>,
    emitted: u64,
}

/// Pending work, for status views.
#[derive(Debug, Clone, Serialize)]
pub struct ComposerStatus {
    pub pending_single: BTreeMap<String, usize>,
    pub pending_composite: usize,
    pub emitted: u64,
}

/// Per-twin composer. Holds the only reference to the aggregation buffers.
pub struct TelemetryComposer {
    cache: Arc<TimelinessCache>,
    sink: Arc<dyn MetricsSink>,
    state: Mutex<ComposerState>,
}

impl TelemetryComposer {
    pub fn new(cache: Arc<TimelinessCache>, sink: Arc<dyn MetricsSink>) -> Self {
        Self {
            cache,
            sink,
            state: Mutex::new(ComposerState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ComposerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Compose one inbound message under the given settings.
    ///
    /// `now_ms` is the composition time stamped on emitted records.
    pub fn compose(
        &self,
        msg: &InboundMessage,
        settings: &CompositionConfig,
        now_ms: i64,
    ) -> Result<ComposeOutcome> {
        match settings.mode {
            CompositionMode::SingleValue => self.compose_single(msg, settings, now_ms),
            CompositionMode::Composite => self.compose_composite(msg, settings, now_ms),
        }
    }

    fn record_delay(&self, physical_ts_ms: i64, received_at_ms: i64) {
        let delay_sec = (received_at_ms - physical_ts_ms) as f64 / 1000.0;
        self.cache.put(physical_ts_ms, delay_sec, received_at_ms);
        self.sink.observe_delay(physical_ts_ms, delay_sec);
    }

    fn compose_single(
        &self,
        msg: &InboundMessage,
        settings: &CompositionConfig,
        now_ms: i64,
    ) -> Result<ComposeOutcome> {
        let record = parse_single(&msg.payload)?;
        let key = if record.kind.is_empty() {
            msg.topic_leaf().to_string()
        } else {
            record.kind.clone()
        };
        let required = settings.single_value_window;

        let window = {
            let mut state = self.lock();
            let values = state.single.entry(key.clone()).or_default();
            values.push(record.value);
            let collected = values.len();
            if collected < required {
                log::debug!("compose {key}: {collected}/{required}");
                return Ok(ComposeOutcome::Pending {
                    collected,
                    required,
                });
            }
            let window = std::mem::take(values);
            state.emitted += 1;
            window
        };

        self.record_delay(record.timestamp, msg.received_at_ms);

        let aggregate = AggregatedValue {
            mean: mean_of(&window),
            last: record.value,
            unit: settings.unit_for(&key).map(str::to_string),
            samples: window.len(),
        };
        let topic = format!("{}/{}", settings.output_topic, key);
        let payload = match settings.output_format {
            OutputFormat::Json => serde_json::to_vec(&TelemetryRecord {
                kind: key.clone(),
                timestamp: now_ms,
                value: &aggregate,
            })?,
            OutputFormat::Senml => serde_json::to_vec(&[SenmlRecord::numeric(
                &key,
                aggregate.mean,
                aggregate.unit.as_deref(),
                now_ms,
            )])?,
        };
        log::info!(
            "emit {topic}: mean={:.4} over {} samples",
            aggregate.mean,
            aggregate.samples
        );
        Ok(ComposeOutcome::Emitted(OutboundMessage {
            topic,
            payload,
            retained: settings.retained,
        }))
    }

    fn compose_composite(
        &self,
        msg: &InboundMessage,
        settings: &CompositionConfig,
        now_ms: i64,
    ) -> Result<ComposeOutcome> {
        if msg.topic != settings.state_topic && msg.topic_leaf() != settings.state_topic {
            return Err(TwinError::Parse(format!(
                "topic '{}' does not carry device state (expected '{}')",
                msg.topic, settings.state_topic
            )));
        }
        let record = parse_composite(&msg.payload, &settings.target_resources)?;
        if record.value.is_empty() {
            return Err(TwinError::Parse(format!(
                "no target resource in composite payload on '{}'",
                msg.topic
            )));
        }
        self.record_delay(record.timestamp, msg.received_at_ms);

        let required = settings.aggregation_window;
        let history = {
            let mut state = self.lock();
            state.history.push(record.value);
            let collected = state.history.len();
            if collected < required {
                log::debug!("compose {}: {collected}/{required}", msg.topic);
                return Ok(ComposeOutcome::Pending {
                    collected,
                    required,
                });
            }
            state.emitted += 1;
            std::mem::take(&mut state.history)
        };

        let aggregates = aggregate_history(&history, settings);
        let payload = match settings.output_format {
            OutputFormat::Json => serde_json::to_vec(&TelemetryRecord {
                kind: COMPOSITE_RECORD_TYPE.to_string(),
                timestamp: now_ms,
                value: &aggregates,
            })?,
            OutputFormat::Senml => {
                let pack: Vec<SenmlRecord> = aggregates
                    .iter()
                    .map(|(k, a)| SenmlRecord::numeric(k, a.mean, a.unit.as_deref(), now_ms))
                    .collect();
                serde_json::to_vec(&pack)?
            }
        };
        log::info!(
            "emit {}: {} resources over {} messages",
            settings.output_topic,
            aggregates.len(),
            history.len()
        );
        Ok(ComposeOutcome::Emitted(OutboundMessage {
            topic: settings.output_topic.clone(),
            payload,
            retained: settings.retained,
        }))
    }

    pub fn status(&self) -> ComposerStatus {
        let state = self.lock();
        ComposerStatus {
            pending_single: state
                .single
                .iter()
                .map(|(k, v)| (k.clone(), v.len()))
                .collect(),
            pending_composite: state.history.len(),
            emitted: state.emitted,
        }
    }
}

/// Per-key mean over a composite history. Keys missing from some entries are
/// averaged over the entries that carry them.
fn aggregate_history(
    history: &[BTreeMap<String, f64>],
    settings: &CompositionConfig,
) -> BTreeMap<String, AggregatedValue> {
    let mut acc: BTreeMap<&str, (RunningMean, f64)> = BTreeMap::new();
    for entry in history {
        for (key, &v) in entry {
            let slot = acc.entry(key.as_str()).or_default();
            slot.0.push(v);
            slot.1 = v;
        }
    }
    acc.into_iter()
        .map(|(key, (m, last))| {
            (
                key.to_string(),
                AggregatedValue {
                    mean: m.mean,
                    last,
                    unit: settings.unit_for(key).map(str::to_string),
                    samples: m.n,
                },
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MemorySink;
    use serde_json::Value;

    const NOW: i64 = 1_700_000_000_000;

    fn setup() -> (TelemetryComposer, Arc<TimelinessCache>, Arc<MemorySink>) {
        let cache = Arc::new(TimelinessCache::default());
        let sink = Arc::new(MemorySink::new());
        (
            TelemetryComposer::new(cache.clone(), sink.clone()),
            cache,
            sink,
        )
    }

    fn single_cfg(window: usize) -> CompositionConfig {
        CompositionConfig {
            mode: CompositionMode::SingleValue,
            single_value_window: window,
            ..CompositionConfig::default()
        }
    }

    fn composite_cfg(window: usize) -> CompositionConfig {
        CompositionConfig {
            mode: CompositionMode::Composite,
            aggregation_window: window,
            ..CompositionConfig::default()
        }
    }

    fn single_msg(kind: &str, ts: i64, value: f64, received: i64) -> InboundMessage {
        let body = format!(r#"{{"type":"{kind}","timestamp":{ts},"value":{value}}}"#);
        InboundMessage::new(format!("telemetry/dev/{kind}"), body, received)
    }

    fn state_msg(ts: i64, temperature: f64, energy: f64, received: i64) -> InboundMessage {
        let body = format!(
            r#"{{"type":"device_state","timestamp":{ts},"value":{{"temperature":{temperature},"energy":{energy},"label":"x"}}}}"#
        );
        InboundMessage::new("device_state", body, received)
    }

    fn emitted(outcome: ComposeOutcome) -> OutboundMessage {
        match outcome {
            ComposeOutcome::Emitted(m) => m,
            other => panic!("expected emission, got {other:?}"),
        }
    }

    // -----------------------------------------------------------------------
    // Single-value mode
    // -----------------------------------------------------------------------

    #[test]
    fn single_value_emits_on_window_boundary() {
        let (c, cache, sink) = setup();
        let cfg = single_cfg(3);
        for (i, v) in [20.0, 22.0].into_iter().enumerate() {
            let out = c
                .compose(&single_msg("temperature", NOW + i as i64, v, NOW + 100), &cfg, NOW)
                .unwrap();
            assert_eq!(
                out,
                ComposeOutcome::Pending {
                    collected: i + 1,
                    required: 3
                }
            );
        }
        assert!(cache.is_empty());

        let out = emitted(
            c.compose(&single_msg("temperature", NOW + 2, 24.0, NOW + 252), &cfg, NOW + 300)
                .unwrap(),
        );
        assert_eq!(out.topic, "device/average/temperature");
        let rec: TelemetryRecord<AggregatedValue> = serde_json::from_slice(&out.payload).unwrap();
        assert_eq!(rec.kind, "temperature");
        assert_eq!(rec.timestamp, NOW + 300);
        assert_eq!(rec.value.mean, 22.0);
        assert_eq!(rec.value.last, 24.0);
        assert_eq!(rec.value.unit.as_deref(), Some("Cel"));
        assert_eq!(rec.value.samples, 3);

        // Delay of the completing message only.
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(NOW + 2, NOW + 252), Some(0.25));
        assert_eq!(sink.snapshot().delays, vec![(NOW + 2, 0.25)]);
        assert_eq!(c.status().pending_single["temperature"], 0);
    }

    #[test]
    fn single_value_keys_are_independent() {
        let (c, _, _) = setup();
        let cfg = single_cfg(2);
        c.compose(&single_msg("temperature", NOW, 1.0, NOW), &cfg, NOW).unwrap();
        let out = c.compose(&single_msg("energy", NOW + 1, 5.0, NOW), &cfg, NOW).unwrap();
        assert!(!out.is_emitted());
        let out = emitted(c.compose(&single_msg("energy", NOW + 2, 7.0, NOW), &cfg, NOW).unwrap());
        assert_eq!(out.topic, "device/average/energy");
        let rec: TelemetryRecord<AggregatedValue> = serde_json::from_slice(&out.payload).unwrap();
        assert_eq!(rec.value.mean, 6.0);
        assert_eq!(rec.value.unit.as_deref(), Some("kW"));
        assert_eq!(c.status().pending_single["temperature"], 1);
    }

    #[test]
    fn single_value_falls_back_to_topic_leaf() {
        let (c, _, _) = setup();
        let msg = InboundMessage::new(
            "telemetry/dev/humidity",
            format!(r#"{{"timestamp":{NOW},"value":40}}"#),
            NOW,
        );
        let out = emitted(c.compose(&msg, &single_cfg(1), NOW).unwrap());
        assert_eq!(out.topic, "device/average/humidity");
        let rec: TelemetryRecord<AggregatedValue> = serde_json::from_slice(&out.payload).unwrap();
        assert_eq!(rec.value.unit, None);
    }

    #[test]
    fn single_value_parse_error_mutates_nothing() {
        let (c, cache, sink) = setup();
        let cfg = single_cfg(1);
        let bad = InboundMessage::new(
            "temperature",
            r#"{"type":"temperature","timestamp":5,"value":"hot"}"#,
            NOW,
        );
        assert!(c.compose(&bad, &cfg, NOW).is_err());
        assert!(c.status().pending_single.is_empty());
        assert!(cache.is_empty());
        assert_eq!(sink.snapshot().delay_count, 0);
    }

    #[test]
    fn single_value_senml_output() {
        let (c, _, _) = setup();
        let cfg = CompositionConfig {
            output_format: OutputFormat::Senml,
            ..single_cfg(1)
        };
        let out = emitted(c.compose(&single_msg("energy", NOW, 2.5, NOW), &cfg, NOW + 1).unwrap());
        let pack: Vec<SenmlRecord> = serde_json::from_slice(&out.payload).unwrap();
        assert_eq!(pack, vec![SenmlRecord::numeric("energy", 2.5, Some("kW"), NOW + 1)]);
    }

    // -----------------------------------------------------------------------
    // Composite mode
    // -----------------------------------------------------------------------

    #[test]
    fn composite_records_delay_on_every_message() {
        let (c, cache, sink) = setup();
        let cfg = composite_cfg(5);
        for i in 0..4 {
            let out = c
                .compose(&state_msg(NOW + i * 1000, 20.0, 1.0, NOW + i * 1000 + 200), &cfg, NOW)
                .unwrap();
            assert_eq!(
                out,
                ComposeOutcome::Pending {
                    collected: i as usize + 1,
                    required: 5
                }
            );
        }
        assert_eq!(cache.len(), 4);
        assert_eq!(sink.snapshot().delay_count, 4);
        assert_eq!(c.status().pending_composite, 4);
        assert_eq!(cache.delays(0, i64::MAX, NOW + 4000), vec![0.2; 4]);
    }

    #[test]
    fn composite_emits_per_key_means() {
        let (c, _, _) = setup();
        let cfg = composite_cfg(2);
        c.compose(&state_msg(NOW, 20.0, 1.0, NOW), &cfg, NOW).unwrap();
        let out = emitted(c.compose(&state_msg(NOW + 1, 22.0, 3.0, NOW + 1), &cfg, NOW + 10).unwrap());
        assert_eq!(out.topic, "device/average");
        assert!(!out.retained);

        let rec: TelemetryRecord<BTreeMap<String, AggregatedValue>> =
            serde_json::from_slice(&out.payload).unwrap();
        assert_eq!(rec.kind, COMPOSITE_RECORD_TYPE);
        assert_eq!(rec.timestamp, NOW + 10);
        assert_eq!(rec.value.len(), 2);
        assert_eq!(rec.value["temperature"].mean, 21.0);
        assert_eq!(rec.value["temperature"].last, 22.0);
        assert_eq!(rec.value["energy"].mean, 2.0);
        assert_eq!(rec.value["energy"].unit.as_deref(), Some("kW"));
        assert_eq!(c.status().pending_composite, 0);
        assert_eq!(c.status().emitted, 1);
    }

    #[test]
    fn composite_mean_of_identical_values_is_exact() {
        let (c, _, _) = setup();
        let v = 21.7;
        let cfg = composite_cfg(7);
        let mut last = None;
        for i in 0..7 {
            last = Some(c.compose(&state_msg(NOW + i, v, v, NOW + i), &cfg, NOW).unwrap());
        }
        let out = emitted(last.unwrap());
        let rec: Value = serde_json::from_slice(&out.payload).unwrap();
        assert_eq!(rec["value"]["temperature"]["mean"].as_f64(), Some(v));
        assert_eq!(rec["value"]["energy"]["mean"].as_f64(), Some(v));
    }

    #[test]
    fn composite_rejects_bad_timestamp_without_mutation() {
        let (c, cache, _) = setup();
        let cfg = composite_cfg(1);
        let msg = InboundMessage::new(
            "device_state",
            r#"{"type":"device_state","timestamp":0,"value":{"temperature":1.0}}"#,
            NOW,
        );
        assert!(c.compose(&msg, &cfg, NOW).is_err());
        assert!(cache.is_empty());
        assert_eq!(c.status().pending_composite, 0);
    }

    #[test]
    fn composite_partial_keys_average_over_present_entries() {
        let history = vec![
            BTreeMap::from([("a".to_string(), 1.0), ("b".to_string(), 10.0)]),
            BTreeMap::from([("a".to_string(), 3.0)]),
        ];
        let agg = aggregate_history(&history, &composite_cfg(2));
        assert_eq!(agg["a"].mean, 2.0);
        assert_eq!(agg["a"].samples, 2);
        assert_eq!(agg["b"].mean, 10.0);
        assert_eq!(agg["b"].samples, 1);
        assert_eq!(agg["a"].unit, None);
    }

    #[test]
    fn composite_senml_pack_has_one_record_per_key() {
        let (c, _, _) = setup();
        let cfg = CompositionConfig {
            output_format: OutputFormat::Senml,
            retained: true,
            ..composite_cfg(1)
        };
        let out = emitted(c.compose(&state_msg(NOW, 20.0, 4.0, NOW), &cfg, NOW).unwrap());
        assert!(out.retained);
        let pack: Vec<SenmlRecord> = serde_json::from_slice(&out.payload).unwrap();
        assert_eq!(
            pack,
            vec![
                SenmlRecord::numeric("energy", 4.0, Some("kW"), NOW),
                SenmlRecord::numeric("temperature", 20.0, Some("Cel"), NOW),
            ]
        );
    }

    #[test]
    fn composite_without_target_keys_is_rejected() {
        let (c, cache, sink) = setup();
        let cfg = composite_cfg(2);
        let msg = |ts: i64| {
            InboundMessage::new(
                "device_state",
                format!(r#"{{"type":"device_state","timestamp":{ts},"value":{{"humidity":40.0}}}}"#),
                ts + 50,
            )
        };
        for ts in [NOW, NOW + 1] {
            assert!(matches!(c.compose(&msg(ts), &cfg, NOW), Err(TwinError::Parse(_))));
        }
        assert!(cache.is_empty());
        assert_eq!(sink.snapshot().delay_count, 0);
        assert_eq!(c.status().pending_composite, 0);
        assert_eq!(c.status().emitted, 0);
    }

    #[test]
    fn composite_only_accepts_state_topic() {
        let (c, cache, _) = setup();
        let cfg = composite_cfg(1);
        let body = format!(
            r#"{{"type":"device_state","timestamp":{NOW},"value":{{"temperature":20.0}}}}"#
        );
        let wrong = InboundMessage::new("temperature", body.clone(), NOW);
        assert!(matches!(c.compose(&wrong, &cfg, NOW), Err(TwinError::Parse(_))));
        assert!(cache.is_empty());
        assert_eq!(c.status().pending_composite, 0);

        let nested = InboundMessage::new("telemetry/dev-1/device_state", body, NOW);
        assert!(c.compose(&nested, &cfg, NOW).unwrap().is_emitted());
    }

    #[test]
    fn running_mean_matches_arithmetic_mean() {
        assert_eq!(mean_of(&[1.0, 2.0, 3.0, 4.0]), 2.5);
        assert_eq!(mean_of(&[]), 0.0);
    }
}
