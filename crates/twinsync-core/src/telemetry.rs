//! Telemetry wire types.
//!
//! Inbound payloads are JSON telemetry records, `{type, timestamp, value}`,
//! where `value` is a single reading or a map of resource key to reading.
//! Outbound records use the same envelope (or SenML, see [`SenmlRecord`]).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, TwinError};

/// JSON telemetry envelope shared by device payloads and composed output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRecord<T> {
    #[serde(rename = "type", default)]
    pub kind: String,
    /// Physical timestamp, Unix milliseconds.
    pub timestamp: i64,
    pub value: T,
}

/// A message delivered to the twin by the ingress bridge.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    /// Topic or resource key the message arrived on.
    pub topic: String,
    pub payload: Vec<u8>,
    /// Receipt time at the digital side, Unix milliseconds.
    pub received_at_ms: i64,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>, received_at_ms: i64) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            received_at_ms,
        }
    }

    /// Last `/`-separated segment of the topic.
    pub fn topic_leaf(&self) -> &str {
        self.topic.rsplit('/').next().unwrap_or(&self.topic)
    }
}

/// A composed record ready for the egress bridge.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retained: bool,
}

impl OutboundMessage {
    pub fn payload_str(&self) -> &str {
        std::str::from_utf8(&self.payload).unwrap_or("")
    }
}

/// Windowed aggregate for one resource key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedValue {
    pub mean: f64,
    /// Most recent raw reading in the window.
    pub last: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    pub samples: usize,
}

/// One SenML record. Absent fields are omitted on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SenmlRecord {
    pub n: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub u: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub v: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vs: Option<String>,
    pub t: i64,
}

impl SenmlRecord {
    pub fn numeric(name: &str, value: f64, unit: Option<&str>, t: i64) -> Self {
        Self {
            n: name.to_string(),
            u: unit.map(str::to_string),
            v: Some(value),
            vs: None,
            t,
        }
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

fn parse_envelope(payload: &[u8]) -> Result<TelemetryRecord<Value>> {
    if payload.is_empty() {
        return Err(TwinError::Parse("empty payload".into()));
    }
    let record: TelemetryRecord<Value> =
        serde_json::from_slice(payload).map_err(|e| TwinError::Parse(e.to_string()))?;
    if record.timestamp <= 0 {
        return Err(TwinError::Parse(format!(
            "non-positive timestamp {}",
            record.timestamp
        )));
    }
    Ok(record)
}

fn as_number(key: &str, value: &Value) -> Result<f64> {
    value
        .as_f64()
        .filter(|v| v.is_finite())
        .ok_or_else(|| TwinError::Parse(format!("resource '{key}' is not numeric: {value}")))
}

/// Parse a single-value payload. The value must be numeric.
pub fn parse_single(payload: &[u8]) -> Result<TelemetryRecord<f64>> {
    let record = parse_envelope(payload)?;
    let value = as_number(&record.kind, &record.value)?;
    Ok(TelemetryRecord {
        kind: record.kind,
        timestamp: record.timestamp,
        value,
    })
}

/// Parse a composite payload whose `value` is a map of resource readings.
///
/// Only keys in `targets` are kept (all keys when `targets` is empty).
/// Null readings are skipped; any other non-numeric reading of a kept key is
/// a parse error.
pub fn parse_composite(
    payload: &[u8],
    targets: &[String],
) -> Result<TelemetryRecord<BTreeMap<String, f64>>> {
    let record = parse_envelope(payload)?;
    let Value::Object(map) = record.value else {
        return Err(TwinError::Parse("composite value must be an object".into()));
    };
    let mut values = BTreeMap::new();
    for (key, raw) in map {
        if !targets.is_empty() && !targets.iter().any(|t| *t == key) {
            continue;
        }
        if raw.is_null() {
            continue;
        }
        let v = as_number(&key, &raw)?;
        values.insert(key, v);
    }
    Ok(TelemetryRecord {
        kind: record.kind,
        timestamp: record.timestamp,
        value: values,
    })
}
