pub mod config;
pub mod odte;
pub mod run;
pub mod sessions;
pub mod simulate;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use twinsync_core::{FanoutSink, PrometheusSink, SessionConfig, SessionSink, TwinConfig};

/// Print an error and exit non-zero.
pub fn fail(msg: impl std::fmt::Display) -> ! {
    eprintln!("Error: {msg}");
    std::process::exit(1);
}

/// Load and validate a config file, or fall back to defaults.
pub fn load_config(path: Option<&str>) -> TwinConfig {
    let config = match path {
        Some(p) => TwinConfig::from_path(p).unwrap_or_else(|e| fail(e)),
        None => TwinConfig::default(),
    };
    if let Err(e) = config.validate() {
        fail(e);
    }
    config
}

pub fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Runtime::new().unwrap_or_else(|e| fail(format!("tokio runtime: {e}")))
}

/// Sinks wired to one twin.
pub struct TwinSinks {
    pub fanout: Arc<FanoutSink>,
    pub prometheus: Arc<PrometheusSink>,
    pub session: Option<Arc<SessionSink>>,
}

impl TwinSinks {
    /// Prometheus always, plus a session recorder when `record` is set.
    pub fn build(
        config: &TwinConfig,
        record: bool,
        tags: HashMap<String, String>,
        note: Option<&str>,
    ) -> Self {
        let prometheus = Arc::new(
            PrometheusSink::new(&config.digital_twin_id, &config.metrics)
                .unwrap_or_else(|e| fail(e)),
        );
        let mut fanout = FanoutSink::new().with(prometheus.clone());

        let session = record.then(|| {
            let sink = SessionSink::create(SessionConfig {
                digital_twin_id: config.digital_twin_id.clone(),
                output_dir: PathBuf::from(&config.recording.output_dir),
                tags,
                note: note.map(str::to_string),
            })
            .unwrap_or_else(|e| fail(format!("creating session: {e}")));
            Arc::new(sink)
        });
        if let Some(s) = &session {
            fanout.push(s.clone());
        }

        Self {
            fanout: Arc::new(fanout),
            prometheus,
            session,
        }
    }

    /// Close the session, if any, and report where it went.
    pub fn finish(&self) {
        let Some(session) = &self.session else {
            return;
        };
        match session.finish() {
            Ok(Some(dir)) => {
                println!("Session saved to {}", dir.display());
                println!("  session.json      — metadata");
                println!("  delays.csv        — per-message propagation delay");
                println!("  odte.csv          — per-cycle ODTE sub-scores");
                println!("  transitions.csv   — lifecycle state changes");
            }
            Ok(None) => {}
            Err(e) => fail(format!("finalizing session: {e}")),
        }
    }
}

/// Parse `key:value` tags, warning on malformed entries.
pub fn parse_tags(tags: &[String]) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for tag in tags {
        if let Some((k, v)) = tag.split_once(':') {
            map.insert(k.to_string(), v.to_string());
        } else {
            eprintln!("Warning: ignoring malformed tag '{tag}' (expected key:value)");
        }
    }
    map
}

/// Parse a duration string like "5m", "30s", "1h", "100ms".
pub fn parse_duration(s: &str) -> Duration {
    let s = s.trim();

    let (numeric, multiplier) = if let Some(rest) = s.strip_suffix("ms") {
        (rest, 1u64)
    } else if let Some(rest) = s.strip_suffix('s') {
        (rest, 1000)
    } else if let Some(rest) = s.strip_suffix('m') {
        (rest, 60_000)
    } else if let Some(rest) = s.strip_suffix('h') {
        (rest, 3_600_000)
    } else {
        // Assume seconds
        (s, 1000)
    };

    let value: u64 = numeric
        .parse()
        .unwrap_or_else(|_| fail(format!("invalid duration: {s}")));

    Duration::from_millis(value * multiplier)
}

pub fn format_duration_ms(ms: u64) -> String {
    let secs = ms / 1000;
    if secs >= 3600 {
        format!("{}h{:02}m", secs / 3600, (secs % 3600) / 60)
    } else if secs >= 60 {
        format!("{}m{:02}s", secs / 60, secs % 60)
    } else {
        format!("{}.{}s", secs, (ms % 1000) / 100)
    }
}
