//! Session recording of twin measurements.
//!
//! A session captures everything the metrics sink sees during one run so it
//! can be analysed offline.
//!
//! # Storage Format
//!
//! Each session is a directory `{timestamp}-{twin_id}` containing:
//! - `session.json`: metadata (twin, timing, host, counts, tags)
//! - `delays.csv`: one row per propagation-delay observation
//! - `odte.csv`: one row per ODTE evaluation
//! - `transitions.csv`: one row per lifecycle state change

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::clock::unix_ms_now;
use crate::lifecycle::LifecycleState;
use crate::metrics::MetricsSink;
use crate::odte::OdteResult;

// ---------------------------------------------------------------------------
// Host info
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostInfo {
    pub os: String,
    pub arch: String,
    pub cores: usize,
}

pub fn detect_host_info() -> HostInfo {
    HostInfo {
        os: std::env::consts::OS.to_string(),
        arch: std::env::consts::ARCH.to_string(),
        cores: std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1),
    }
}

// ---------------------------------------------------------------------------
// Session metadata (session.json)
// ---------------------------------------------------------------------------

/// Session metadata written to session.json when recording ends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMeta {
    pub version: u32,
    pub id: String,
    pub digital_twin_id: String,
    pub started_at: String,
    pub ended_at: String,
    pub duration_ms: u64,
    pub delay_samples: u64,
    pub odte_evaluations: u64,
    pub transitions: u64,
    pub final_state: Option<LifecycleState>,
    pub host: HostInfo,
    pub tags: HashMap<String, String>,
    pub note: Option<String>,
    pub twinsync_version: String,
}

/// Configuration for a recording session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub digital_twin_id: String,
    pub output_dir: PathBuf,
    pub tags: HashMap<String, String>,
    pub note: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            digital_twin_id: "twin".to_string(),
            output_dir: PathBuf::from("sessions"),
            tags: HashMap::new(),
            note: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Session writer
// ---------------------------------------------------------------------------

/// Incremental CSV writer for one session.
pub struct SessionWriter {
    session_dir: PathBuf,
    delays: BufWriter<File>,
    odte: BufWriter<File>,
    transitions: BufWriter<File>,
    delay_samples: u64,
    odte_evaluations: u64,
    transition_count: u64,
    final_state: Option<LifecycleState>,
    started_at: SystemTime,
    started_instant: Instant,
    session_id: String,
    config: SessionConfig,
}

fn csv_with_header(path: &Path, header: &str) -> std::io::Result<BufWriter<File>> {
    let mut w = BufWriter::new(File::create(path)?);
    writeln!(w, "{header}")?;
    w.flush()?;
    Ok(w)
}

impl SessionWriter {
    /// Create the session directory and its CSV files.
    pub fn new(config: SessionConfig) -> std::io::Result<Self> {
        let session_id = Uuid::new_v4().to_string();
        let started_at = SystemTime::now();

        let ts = started_at.duration_since(UNIX_EPOCH).unwrap_or_default();
        let dir_name = format!(
            "{}-{}",
            format_iso8601_compact(ts),
            slug(&config.digital_twin_id)
        );
        let session_dir = config.output_dir.join(dir_name);
        fs::create_dir_all(&session_dir)?;

        let delays = csv_with_header(
            &session_dir.join("delays.csv"),
            "recorded_ms,physical_ts_ms,delay_sec",
        )?;
        let odte = csv_with_header(
            &session_dir.join("odte.csv"),
            "recorded_ms,samples,timeliness,reliability,availability,odte",
        )?;
        let transitions = csv_with_header(
            &session_dir.join("transitions.csv"),
            "recorded_ms,state,gauge",
        )?;

        Ok(Self {
            session_dir,
            delays,
            odte,
            transitions,
            delay_samples: 0,
            odte_evaluations: 0,
            transition_count: 0,
            final_state: None,
            started_at,
            started_instant: Instant::now(),
            session_id,
            config,
        })
    }

    pub fn write_delay(
        &mut self,
        recorded_ms: i64,
        physical_ts_ms: i64,
        delay_sec: f64,
    ) -> std::io::Result<()> {
        writeln!(self.delays, "{recorded_ms},{physical_ts_ms},{delay_sec:.6}")?;
        self.delays.flush()?;
        self.delay_samples += 1;
        Ok(())
    }

    pub fn write_odte(&mut self, recorded_ms: i64, r: &OdteResult) -> std::io::Result<()> {
        writeln!(
            self.odte,
            "{},{},{:.6},{:.6},{:.6},{:.6}",
            recorded_ms, r.samples, r.timeliness, r.reliability, r.availability, r.odte
        )?;
        self.odte.flush()?;
        self.odte_evaluations += 1;
        Ok(())
    }

    pub fn write_transition(
        &mut self,
        recorded_ms: i64,
        state: LifecycleState,
    ) -> std::io::Result<()> {
        writeln!(
            self.transitions,
            "{},{},{}",
            recorded_ms,
            state,
            state.gauge_value()
        )?;
        self.transitions.flush()?;
        self.transition_count += 1;
        self.final_state = Some(state);
        Ok(())
    }

    /// Finalize the session, writing session.json. Call this on graceful shutdown.
    pub fn finish(mut self) -> std::io::Result<PathBuf> {
        self.delays.flush()?;
        self.odte.flush()?;
        self.transitions.flush()?;

        let meta = SessionMeta {
            version: 1,
            id: self.session_id,
            digital_twin_id: self.config.digital_twin_id.clone(),
            started_at: format_iso8601(
                self.started_at.duration_since(UNIX_EPOCH).unwrap_or_default(),
            ),
            ended_at: format_iso8601(
                SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or_default(),
            ),
            duration_ms: self.started_instant.elapsed().as_millis() as u64,
            delay_samples: self.delay_samples,
            odte_evaluations: self.odte_evaluations,
            transitions: self.transition_count,
            final_state: self.final_state,
            host: detect_host_info(),
            tags: self.config.tags.clone(),
            note: self.config.note.clone(),
            twinsync_version: crate::VERSION.to_string(),
        };

        let json = serde_json::to_string_pretty(&meta).map_err(std::io::Error::other)?;
        fs::write(self.session_dir.join("session.json"), json)?;

        Ok(self.session_dir)
    }

    pub fn session_dir(&self) -> &Path {
        &self.session_dir
    }

    pub fn delay_samples(&self) -> u64 {
        self.delay_samples
    }

    pub fn elapsed(&self) -> Duration {
        self.started_instant.elapsed()
    }
}

// ---------------------------------------------------------------------------
// Metrics sink adapter
// ---------------------------------------------------------------------------

/// Metrics sink that records into a [`SessionWriter`].
///
/// Write failures are logged and otherwise ignored. After [`finish`] the sink
/// silently drops further updates.
///
/// [`finish`]: SessionSink::finish
pub struct SessionSink {
    writer: Mutex<Option<SessionWriter>>,
}

impl SessionSink {
    pub fn new(writer: SessionWriter) -> Self {
        Self {
            writer: Mutex::new(Some(writer)),
        }
    }

    pub fn create(config: SessionConfig) -> std::io::Result<Self> {
        Ok(Self::new(SessionWriter::new(config)?))
    }

    fn lock(&self) -> MutexGuard<'_, Option<SessionWriter>> {
        self.writer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_writer(&self, what: &str, f: impl FnOnce(&mut SessionWriter) -> std::io::Result<()>) {
        if let Some(w) = self.lock().as_mut() {
            if let Err(e) = f(w) {
                log::warn!("session: failed to record {what}: {e}");
            }
        }
    }

    pub fn session_dir(&self) -> Option<PathBuf> {
        self.lock().as_ref().map(|w| w.session_dir().to_path_buf())
    }

    /// Write session.json and close the session. Returns `None` when already
    /// finished.
    pub fn finish(&self) -> std::io::Result<Option<PathBuf>> {
        match self.lock().take() {
            Some(w) => w.finish().map(Some),
            None => Ok(None),
        }
    }
}

impl MetricsSink for SessionSink {
    fn observe_delay(&self, physical_ts_ms: i64, delay_sec: f64) {
        self.with_writer("delay", |w| {
            w.write_delay(unix_ms_now(), physical_ts_ms, delay_sec)
        });
    }

    fn set_lifecycle_state(&self, state: LifecycleState) {
        self.with_writer("transition", |w| w.write_transition(unix_ms_now(), state));
    }

    fn set_odte(&self, result: &OdteResult) {
        self.with_writer("odte", |w| w.write_odte(unix_ms_now(), result));
    }
}

// ---------------------------------------------------------------------------
// Listing
// ---------------------------------------------------------------------------

/// Sessions found under `dir`, oldest first. Directories without a readable
/// session.json are skipped.
pub fn list_sessions(dir: &Path) -> std::io::Result<Vec<(PathBuf, SessionMeta)>> {
    let mut out = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let Ok(text) = fs::read_to_string(path.join("session.json")) else {
            continue;
        };
        match serde_json::from_str::<SessionMeta>(&text) {
            Ok(meta) => out.push((path, meta)),
            Err(e) => log::debug!("skipping {}: {e}", path.display()),
        }
    }
    out.sort_by(|a, b| a.1.started_at.cmp(&b.1.started_at));
    Ok(out)
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn slug(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

/// Compact ISO-8601 timestamp for directory names, e.g. `2026-02-15T013000Z`.
fn format_iso8601_compact(since_epoch: Duration) -> String {
    let (year, month, day, hour, min, sec) = secs_to_utc(since_epoch.as_secs());
    format!("{year:04}-{month:02}-{day:02}T{hour:02}{min:02}{sec:02}Z")
}

/// Full ISO-8601 timestamp, e.g. `2026-02-15T01:30:00Z`.
fn format_iso8601(since_epoch: Duration) -> String {
    let (year, month, day, hour, min, sec) = secs_to_utc(since_epoch.as_secs());
    format!("{year:04}-{month:02}-{day:02}T{hour:02}:{min:02}:{sec:02}Z")
}

/// Seconds since the Unix epoch to (year, month, day, hour, minute, second) UTC.
/// No leap seconds.
fn secs_to_utc(secs: u64) -> (u64, u64, u64, u64, u64, u64) {
    let sec = secs % 60;
    let min = (secs / 60) % 60;
    let hour = (secs / 3600) % 24;

    let mut days = secs / 86400;
    let mut year = 1970u64;
    loop {
        let days_in_year = if is_leap(year) { 366 } else { 365 };
        if days < days_in_year {
            break;
        }
        days -= days_in_year;
        year += 1;
    }

    let feb = if is_leap(year) { 29 } else { 28 };
    let months_days: [u64; 12] = [31, feb, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31];
    let mut month = 12u64;
    for (i, &md) in months_days.iter().enumerate() {
        if days < md {
            month = i as u64 + 1;
            break;
        }
        days -= md;
    }

    (year, month, days + 1, hour, min, sec)
}

fn is_leap(year: u64) -> bool {
    (year % 4 == 0 && year % 100 != 0) || (year % 400 == 0)
}
