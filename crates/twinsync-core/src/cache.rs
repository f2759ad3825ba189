//! Time-indexed store of propagation-delay samples.
//!
//! Samples are keyed by the physical timestamp carried in the telemetry
//! payload. Each entry remembers when it was written; an entry that has not
//! been rewritten within the retention period is invisible to readers and is
//! removed by the next sweep. Expiry is purely time based, there is no size cap.
//!
//! Locking: one `Mutex` around the map. Readers copy the requested range out
//! and release the lock before any computation happens on the copy.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::Serialize;

/// Default retention window for delay samples.
pub const DEFAULT_RETENTION_MS: i64 = 60_000;

/// Number of writes between lazy sweeps.
const SWEEP_EVERY: u64 = 256;

/// One propagation-delay observation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DelaySample {
    pub physical_ts_ms: i64,
    pub delay_sec: f64,
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    delay_sec: f64,
    written_at_ms: i64,
}

#[derive(Debug, Default)]
struct CacheState {
    samples: BTreeMap<i64, Entry>,
    last_observation_ms: Option<i64>,
    writes: u64,
}

/// Point-in-time counters for status views.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub stored: usize,
    pub total_writes: u64,
    pub last_observation_ms: Option<i64>,
    pub retention_ms: i64,
}

/// Thread-safe delay-sample cache with write-time expiry.
pub struct TimelinessCache {
    retention_ms: i64,
    state: Mutex<CacheState>,
}

impl TimelinessCache {
    pub fn new(retention_ms: i64) -> Self {
        Self {
            retention_ms,
            state: Mutex::new(CacheState::default()),
        }
    }

    pub fn retention_ms(&self) -> i64 {
        self.retention_ms
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_live(&self, entry: &Entry, now_ms: i64) -> bool {
        now_ms - entry.written_at_ms < self.retention_ms
    }

    /// Insert or overwrite the sample for `physical_ts_ms` and restart its
    /// expiry clock at `now_ms`.
    pub fn put(&self, physical_ts_ms: i64, delay_sec: f64, now_ms: i64) {
        let mut state = self.lock();
        state.samples.insert(
            physical_ts_ms,
            Entry {
                delay_sec,
                written_at_ms: now_ms,
            },
        );
        state.last_observation_ms = Some(
            state
                .last_observation_ms
                .map_or(now_ms, |prev| prev.max(now_ms)),
        );
        state.writes += 1;
        if state.writes % SWEEP_EVERY == 0 {
            let retention = self.retention_ms;
            state
                .samples
                .retain(|_, e| now_ms - e.written_at_ms < retention);
        }
    }

    /// Live samples whose key falls in `[since_ms, until_ms]`, ordered by key.
    pub fn window(&self, since_ms: i64, until_ms: i64, now_ms: i64) -> Vec<DelaySample> {
        if since_ms > until_ms {
            return Vec::new();
        }
        let state = self.lock();
        state
            .samples
            .range(since_ms..=until_ms)
            .filter(|(_, e)| self.is_live(e, now_ms))
            .map(|(&physical_ts_ms, e)| DelaySample {
                physical_ts_ms,
                delay_sec: e.delay_sec,
            })
            .collect()
    }

    /// Delay values of the live samples in `[since_ms, until_ms]`.
    pub fn delays(&self, since_ms: i64, until_ms: i64, now_ms: i64) -> Vec<f64> {
        self.window(since_ms, until_ms, now_ms)
            .into_iter()
            .map(|s| s.delay_sec)
            .collect()
    }

    /// Look up one live sample.
    #[cfg(test)]
    pub(crate) fn get(&self, physical_ts_ms: i64, now_ms: i64) -> Option<f64> {
        let state = self.lock();
        state
            .samples
            .get(&physical_ts_ms)
            .filter(|e| self.is_live(e, now_ms))
            .map(|e| e.delay_sec)
    }

    /// Remove every expired entry. Returns how many were dropped.
    pub fn purge_expired(&self, now_ms: i64) -> usize {
        let mut state = self.lock();
        let before = state.samples.len();
        let retention = self.retention_ms;
        state
            .samples
            .retain(|_, e| now_ms - e.written_at_ms < retention);
        before - state.samples.len()
    }

    /// Receipt time of the most recent `put`, if any.
    pub fn last_observation_ms(&self) -> Option<i64> {
        self.lock().last_observation_ms
    }

    /// Entries currently stored, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.lock().samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.lock();
        CacheStats {
            stored: state.samples.len(),
            total_writes: state.writes,
            last_observation_ms: state.last_observation_ms,
            retention_ms: self.retention_ms,
        }
    }
}

impl Default for TimelinessCache {
    fn default() -> Self {
        Self::new(DEFAULT_RETENTION_MS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const T: i64 = 1_700_000_000_000;

    // -----------------------------------------------------------------------
    // put / window
    // -----------------------------------------------------------------------

    #[test]
    fn test_empty_window_is_valid() {
        let cache = TimelinessCache::default();
        assert!(cache.window(0, i64::MAX, T).is_empty());
        assert!(cache.is_empty());
        assert_eq!(cache.last_observation_ms(), None);
    }

    #[test]
    fn test_window_is_ordered_and_bounded() {
        let cache = TimelinessCache::default();
        cache.put(T + 300, 0.3, T + 600);
        cache.put(T + 100, 0.1, T + 200);
        cache.put(T + 200, 0.2, T + 400);
        cache.put(T + 900, 0.9, T + 1000);

        let w = cache.window(T + 100, T + 300, T + 1000);
        let keys: Vec<i64> = w.iter().map(|s| s.physical_ts_ms).collect();
        assert_eq!(keys, vec![T + 100, T + 200, T + 300]);
        assert_eq!(cache.delays(T, T + 1000, T + 1000), vec![0.1, 0.2, 0.3, 0.9]);
    }

    #[test]
    fn test_inverted_range_is_empty() {
        let cache = TimelinessCache::default();
        cache.put(T, 0.1, T);
        assert!(cache.window(T + 10, T, T).is_empty());
    }

    #[test]
    fn test_same_key_overwrites() {
        let cache = TimelinessCache::default();
        cache.put(T, 0.1, T);
        cache.put(T, 0.7, T + 5);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(T, T + 5), Some(0.7));
    }

    #[test]
    fn test_last_observation_tracks_latest_write() {
        let cache = TimelinessCache::default();
        cache.put(T, 0.1, T + 100);
        cache.put(T - 50, 0.1, T + 80);
        assert_eq!(cache.last_observation_ms(), Some(T + 100));
    }

    // -----------------------------------------------------------------------
    // Expiry
    // -----------------------------------------------------------------------

    #[test]
    fn test_sample_visible_until_retention_elapses() {
        let cache = TimelinessCache::new(60_000);
        cache.put(T, 0.2, T);
        assert_eq!(cache.get(T, T), Some(0.2));
        assert_eq!(cache.get(T, T + 59_999), Some(0.2));
        assert_eq!(cache.get(T, T + 60_000), None);
        assert!(cache.window(0, i64::MAX, T + 60_000).is_empty());
    }

    #[test]
    fn test_rewrite_resets_expiry() {
        let cache = TimelinessCache::new(1_000);
        cache.put(T, 0.2, T);
        cache.put(T, 0.3, T + 900);
        assert_eq!(cache.get(T, T + 1_500), Some(0.3));
        assert_eq!(cache.get(T, T + 1_900), None);
    }

    #[test]
    fn test_purge_expired_removes_only_stale() {
        let cache = TimelinessCache::new(1_000);
        cache.put(T, 0.1, T);
        cache.put(T + 1, 0.1, T + 800);
        assert_eq!(cache.purge_expired(T + 1_000), 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.purge_expired(T + 1_000), 0);
    }

    #[test]
    fn test_lazy_sweep_on_writes() {
        let cache = TimelinessCache::new(10);
        cache.put(0, 0.1, 0);
        for i in 1..SWEEP_EVERY as i64 {
            cache.put(i, 0.1, 1_000);
        }
        // The stale key 0 was dropped by the sweep on the last write.
        assert_eq!(cache.len(), SWEEP_EVERY as usize - 1);
    }

    // -----------------------------------------------------------------------
    // Concurrency
    // -----------------------------------------------------------------------

    #[test]
    fn test_concurrent_puts_lose_nothing() {
        let cache = Arc::new(TimelinessCache::default());
        std::thread::scope(|s| {
            for t in 0..4i64 {
                let cache = Arc::clone(&cache);
                s.spawn(move || {
                    for i in 0..100i64 {
                        cache.put(t * 1_000 + i, 0.1, T);
                        let _ = cache.window(0, i64::MAX, T);
                    }
                });
            }
        });
        assert_eq!(cache.window(0, i64::MAX, T).len(), 400);
        assert_eq!(cache.stats().total_writes, 400);
    }
}
