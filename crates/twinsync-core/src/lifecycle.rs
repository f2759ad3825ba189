//! Twin lifecycle state machine.
//!
//! ```text
//!   Started ──begin_bridging──▶ Unbound ──mark_bound──▶ Bound
//!                                  ▲                      │ odte ≥ target
//!                                  │ silence > threshold  ▼
//!                                UnSync ◀──odte < target── Shadowed
//!                                  └──────odte ≥ target──────▲
//! ```
//!
//! At most one transition is applied per evaluation. The machine is the only
//! writer of the state. Each change is committed under the state lock and
//! reported to the metrics sink after that lock is released, so a slow sink
//! never blocks readers. Exports are serialized and follow commit order.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};

use crate::metrics::MetricsSink;

/// Synchronization state of a twin. Discriminants are the exported gauge values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Started = 1,
    Unbound = 2,
    Bound = 3,
    UnSync = 4,
    Shadowed = 5,
}

impl LifecycleState {
    /// Integer value exported on the lifecycle gauge.
    pub fn gauge_value(self) -> i64 {
        self as i64
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Unbound => "unbound",
            Self::Bound => "bound",
            Self::UnSync => "un_sync",
            Self::Shadowed => "shadowed",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inputs to one periodic evaluation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Evaluation {
    pub odte: f64,
    pub target_percentile: f64,
    /// Milliseconds since the last successful observation.
    pub silence_ms: i64,
    pub unbound_threshold_ms: i64,
}

/// A state change, with the time it was applied.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Transition {
    pub from: LifecycleState,
    pub to: LifecycleState,
    pub at_ms: i64,
}

/// Pure transition rule for one periodic evaluation.
///
/// Returns the destination state, or `None` when the state is unchanged.
/// For `UnSync`, silence demotion takes precedence over ODTE promotion.
pub fn next_state(current: LifecycleState, eval: &Evaluation) -> Option<LifecycleState> {
    let healthy = eval.odte >= eval.target_percentile;
    match current {
        LifecycleState::Bound if healthy => Some(LifecycleState::Shadowed),
        LifecycleState::UnSync if eval.silence_ms > eval.unbound_threshold_ms => {
            Some(LifecycleState::Unbound)
        }
        LifecycleState::UnSync if healthy => Some(LifecycleState::Shadowed),
        LifecycleState::Shadowed if !healthy => Some(LifecycleState::UnSync),
        _ => None,
    }
}

#[derive(Debug)]
struct Inner {
    state: LifecycleState,
    since_ms: i64,
    transitions: u64,
    last: Option<Transition>,
}

/// Current state plus bookkeeping, for status views.
#[derive(Debug, Clone, Serialize)]
pub struct LifecycleSnapshot {
    pub state: LifecycleState,
    pub since_ms: i64,
    pub transitions: u64,
    pub last_transition: Option<Transition>,
}

/// Owner of one twin's lifecycle state.
pub struct LifecycleMachine {
    inner: Mutex<Inner>,
    // Taken before `inner` is released; never held while taking `inner`.
    export: Mutex<()>,
    sink: Arc<dyn MetricsSink>,
}

impl LifecycleMachine {
    /// New machine in `Started`. The initial state is exported immediately.
    pub fn new(sink: Arc<dyn MetricsSink>, now_ms: i64) -> Self {
        sink.set_lifecycle_state(LifecycleState::Started);
        Self {
            inner: Mutex::new(Inner {
                state: LifecycleState::Started,
                since_ms: now_ms,
                transitions: 0,
                last: None,
            }),
            export: Mutex::new(()),
            sink,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn current(&self) -> LifecycleState {
        self.lock().state
    }

    pub fn snapshot(&self) -> LifecycleSnapshot {
        let inner = self.lock();
        LifecycleSnapshot {
            state: inner.state,
            since_ms: inner.since_ms,
            transitions: inner.transitions,
            last_transition: inner.last,
        }
    }

    /// Commit `to`, then export it once the state lock is gone.
    fn apply(
        &self,
        mut inner: MutexGuard<'_, Inner>,
        to: LifecycleState,
        now_ms: i64,
    ) -> Transition {
        let t = Transition {
            from: inner.state,
            to,
            at_ms: now_ms,
        };
        inner.state = to;
        inner.since_ms = now_ms;
        inner.transitions += 1;
        inner.last = Some(t);

        let _export = self.export.lock().unwrap_or_else(PoisonError::into_inner);
        drop(inner);
        self.sink.set_lifecycle_state(to);
        log::info!("lifecycle {} -> {}", t.from, t.to);
        t
    }

    /// Move `from` to `to` if the machine is currently in `from`.
    fn guarded(&self, from: LifecycleState, to: LifecycleState, now_ms: i64) -> Option<Transition> {
        let inner = self.lock();
        if inner.state != from {
            return None;
        }
        Some(self.apply(inner, to, now_ms))
    }

    /// `Started → Unbound`, once the message bridge is up.
    pub fn begin_bridging(&self, now_ms: i64) -> Option<Transition> {
        self.guarded(LifecycleState::Started, LifecycleState::Unbound, now_ms)
    }

    /// `Unbound → Bound`, on the first successfully composed message.
    pub fn mark_bound(&self, now_ms: i64) -> Option<Transition> {
        self.guarded(LifecycleState::Unbound, LifecycleState::Bound, now_ms)
    }

    /// Apply the periodic rules. The read and the write happen under one lock.
    pub fn evaluate(&self, eval: &Evaluation, now_ms: i64) -> Option<Transition> {
        let inner = self.lock();
        let to = next_state(inner.state, eval)?;
        Some(self.apply(inner, to, now_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MemorySink;
    use crate::odte::OdteResult;
    use std::sync::mpsc;

    fn eval(odte: f64, silence_ms: i64) -> Evaluation {
        Evaluation {
            odte,
            target_percentile: 0.9,
            silence_ms,
            unbound_threshold_ms: 10_000,
        }
    }

    fn machine_in(state: LifecycleState) -> (LifecycleMachine, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::new());
        let m = LifecycleMachine::new(sink.clone(), 0);
        m.lock().state = state;
        (m, sink)
    }

    // -----------------------------------------------------------------------
    // Pure rules
    // -----------------------------------------------------------------------

    #[test]
    fn bound_promotes_on_high_odte() {
        assert_eq!(
            next_state(LifecycleState::Bound, &eval(0.95, 0)),
            Some(LifecycleState::Shadowed)
        );
        assert_eq!(next_state(LifecycleState::Bound, &eval(0.5, 0)), None);
    }

    #[test]
    fn bound_ignores_silence() {
        assert_eq!(next_state(LifecycleState::Bound, &eval(0.5, 60_000)), None);
    }

    #[test]
    fn shadowed_demotes_on_low_odte() {
        assert_eq!(
            next_state(LifecycleState::Shadowed, &eval(0.5, 0)),
            Some(LifecycleState::UnSync)
        );
        assert_eq!(next_state(LifecycleState::Shadowed, &eval(0.9, 0)), None);
    }

    #[test]
    fn unsync_recovers_on_high_odte() {
        assert_eq!(
            next_state(LifecycleState::UnSync, &eval(1.2, 0)),
            Some(LifecycleState::Shadowed)
        );
    }

    #[test]
    fn unsync_silence_beats_promotion() {
        assert_eq!(
            next_state(LifecycleState::UnSync, &eval(1.0, 10_001)),
            Some(LifecycleState::Unbound)
        );
        // Exactly at the threshold is not yet silent.
        assert_eq!(
            next_state(LifecycleState::UnSync, &eval(0.1, 10_000)),
            None
        );
    }

    #[test]
    fn started_and_unbound_have_no_periodic_rules() {
        for s in [LifecycleState::Started, LifecycleState::Unbound] {
            assert_eq!(next_state(s, &eval(1.0, 0)), None);
            assert_eq!(next_state(s, &eval(0.0, 99_999)), None);
        }
    }

    #[test]
    fn gauge_values() {
        assert_eq!(LifecycleState::Started.gauge_value(), 1);
        assert_eq!(LifecycleState::Unbound.gauge_value(), 2);
        assert_eq!(LifecycleState::Bound.gauge_value(), 3);
        assert_eq!(LifecycleState::UnSync.gauge_value(), 4);
        assert_eq!(LifecycleState::Shadowed.gauge_value(), 5);
    }

    // -----------------------------------------------------------------------
    // Machine
    // -----------------------------------------------------------------------

    #[test]
    fn bridging_then_binding() {
        let sink = Arc::new(MemorySink::new());
        let m = LifecycleMachine::new(sink.clone(), 0);
        assert_eq!(m.current(), LifecycleState::Started);
        assert_eq!(sink.snapshot().lifecycle_state, Some(LifecycleState::Started));

        assert!(m.mark_bound(5).is_none());
        let t = m.begin_bridging(10).unwrap();
        assert_eq!((t.from, t.to), (LifecycleState::Started, LifecycleState::Unbound));
        assert!(m.begin_bridging(11).is_none());

        m.mark_bound(20).unwrap();
        assert_eq!(m.current(), LifecycleState::Bound);
        assert!(m.mark_bound(21).is_none());
        assert_eq!(sink.snapshot().lifecycle_state, Some(LifecycleState::Bound));
        assert_eq!(m.snapshot().transitions, 2);
        assert_eq!(m.snapshot().since_ms, 20);
    }

    #[test]
    fn one_transition_per_evaluation() {
        let (m, sink) = machine_in(LifecycleState::Shadowed);
        // Low ODTE and long silence: only Shadowed -> UnSync this round.
        let t = m.evaluate(&eval(0.1, 60_000), 100).unwrap();
        assert_eq!(t.to, LifecycleState::UnSync);
        assert_eq!(sink.snapshot().lifecycle_state, Some(LifecycleState::UnSync));

        let t = m.evaluate(&eval(0.1, 60_000), 200).unwrap();
        assert_eq!(t.to, LifecycleState::Unbound);
        assert!(m.evaluate(&eval(0.1, 60_000), 300).is_none());
    }

    #[test]
    fn every_transition_is_exported() {
        let (m, sink) = machine_in(LifecycleState::Bound);
        m.evaluate(&eval(0.95, 0), 1);
        m.evaluate(&eval(0.2, 0), 2);
        m.evaluate(&eval(0.95, 0), 3);
        let states: Vec<LifecycleState> = sink.snapshot().state_history;
        assert_eq!(
            states,
            vec![
                LifecycleState::Started,
                LifecycleState::Shadowed,
                LifecycleState::UnSync,
                LifecycleState::Shadowed,
            ]
        );
    }

    /// Blocks inside `set_lifecycle_state(Unbound)` until released.
    struct GatedSink {
        entered: Mutex<mpsc::Sender<()>>,
        release: Mutex<mpsc::Receiver<()>>,
    }

    impl MetricsSink for GatedSink {
        fn observe_delay(&self, _physical_ts_ms: i64, _delay_sec: f64) {}

        fn set_lifecycle_state(&self, state: LifecycleState) {
            if state == LifecycleState::Unbound {
                self.entered.lock().unwrap().send(()).unwrap();
                self.release.lock().unwrap().recv().unwrap();
            }
        }

        fn set_odte(&self, _result: &OdteResult) {}
    }

    #[test]
    fn slow_sink_does_not_block_readers() {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let sink = Arc::new(GatedSink {
            entered: Mutex::new(entered_tx),
            release: Mutex::new(release_rx),
        });
        let m = LifecycleMachine::new(sink, 0);

        std::thread::scope(|s| {
            let bridging = s.spawn(|| m.begin_bridging(10));
            entered_rx.recv().unwrap();

            // The export is still in flight; state reads go through.
            assert_eq!(m.current(), LifecycleState::Unbound);
            let snap = m.snapshot();
            assert_eq!((snap.transitions, snap.since_ms), (1, 10));
            assert!(m.begin_bridging(11).is_none());

            release_tx.send(()).unwrap();
            let t = bridging.join().unwrap().unwrap();
            assert_eq!(t.to, LifecycleState::Unbound);
        });
    }
}
