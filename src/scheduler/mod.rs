//! Scheduler loop: drives dispatch ticks at a fixed cadence until the
//! delivery window closes.
//!
//! Ticks never overlap. Each tick dispatches, merges outcomes and persists
//! the run state before the next one can start.

pub mod engine;

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::info;

use crate::dispatch::{DispatchEngine, TickSummary};
use crate::error::{Result, SimError};
use crate::planner::{self, Schedule};
use crate::records::Record;
use crate::storage::{ProgressStore, RunState};

pub use self::engine::run_scheduler_loop;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopPhase {
    /// Waiting for the next tick.
    Idle,
    /// A dispatch cycle is in flight.
    Ticking,
    /// `now >= window_end`; no further ticks for this simulation kind.
    WindowClosed,
}

/// Totals over the lifetime of one loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunReport {
    pub ticks: u64,
    pub dispatched: usize,
    pub succeeded: usize,
    pub failed: usize,
}

impl RunReport {
    fn absorb(&mut self, tick: TickSummary) {
        self.ticks += 1;
        self.dispatched += tick.dispatched;
        self.succeeded += tick.succeeded;
        self.failed += tick.failed;
    }
}

pub struct SchedulerLoop {
    engine: DispatchEngine,
    store: ProgressStore,
    state: RunState,
    schedule: Schedule,
    records: Vec<Record>,
    poll_interval: Duration,
    phase: LoopPhase,
    report: RunReport,
}

impl SchedulerLoop {
    /// Plan deadlines and check the record set. Configuration problems
    /// surface here, before any tick runs.
    pub fn new(
        engine: DispatchEngine,
        store: ProgressStore,
        state: RunState,
        records: Vec<Record>,
        poll_interval: Duration,
    ) -> Result<Self> {
        if poll_interval.is_zero() {
            return Err(SimError::config("poll interval must be positive"));
        }
        state.kind().validate(&records)?;
        let schedule = planner::plan(&records, state.window())?;
        info!(
            kind = %state.kind(),
            records = schedule.len(),
            targets = state.target_names().count(),
            start = %state.window().start,
            end = %state.window().end,
            "scheduler ready"
        );
        Ok(Self {
            engine,
            store,
            state,
            schedule,
            records,
            poll_interval,
            phase: LoopPhase::Idle,
            report: RunReport::default(),
        })
    }

    pub fn phase(&self) -> LoopPhase {
        self.phase
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    pub fn report(&self) -> RunReport {
        self.report
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Run one tick at `now` and persist the result. A persistence error
    /// is returned to the caller and ends the loop.
    pub async fn tick_at(&mut self, now: DateTime<Utc>) -> Result<TickSummary> {
        if self.phase == LoopPhase::WindowClosed {
            return Ok(TickSummary::default());
        }

        self.phase = LoopPhase::Ticking;
        let summary = self
            .engine
            .tick(&mut self.state, &self.schedule, &self.records, now)
            .await;
        self.store.save(&mut self.state)?;
        self.report.absorb(summary);

        self.phase = if now >= self.state.window().end {
            info!(kind = %self.state.kind(), "delivery window closed");
            LoopPhase::WindowClosed
        } else {
            LoopPhase::Idle
        };
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{DispatchSettings, Endpoint, RawResponse};
    use crate::kind::SimulationKind;
    use crate::outcome::{Delivered, Outcome};
    use crate::storage::{open_pool, Target};
    use chrono::TimeZone;
    use serde_json::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Default)]
    struct Counting {
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl Endpoint for Counting {
        async fn deliver(&self, _target: &str, _body: &Value) -> RawResponse {
            self.calls.fetch_add(1, Ordering::SeqCst);
            RawResponse::Received {
                status: 200,
                body: br#"{"proba": 0.25}"#.to_vec(),
            }
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 7, 1, 0, 0, 0).unwrap()
    }

    fn records(n: i64) -> Vec<Record> {
        (1..=n)
            .map(|id| Record {
                id,
                payload: Default::default(),
                truth_label: None,
            })
            .collect()
    }

    fn build(
        store: &ProgressStore,
        endpoint: Arc<Counting>,
        records: Vec<Record>,
        now: DateTime<Utc>,
    ) -> Result<SchedulerLoop> {
        let state = store.load(
            SimulationKind::Observation,
            &[Target::new("a"), Target::new("b")],
            Some(t0() + chrono::Duration::seconds(40)),
            now,
        )?;
        let settings = DispatchSettings {
            max_catchup: chrono::Duration::days(1),
            ..Default::default()
        };
        let engine = DispatchEngine::new(SimulationKind::Observation, endpoint, settings);
        SchedulerLoop::new(engine, store.clone(), state, records, Duration::from_millis(10))
    }

    #[tokio::test]
    async fn test_zero_records_fails_before_ticking() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = ProgressStore::new(open_pool(&dir.path().join("s.db")).unwrap());
        let err = build(&store, Arc::default(), Vec::new(), t0()).err().unwrap();
        assert!(matches!(err, SimError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_window_closes_after_final_tick() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = ProgressStore::new(open_pool(&dir.path().join("s.db")).unwrap());
        let endpoint = Arc::new(Counting::default());
        let mut sched = build(&store, endpoint.clone(), records(4), t0()).unwrap();
        assert_eq!(sched.phase(), LoopPhase::Idle);

        sched.tick_at(t0() + chrono::Duration::seconds(15)).await.unwrap();
        assert_eq!(sched.phase(), LoopPhase::Idle);
        assert_eq!(endpoint.calls.load(Ordering::SeqCst), 4);

        // Past the end: the last deadlines still go out, then the loop stops.
        sched.tick_at(t0() + chrono::Duration::seconds(41)).await.unwrap();
        assert_eq!(sched.phase(), LoopPhase::WindowClosed);
        assert_eq!(endpoint.calls.load(Ordering::SeqCst), 8);
        assert_eq!(sched.report().ticks, 2);

        let idle = sched.tick_at(t0() + chrono::Duration::seconds(50)).await.unwrap();
        assert_eq!(idle.dispatched, 0);
        assert_eq!(sched.report().ticks, 2);
    }

    #[tokio::test]
    async fn test_restart_resumes_without_resending() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("s.db");
        let endpoint = Arc::new(Counting::default());

        {
            let store = ProgressStore::new(open_pool(&path).unwrap());
            let mut sched = build(&store, endpoint.clone(), records(4), t0()).unwrap();
            sched.tick_at(t0() + chrono::Duration::seconds(12)).await.unwrap();
        }
        assert_eq!(endpoint.calls.load(Ordering::SeqCst), 4);

        // "Restart": fresh pool, fresh loop, later wall clock.
        let store = ProgressStore::new(open_pool(&path).unwrap());
        let mut sched = build(&store, endpoint.clone(), records(4), t0() + chrono::Duration::seconds(13)).unwrap();
        assert_eq!(sched.state().window().start, t0());
        assert_eq!(
            sched.state().get_outcome("a", 1),
            Some(Outcome::Success(Delivered::Probability { proba: 0.25 }))
        );

        sched.tick_at(t0() + chrono::Duration::seconds(14)).await.unwrap();
        assert_eq!(endpoint.calls.load(Ordering::SeqCst), 4);

        sched.tick_at(t0() + chrono::Duration::seconds(21)).await.unwrap();
        assert_eq!(endpoint.calls.load(Ordering::SeqCst), 6);
    }
}
