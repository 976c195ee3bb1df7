//! Durable per-run progress: window bounds, tick cursors and the
//! outcome table for every (target, record) pair.
//!
//! `load` and `save` each run inside a single SQLite transaction, so a crash
//! mid-save leaves the previous tick's state intact.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use tracing::{debug, info};

use super::{fmt_ts, history, parse_ts, Pool, Target};
use crate::error::{Result, SimError};
use crate::kind::SimulationKind;
use crate::outcome::{Attempt, Outcome};
use crate::planner::Window;

#[derive(Debug, Clone, Default)]
pub struct TargetProgress {
    /// When this target last took part in a completed tick.
    cursor: Option<DateTime<Utc>>,
    outcomes: HashMap<i64, Outcome>,
}

/// In-memory view of one simulation run. Only the [`ProgressStore`]
/// persists it; the dispatch engine reads and writes through it.
#[derive(Debug, Clone)]
pub struct RunState {
    kind: SimulationKind,
    window: Window,
    last_tick_time: Option<DateTime<Utc>>,
    targets: BTreeMap<String, TargetProgress>,
    dirty: BTreeSet<(String, i64)>,
    pending: Vec<Attempt>,
}

impl RunState {
    /// A fresh run with no history.
    pub fn new(kind: SimulationKind, window: Window) -> Self {
        Self {
            kind,
            window,
            last_tick_time: None,
            targets: BTreeMap::new(),
            dirty: BTreeSet::new(),
            pending: Vec::new(),
        }
    }

    pub fn kind(&self) -> SimulationKind {
        self.kind
    }

    pub fn window(&self) -> Window {
        self.window
    }

    pub fn last_tick_time(&self) -> Option<DateTime<Utc>> {
        self.last_tick_time
    }

    pub fn target_names(&self) -> impl Iterator<Item = &str> {
        self.targets.keys().map(String::as_str)
    }

    /// Add a target with empty history. Returns `false` if it was known.
    pub fn adopt_target(&mut self, name: &str) -> bool {
        if self.targets.contains_key(name) {
            return false;
        }
        self.targets.insert(name.to_string(), TargetProgress::default());
        true
    }

    pub fn cursor(&self, target: &str) -> Option<DateTime<Utc>> {
        self.targets.get(target).and_then(|p| p.cursor)
    }

    pub fn outcomes(&self, target: &str) -> Option<&HashMap<i64, Outcome>> {
        self.targets.get(target).map(|p| &p.outcomes)
    }

    pub fn get_outcome(&self, target: &str, record_id: i64) -> Option<Outcome> {
        self.targets
            .get(target)
            .and_then(|p| p.outcomes.get(&record_id))
            .copied()
    }

    /// Store the latest outcome for a pair, replacing any earlier one.
    pub fn set_outcome(&mut self, target: &str, record_id: i64, outcome: Outcome) {
        self.targets
            .entry(target.to_string())
            .or_default()
            .outcomes
            .insert(record_id, outcome);
        self.dirty.insert((target.to_string(), record_id));
    }

    /// Apply an attempt's outcome and queue it for the history table.
    pub fn record_attempt(&mut self, attempt: Attempt) {
        self.set_outcome(&attempt.target, attempt.record_id, attempt.outcome);
        self.pending.push(attempt);
    }

    /// Advance the run cursor and every target cursor to `now`.
    pub fn complete_tick(&mut self, now: DateTime<Utc>) {
        self.last_tick_time = Some(now);
        for progress in self.targets.values_mut() {
            progress.cursor = Some(now);
        }
    }

    /// Outcomes written since the last save.
    pub fn unsaved_outcomes(&self) -> usize {
        self.dirty.len()
    }
}

/// SQLite-backed home of every [`RunState`], keyed by simulation kind.
#[derive(Clone)]
pub struct ProgressStore {
    pool: Pool,
}

impl ProgressStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Whether a run for `kind` has been created.
    pub fn exists(&self, kind: SimulationKind) -> Result<bool> {
        let conn = self.pool.get()?;
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM simulations WHERE kind = ?1",
                params![kind.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Load the run for `kind`, creating it on first use.
    ///
    /// A new run starts its window at `now` and needs `window_end`. An
    /// existing run keeps its persisted `window_start`; a supplied
    /// `window_end` replaces the stored one. Every target in `targets` that
    /// the run has not seen yet is adopted with an empty outcome table.
    pub fn load(
        &self,
        kind: SimulationKind,
        targets: &[Target],
        window_end: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<RunState> {
        self.load_checked(kind, targets, window_end, now, |_| Ok(()))
    }

    /// Like [`load`](Self::load), but `check` must accept the resulting
    /// window before anything is committed. A rejected window leaves the
    /// store exactly as it was.
    pub fn load_checked<F>(
        &self,
        kind: SimulationKind,
        targets: &[Target],
        window_end: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
        check: F,
    ) -> Result<RunState>
    where
        F: FnOnce(Window) -> Result<()>,
    {
        let k = kind.as_str();
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;

        let row: Option<(String, String, Option<String>)> = tx
            .query_row(
                "SELECT window_start, window_end, last_tick_at FROM simulations WHERE kind = ?1",
                params![k],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        let (window, last_tick_time) = match row {
            Some((start, end, last)) => {
                let start = parse_ts(k, &start)?;
                let stored_end = parse_ts(k, &end)?;
                let window = Window::new(start, window_end.unwrap_or(stored_end))?;
                if window.end != stored_end {
                    info!(kind = %k, old_end = %stored_end, new_end = %window.end, "window end changed");
                    tx.execute(
                        "UPDATE simulations SET window_end = ?2, updated_at = datetime('now') WHERE kind = ?1",
                        params![k, fmt_ts(window.end)],
                    )?;
                }
                let last = last.map(|s| parse_ts(k, &s)).transpose()?;
                (window, last)
            }
            None => {
                let end = window_end.ok_or_else(|| {
                    SimError::config(format!(
                        "simulation '{k}' has no stored state; an end time is required on the first run"
                    ))
                })?;
                let window = Window::new(now, end)?;
                tx.execute(
                    "INSERT INTO simulations (kind, window_start, window_end) VALUES (?1, ?2, ?3)",
                    params![k, fmt_ts(window.start), fmt_ts(window.end)],
                )?;
                info!(kind = %k, start = %window.start, end = %window.end, "created simulation run");
                (window, None)
            }
        };

        check(window)?;

        let mut state = RunState::new(kind, window);
        state.last_tick_time = last_tick_time;

        {
            let mut stmt = tx.prepare("SELECT target, cursor_at FROM target_cursors WHERE kind = ?1")?;
            let rows = stmt.query_map(params![k], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
            for r in rows {
                let (target, cursor) = r?;
                state.targets.entry(target).or_default().cursor = Some(parse_ts(k, &cursor)?);
            }
        }

        let mut loaded = 0usize;
        {
            let mut stmt = tx.prepare(
                "SELECT target, record_id, outcome, status, value FROM outcomes WHERE kind = ?1",
            )?;
            let rows = stmt.query_map(params![k], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<i64>>(3)?,
                    row.get::<_, Option<f64>>(4)?,
                ))
            })?;
            for r in rows {
                let (target, record_id, label, status, value) = r?;
                let outcome = Outcome::from_columns(&label, status, value).ok_or_else(|| {
                    SimError::CorruptState {
                        kind: k.to_string(),
                        detail: format!("unreadable outcome '{label}' for {target}/{record_id}"),
                    }
                })?;
                state
                    .targets
                    .entry(target)
                    .or_default()
                    .outcomes
                    .insert(record_id, outcome);
                loaded += 1;
            }
        }

        for target in targets {
            if state.adopt_target(&target.name) && state.last_tick_time.is_some() {
                info!(kind = %k, target_name = %target.name, "new target joins with empty history");
            }
        }

        tx.commit()?;
        debug!(kind = %k, targets = state.targets.len(), outcomes = loaded, "run state loaded");
        Ok(state)
    }

    /// Persist cursors, changed outcomes and queued attempts in one
    /// transaction. On error the in-memory state keeps its unsaved changes.
    pub fn save(&self, state: &mut RunState) -> Result<()> {
        let k = state.kind.as_str();
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;

        let changed = tx.execute(
            "UPDATE simulations SET window_end = ?2, last_tick_at = ?3, updated_at = datetime('now')
             WHERE kind = ?1",
            params![k, fmt_ts(state.window.end), state.last_tick_time.map(fmt_ts)],
        )?;
        if changed == 0 {
            return Err(SimError::CorruptState {
                kind: k.to_string(),
                detail: "simulation row missing at save".to_string(),
            });
        }

        {
            let mut stmt = tx.prepare(
                "INSERT INTO target_cursors (kind, target, cursor_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(kind, target) DO UPDATE SET cursor_at = excluded.cursor_at",
            )?;
            for (name, progress) in &state.targets {
                if let Some(cursor) = progress.cursor {
                    stmt.execute(params![k, name, fmt_ts(cursor)])?;
                }
            }
        }

        let updated_at = fmt_ts(state.last_tick_time.unwrap_or_else(Utc::now));
        {
            let mut stmt = tx.prepare(
                "INSERT INTO outcomes (kind, target, record_id, outcome, status, value, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(kind, target, record_id) DO UPDATE SET
                    outcome = excluded.outcome,
                    status = excluded.status,
                    value = excluded.value,
                    updated_at = excluded.updated_at",
            )?;
            for (target, record_id) in &state.dirty {
                let Some(outcome) = state.get_outcome(target, *record_id) else {
                    continue;
                };
                let (label, status, value) = outcome.to_columns();
                stmt.execute(params![k, target, record_id, label, status, value, updated_at])?;
            }
        }

        history::insert_attempts(&tx, k, &state.pending)?;

        tx.commit()?;
        debug!(kind = %k, outcomes = state.dirty.len(), attempts = state.pending.len(), "run state saved");
        state.dirty.clear();
        state.pending.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outcome::Delivered;
    use crate::records::Record;
    use crate::storage::open_pool;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 4, 9, 0, 0).unwrap()
    }

    fn store() -> (tempfile::TempDir, ProgressStore) {
        let dir = tempfile::TempDir::new().unwrap();
        let pool = open_pool(&dir.path().join("progress.db")).unwrap();
        (dir, ProgressStore::new(pool))
    }

    fn targets(names: &[&str]) -> Vec<Target> {
        names.iter().map(|n| Target::new(*n)).collect()
    }

    #[test]
    fn test_first_load_requires_end_time() {
        let (_dir, store) = store();
        let err = store
            .load(SimulationKind::Observation, &targets(&["a"]), None, t0())
            .unwrap_err();
        assert!(matches!(err, SimError::Configuration(_)));
    }

    #[test]
    fn test_first_load_creates_empty_tables() {
        let (_dir, store) = store();
        let end = t0() + Duration::hours(2);
        let state = store
            .load(SimulationKind::Observation, &targets(&["a", "b"]), Some(end), t0())
            .unwrap();

        assert_eq!(state.window().start, t0());
        assert_eq!(state.window().end, end);
        assert_eq!(state.last_tick_time(), None);
        assert_eq!(state.target_names().collect::<Vec<_>>(), vec!["a", "b"]);
        assert!(state.outcomes("a").unwrap().is_empty());
    }

    #[test]
    fn test_save_and_reload_round_trip() {
        let (_dir, store) = store();
        let end = t0() + Duration::hours(2);
        let kind = SimulationKind::Observation;
        let mut state = store.load(kind, &targets(&["a", "b"]), Some(end), t0()).unwrap();

        let tick = t0() + Duration::seconds(30);
        state.record_attempt(Attempt {
            target: "a".into(),
            record_id: 1,
            outcome: Outcome::Success(Delivered::Probability { proba: 0.25 }),
            elapsed: Some(std::time::Duration::from_millis(40)),
            detail: None,
            attempted_at: tick,
        });
        state.set_outcome("b", 1, Outcome::HttpError(502));
        state.complete_tick(tick);
        store.save(&mut state).unwrap();
        assert_eq!(state.unsaved_outcomes(), 0);

        // A later start must not move the window.
        let reloaded = store
            .load(kind, &targets(&["a", "b"]), None, t0() + Duration::hours(1))
            .unwrap();
        assert_eq!(reloaded.window(), state.window());
        assert_eq!(reloaded.last_tick_time(), Some(tick));
        assert_eq!(reloaded.cursor("a"), Some(tick));
        assert_eq!(
            reloaded.get_outcome("a", 1),
            Some(Outcome::Success(Delivered::Probability { proba: 0.25 }))
        );
        assert_eq!(reloaded.get_outcome("b", 1), Some(Outcome::HttpError(502)));
        assert_eq!(reloaded.get_outcome("b", 2), None);
    }

    #[test]
    fn test_last_write_wins() {
        let (_dir, store) = store();
        let kind = SimulationKind::TrueOutcome;
        let mut state = store
            .load(kind, &targets(&["a"]), Some(t0() + Duration::hours(1)), t0())
            .unwrap();

        state.set_outcome("a", 9, Outcome::Timeout);
        store.save(&mut state).unwrap();
        state.set_outcome("a", 9, Outcome::Success(Delivered::Acknowledged { status: 200 }));
        store.save(&mut state).unwrap();

        let reloaded = store.load(kind, &[], None, t0()).unwrap();
        assert_eq!(
            reloaded.get_outcome("a", 9),
            Some(Outcome::Success(Delivered::Acknowledged { status: 200 }))
        );
        let conn = store.pool.get().unwrap();
        let rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM outcomes WHERE target = 'a'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(rows, 1);
    }

    #[test]
    fn test_new_target_is_merged_without_loss() {
        let (_dir, store) = store();
        let kind = SimulationKind::Observation;
        let mut state = store
            .load(kind, &targets(&["a"]), Some(t0() + Duration::hours(1)), t0())
            .unwrap();
        state.set_outcome("a", 1, Outcome::Success(Delivered::Probability { proba: 0.9 }));
        state.complete_tick(t0() + Duration::seconds(5));
        store.save(&mut state).unwrap();

        let grown = store.load(kind, &targets(&["a", "late"]), None, t0()).unwrap();
        assert_eq!(grown.target_names().collect::<Vec<_>>(), vec!["a", "late"]);
        assert!(grown.outcomes("late").unwrap().is_empty());
        assert_eq!(grown.cursor("late"), None);
        assert_eq!(
            grown.get_outcome("a", 1),
            Some(Outcome::Success(Delivered::Probability { proba: 0.9 }))
        );

        // Dropping a target from the registry never drops its history.
        let shrunk = store.load(kind, &[], None, t0()).unwrap();
        assert!(shrunk.outcomes("a").is_some());
    }

    #[test]
    fn test_end_time_override_is_persisted() {
        let (_dir, store) = store();
        let kind = SimulationKind::Observation;
        store
            .load(kind, &[], Some(t0() + Duration::hours(1)), t0())
            .unwrap();
        let extended = t0() + Duration::hours(5);
        store.load(kind, &[], Some(extended), t0()).unwrap();

        let state = store.load(kind, &[], None, t0()).unwrap();
        assert_eq!(state.window().start, t0());
        assert_eq!(state.window().end, extended);
    }

    #[test]
    fn test_end_before_start_is_rejected() {
        let (_dir, store) = store();
        let kind = SimulationKind::Observation;
        store
            .load(kind, &[], Some(t0() + Duration::hours(1)), t0())
            .unwrap();
        let err = store
            .load(kind, &[], Some(t0() - Duration::hours(1)), t0())
            .unwrap_err();
        assert!(matches!(err, SimError::Configuration(_)));
    }

    #[test]
    fn test_kinds_are_independent() {
        let (_dir, store) = store();
        let mut obs = store
            .load(SimulationKind::Observation, &targets(&["a"]), Some(t0() + Duration::hours(1)), t0())
            .unwrap();
        obs.set_outcome("a", 1, Outcome::DecodeError);
        store.save(&mut obs).unwrap();

        let truth = store
            .load(
                SimulationKind::TrueOutcome,
                &targets(&["a"]),
                Some(t0() + Duration::hours(3)),
                t0() + Duration::minutes(10),
            )
            .unwrap();
        assert_eq!(truth.get_outcome("a", 1), None);
        assert_eq!(truth.window().start, t0() + Duration::minutes(10));
    }

    #[test]
    fn test_corrupt_outcome_row_is_reported() {
        let (_dir, store) = store();
        let kind = SimulationKind::Observation;
        store
            .load(kind, &[], Some(t0() + Duration::hours(1)), t0())
            .unwrap();
        {
            let conn = store.pool.get().unwrap();
            conn.execute(
                "INSERT INTO outcomes (kind, target, record_id, outcome, updated_at)
                 VALUES ('observation', 'a', 1, 'mystery', '2026-05-04T09:00:00Z')",
                [],
            )
            .unwrap();
        }
        let err = store.load(kind, &[], None, t0()).unwrap_err();
        assert!(matches!(err, SimError::CorruptState { .. }));
    }

    #[test]
    fn test_rejected_window_is_not_persisted() {
        let (_dir, store) = store();
        let kind = SimulationKind::TrueOutcome;
        let end = t0() + Duration::hours(1);

        let err = store
            .load_checked(kind, &targets(&["a"]), Some(end), t0(), |_| {
                Err(SimError::config("records not usable"))
            })
            .unwrap_err();
        assert!(matches!(err, SimError::Configuration(_)));
        assert!(!store.exists(kind).unwrap());

        // An existing run keeps its stored end when the override is rejected.
        store.load(kind, &[], Some(end), t0()).unwrap();
        let records: Vec<Record> = (1..=2)
            .map(|id| Record {
                id,
                payload: Default::default(),
                truth_label: Some(1),
            })
            .collect();
        let narrow = t0() + Duration::nanoseconds(1);
        store
            .load_checked(kind, &[], Some(narrow), t0(), |w| crate::planner::plan(&records, w).map(drop))
            .unwrap_err();
        let state = store.load(kind, &[], None, t0()).unwrap();
        assert_eq!(state.window().end, end);
    }
}
