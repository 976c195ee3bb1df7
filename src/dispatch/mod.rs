//! Dispatch engine: picks the (target, record) pairs due on a tick and
//! delivers them with bounded concurrency.
//!
//! A pair is due on a tick at `now` when its outcome is not a success and
//! its deadline `d` satisfies `now - max_catchup <= d <= now`, and either
//!
//! * it has never been attempted and `d` lies after the target's cursor
//!   (inclusive of the window start for a target without a cursor), or
//! * its last attempt failed.
//!
//! Outcomes are collected per tick and merged into the [`RunState`] serially
//! once every task has resolved.

pub mod classify;
pub mod http;

use std::collections::HashMap;
use std::ops::Bound;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::{self, JoinSet};
use tracing::{debug, error, info, warn};

use crate::kind::SimulationKind;
use crate::outcome::Attempt;
use crate::planner::{Deadline, Schedule};
use crate::records::Record;
use crate::storage::RunState;

pub use classify::classify;
pub use http::HttpEndpoint;

/// Raw result of one outbound call, before classification.
#[derive(Debug, Clone, PartialEq)]
pub enum RawResponse {
    /// No response: connect error, reset, or timeout.
    Failed { timed_out: bool, detail: String },
    Received { status: u16, body: Vec<u8> },
}

/// Delivery transport for one simulation kind.
#[async_trait::async_trait]
pub trait Endpoint: Send + Sync {
    /// Deliver `body` to `target`. Transport problems are reported in the
    /// returned value, never as a panic or error.
    async fn deliver(&self, target: &str, body: &Value) -> RawResponse;
}

#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub max_in_flight: usize,
    pub request_timeout: Duration,
    pub max_catchup: chrono::Duration,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            max_in_flight: 50,
            request_timeout: Duration::from_secs(30),
            max_catchup: chrono::Duration::hours(1),
        }
    }
}

/// A (target, deadline) pair selected for delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DueItem {
    pub target: String,
    pub deadline: Deadline,
    pub retry: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub dispatched: usize,
    pub retried: usize,
    pub succeeded: usize,
    pub failed: usize,
}

pub struct DispatchEngine {
    kind: SimulationKind,
    endpoint: Arc<dyn Endpoint>,
    settings: DispatchSettings,
}

impl DispatchEngine {
    pub fn new(kind: SimulationKind, endpoint: Arc<dyn Endpoint>, settings: DispatchSettings) -> Self {
        Self {
            kind,
            endpoint,
            settings,
        }
    }

    /// Every pair due at `now`, grouped by target in name order.
    pub fn due_items(&self, state: &RunState, schedule: &Schedule, now: DateTime<Utc>) -> Vec<DueItem> {
        let window_start = schedule.window().start;
        let floor = now
            .checked_sub_signed(self.settings.max_catchup)
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
            .max(window_start);

        let mut due = Vec::new();
        for target in state.target_names() {
            let fresh_after = state.cursor(target).map(|c| c.max(floor));
            for deadline in schedule.due_between(Bound::Included(floor), now) {
                let retry = match state.get_outcome(target, deadline.record_id) {
                    Some(outcome) if outcome.is_success() => continue,
                    Some(_) => true,
                    None => match fresh_after {
                        Some(after) if deadline.due_at <= after => continue,
                        _ => false,
                    },
                };
                due.push(DueItem {
                    target: target.to_string(),
                    deadline: *deadline,
                    retry,
                });
            }
        }
        due
    }

    /// Run one dispatch cycle: deliver every due pair, record the outcomes
    /// and advance the cursors to `now`. Persisting is the caller's job.
    pub async fn tick(
        &self,
        state: &mut RunState,
        schedule: &Schedule,
        records: &[Record],
        now: DateTime<Utc>,
    ) -> TickSummary {
        let due = self.due_items(state, schedule, now);
        let mut summary = TickSummary {
            dispatched: due.len(),
            retried: due.iter().filter(|d| d.retry).count(),
            ..Default::default()
        };

        if !due.is_empty() {
            debug!(
                kind = %self.kind,
                due = due.len(),
                retries = summary.retried,
                "dispatching due records"
            );
        }

        let semaphore = Arc::new(Semaphore::new(self.settings.max_in_flight));
        // The client timeout should fire first; this guard covers transports
        // that ignore it.
        let hard_limit = self.settings.request_timeout + Duration::from_secs(1);
        let mut bodies: HashMap<usize, Arc<Value>> = HashMap::new();
        let mut joins = JoinSet::new();
        let mut in_flight: HashMap<task::Id, DueItem> = HashMap::new();

        for item in due {
            let Some(record) = records.get(item.deadline.index) else {
                error!(index = item.deadline.index, "deadline points past the record list");
                continue;
            };
            let body = bodies
                .entry(item.deadline.index)
                .or_insert_with(|| Arc::new(self.kind.body(record)))
                .clone();
            let endpoint = self.endpoint.clone();
            let semaphore = semaphore.clone();
            let fallback = item.clone();

            let handle = joins.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                let attempted_at = Utc::now();
                let started = Instant::now();
                let call = AssertUnwindSafe(endpoint.deliver(&item.target, &body)).catch_unwind();
                let raw = match tokio::time::timeout(hard_limit, call).await {
                    Ok(Ok(raw)) => raw,
                    Ok(Err(_)) => RawResponse::Failed {
                        timed_out: false,
                        detail: "endpoint task panicked".to_string(),
                    },
                    Err(_) => RawResponse::Failed {
                        timed_out: true,
                        detail: format!("no response within {}s", hard_limit.as_secs()),
                    },
                };
                (item, raw, started.elapsed(), attempted_at)
            });
            in_flight.insert(handle.id(), fallback);
        }

        let mut attempts = Vec::with_capacity(summary.dispatched);
        while let Some(joined) = joins.join_next_with_id().await {
            let (item, raw, elapsed, attempted_at) = match joined {
                Ok((id, done)) => {
                    in_flight.remove(&id);
                    done
                }
                Err(e) => {
                    let Some(item) = in_flight.remove(&e.id()) else {
                        error!(error = %e, "unknown dispatch task did not complete");
                        continue;
                    };
                    error!(
                        target_name = %item.target,
                        record_id = item.deadline.record_id,
                        error = %e,
                        "dispatch task did not complete"
                    );
                    let raw = RawResponse::Failed {
                        timed_out: false,
                        detail: format!("dispatch task failed: {e}"),
                    };
                    (item, raw, Duration::ZERO, Utc::now())
                }
            };
            let (outcome, detail) = classify(self.kind, &raw);
            if outcome.is_success() {
                summary.succeeded += 1;
            } else {
                summary.failed += 1;
                debug!(
                    target_name = %item.target,
                    record_id = item.deadline.record_id,
                    %outcome,
                    detail = detail.as_deref().unwrap_or(""),
                    "delivery failed"
                );
            }
            attempts.push(Attempt {
                target: item.target,
                record_id: item.deadline.record_id,
                outcome,
                elapsed: Some(elapsed),
                detail,
                attempted_at,
            });
        }

        // Deterministic merge order regardless of completion order.
        attempts.sort_by(|a, b| (&a.target, a.record_id).cmp(&(&b.target, b.record_id)));
        for attempt in attempts {
            state.record_attempt(attempt);
        }
        state.complete_tick(now);

        if summary.dispatched > 0 {
            if summary.failed > 0 {
                warn!(
                    kind = %self.kind,
                    dispatched = summary.dispatched,
                    succeeded = summary.succeeded,
                    failed = summary.failed,
                    "tick finished with failures"
                );
            } else {
                info!(kind = %self.kind, dispatched = summary.dispatched, "tick finished");
            }
        }
        summary
    }
}
