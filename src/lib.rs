//! simdispatch -- windowed, resumable delivery of test records to HTTP
//! endpoints.
//!
//! A fixed, ordered record set is spread evenly over a wall-clock window and
//! delivered to every registered target exactly once per success. Outcomes
//! are persisted after every tick, so the process can be stopped and resumed
//! without re-sending delivered records or moving the schedule.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod kind;
pub mod outcome;
pub mod planner;
pub mod records;
pub mod report;
pub mod scheduler;
pub mod storage;

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};

use crate::config::SimConfig;
use crate::dispatch::{DispatchEngine, DispatchSettings, HttpEndpoint};
use crate::kind::SimulationKind;
use crate::scheduler::{RunReport, SchedulerLoop};
use crate::storage::{ProgressStore, TargetRegistry};

/// Run (or resume) the simulation of `kind` until its window closes or the
/// process receives Ctrl-C.
pub async fn run_simulation(
    config: &SimConfig,
    kind: SimulationKind,
    window_end: Option<DateTime<Utc>>,
) -> Result<RunReport> {
    // 1. Configuration and inputs
    config.validate()?;
    let sim = config.simulation(kind);
    let records = records::load_records(&sim.record_files, &sim.label_field)?;
    if records.is_empty() {
        return Err(error::SimError::config(format!("no records found for simulation '{kind}'")).into());
    }
    kind.validate(&records)?;

    // 2. Storage
    let db_path = &config.storage.db_path;
    tracing::info!(db_path = %db_path.display(), "Initializing database");
    let pool = storage::open_pool(db_path)?;
    let targets = TargetRegistry::new(pool.clone()).list()?;
    if targets.is_empty() {
        tracing::warn!(%kind, "no targets registered; ticks will dispatch nothing");
    }
    let store = ProgressStore::new(pool);
    // The window is only committed once the records can be planned into it.
    let state = store
        .load_checked(kind, &targets, window_end, Utc::now(), |window| {
            planner::plan(&records, window).map(drop)
        })
        .with_context(|| format!("failed to load state for simulation '{kind}'"))?;

    // 3. Dispatch
    let endpoint = HttpEndpoint::new(sim.endpoint_template.clone(), config.dispatch.request_timeout())?;
    let settings = DispatchSettings {
        max_in_flight: config.dispatch.max_in_flight,
        request_timeout: config.dispatch.request_timeout(),
        max_catchup: config.dispatch.max_catchup(),
    };
    let engine = DispatchEngine::new(kind, Arc::new(endpoint), settings);

    // 4. Scheduler
    let scheduler = SchedulerLoop::new(engine, store, state, records, config.dispatch.poll_interval())?;
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };
    let report = scheduler::run_scheduler_loop(scheduler, shutdown).await?;
    Ok(report)
}
