use std::future::Future;

use chrono::Utc;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, info_span, Instrument};
use uuid::Uuid;

use super::{LoopPhase, RunReport, SchedulerLoop};
use crate::error::Result;

/// Main scheduler execution loop.
///
/// Ticks every `poll_interval` until the window closes or `shutdown`
/// resolves. Shutdown is only observed between ticks, so the last completed
/// tick is always persisted. Storage errors end the loop.
pub async fn run_scheduler_loop<F>(mut scheduler: SchedulerLoop, shutdown: F) -> Result<RunReport>
where
    F: Future<Output = ()>,
{
    let kind = scheduler.state().kind();
    info!(%kind, interval_ms = scheduler.poll_interval().as_millis() as u64, "scheduler loop started");

    let mut interval = tokio::time::interval(scheduler.poll_interval());
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!(%kind, "shutdown requested; stopping between ticks");
                break;
            }
            _ = interval.tick() => {}
        }

        let span = info_span!("tick", tick_id = %Uuid::new_v4(), %kind);
        if let Err(e) = scheduler.tick_at(Utc::now()).instrument(span).await {
            error!(%kind, error = %e, "tick failed; stopping scheduler");
            return Err(e);
        }

        if scheduler.phase() == LoopPhase::WindowClosed {
            break;
        }
    }

    let report = scheduler.report();
    info!(
        %kind,
        ticks = report.ticks,
        dispatched = report.dispatched,
        succeeded = report.succeeded,
        failed = report.failed,
        "scheduler loop finished"
    );
    Ok(report)
}
