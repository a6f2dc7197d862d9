use std::sync::Arc;
use std::time::Duration;

use batch_orchestrator::{BatchLimits, BatchOrchestrator};
use tokio::sync::watch;
use tokio::time::{self, MissedTickBehavior};
use tracing::{error, info};

/// Run a batch every `period` until `shutdown` flips.
///
/// The first batch starts immediately. A batch that is running when shutdown
/// arrives stops admitting items and lets its admitted ones finish before the
/// loop exits; overrun ticks are skipped.
pub async fn run_scheduler(
    orchestrator: Arc<BatchOrchestrator>,
    limits: BatchLimits,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> u64 {
    let mut interval = time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut batches = 0u64;

    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => {
                info!(batches, "Scheduler stopping");
                break;
            }
            _ = interval.tick() => {
                batches += 1;
                run_once(&orchestrator, &limits, shutdown.clone(), batches).await;
            }
        }
    }
    batches
}

async fn run_once(
    orchestrator: &BatchOrchestrator,
    limits: &BatchLimits,
    shutdown: watch::Receiver<bool>,
    batch: u64,
) {
    info!(batch, max_items = limits.max_items, budget = %limits.max_cost_budget, "Batch starting");

    match orchestrator.run_batch_until(limits, shutdown).await {
        Ok(report) => info!(
            batch,
            analyzed = report.analyzed,
            inserted = report.inserted,
            skipped = report.skipped,
            errors = report.errors,
            total_cost = %report.total_cost,
            stop_reason = ?report.stop_reason,
            duration_ms = report.duration_ms,
            "Batch finished"
        ),
        Err(e) => error!(batch, error = %e, "Batch failed"),
    }
}
