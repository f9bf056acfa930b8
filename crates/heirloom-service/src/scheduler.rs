//! Optional in-process ticker for deployments without an external cron.

use heirloom_core::{HeirloomError, ReconciliationEngine, RunReport};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};

/// Execute one scheduled run and log its outcome.
pub async fn run_scheduled(engine: &ReconciliationEngine) -> Result<RunReport, HeirloomError> {
    match engine.run().await {
        Ok(report) => {
            for failure in &report.errors {
                warn!(
                    vault_id = %failure.vault_id,
                    beneficiary_id = ?failure.beneficiary_id,
                    error = %failure.message,
                    "Run recorded a per-item failure"
                );
            }
            info!(
                warnings_sent = report.warnings_sent,
                reminders_sent = report.reminders_sent,
                triggers_executed = report.triggers_executed,
                skipped = report.skipped,
                errors = report.errors.len(),
                "Scheduled run finished"
            );
            Ok(report)
        }
        Err(err) => {
            error!(error = %err, batch_fatal = err.is_batch_fatal(), "Scheduled run aborted");
            Err(err)
        }
    }
}

/// Spawn a loop that runs the engine every `period`. The first run starts immediately.
///
/// A tick that lands while the previous run is still going is skipped.
pub fn spawn_ticker(engine: Arc<ReconciliationEngine>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(period_secs = period.as_secs(), "Scheduler started");

        loop {
            ticker.tick().await;
            // Failures are logged inside; the next tick retries from scratch.
            let _ = run_scheduled(&engine).await;
        }
    })
}
