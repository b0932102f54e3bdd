use super::Scheduler;
use crate::queue;
use crate::store::services::{self, ServiceStatus};
use anyhow::Result;
use chrono::Duration as ChronoDuration;
use tokio::time::{self, Duration};
use tokio_util::sync::CancellationToken;

/// Periodic sweep reconciling declared desired state (services marked UP
/// with a refresh interval) against the queue's actual contents. Jobs lost
/// to crashes get re-armed; `schedule`'s replace semantics make the sweep
/// idempotent and safe to run concurrently with the worker.
pub(crate) async fn run(scheduler: std::sync::Arc<Scheduler>, cancel: CancellationToken) {
    let period = Duration::from_secs(scheduler.config.scheduler.reconcile_secs.max(1));
    // the first tick fires immediately, covering the cold-start case where
    // the queue store came up empty
    let mut tick = time::interval(period);

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = tick.tick() => {}
        }

        match sweep(&scheduler) {
            Ok(0) => tracing::debug!("reconciliation sweep: queue consistent"),
            Ok(armed) => tracing::info!(armed, "reconciliation sweep re-armed services"),
            Err(error) => tracing::warn!("reconciliation sweep failed: {error:#}"),
        }
    }
}

/// One sweep pass. Returns how many services were re-armed.
pub(crate) fn sweep(scheduler: &Scheduler) -> Result<usize> {
    let up_services = services::services_with_status(&scheduler.config, ServiceStatus::Up)?;

    let mut armed = 0;
    for service in up_services {
        if service.interval_ms <= 0 {
            continue;
        }
        if queue::has_pending(&scheduler.config, &service.id)? {
            continue;
        }

        tracing::warn!(
            service_id = %service.id,
            "service missing from the queue; re-arming"
        );
        queue::schedule(
            &scheduler.config,
            &service.id,
            ChronoDuration::milliseconds(service.interval_ms),
        )?;
        armed += 1;
    }

    Ok(armed)
}
