use super::Scheduler;
use crate::queue::{self, JobOutcome, ScheduledJob};
use crate::store::services::{self, ServiceStatus};
use anyhow::Result;
use chrono::{Duration as ChronoDuration, Utc};
use tokio::time::{self, Duration};
use tokio_util::sync::CancellationToken;

const MIN_POLL_SECONDS: u64 = 1;

pub(crate) enum ExecuteOutcome {
    Done,
    /// The service was deleted while its job was queued; expected, not an
    /// error, and never retried.
    ServiceGone,
}

pub(crate) async fn run(scheduler: std::sync::Arc<Scheduler>, cancel: CancellationToken) {
    let poll_secs = scheduler.config.scheduler.poll_secs.max(MIN_POLL_SECONDS);
    let mut poll = time::interval(Duration::from_secs(poll_secs));

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = poll.tick() => {}
        }

        loop {
            match process_one(&scheduler).await {
                Ok(true) => {
                    if cancel.is_cancelled() {
                        return;
                    }
                }
                Ok(false) => break,
                Err(error) => {
                    tracing::warn!("worker poll failed: {error:#}");
                    break;
                }
            }
        }
    }
}

/// Claim and process at most one due job. Returns whether one was claimed.
pub(crate) async fn process_one(scheduler: &Scheduler) -> Result<bool> {
    let Some(job) = queue::claim_due(&scheduler.config, Utc::now())? else {
        return Ok(false);
    };
    process_job(scheduler, &job).await;
    Ok(true)
}

async fn process_job(scheduler: &Scheduler, job: &ScheduledJob) {
    match execute_service(scheduler, &job.service_id).await {
        Ok(ExecuteOutcome::Done) => {
            if let Err(error) = queue::complete(&scheduler.config, job) {
                tracing::warn!(job_id = %job.id, "could not complete job: {error:#}");
            }
        }
        Ok(ExecuteOutcome::ServiceGone) => {
            tracing::info!(
                service_id = %job.service_id,
                "service deleted while its job was queued; dropping job"
            );
            if let Err(error) = queue::complete(&scheduler.config, job) {
                tracing::warn!(job_id = %job.id, "could not drop job: {error:#}");
            }
        }
        Err(error) => {
            let message = format!("{error:#}");
            tracing::warn!(
                service_id = %job.service_id,
                attempt = job.attempts,
                "service update failed: {message}"
            );

            match queue::retry(&scheduler.config, job, &message) {
                Ok(JobOutcome::Retried { due_at }) => {
                    tracing::info!(
                        service_id = %job.service_id,
                        due_at = %due_at.to_rfc3339(),
                        "retrying with backoff"
                    );
                }
                Ok(JobOutcome::Exhausted) => {
                    let reason = format!("{} - {message}", Utc::now().to_rfc3339());
                    if let Err(error) =
                        services::mark_failed(&scheduler.config, &job.service_id, &reason)
                    {
                        tracing::error!(
                            service_id = %job.service_id,
                            "could not mark service failed: {error:#}"
                        );
                    }
                    tracing::warn!(
                        service_id = %job.service_id,
                        "attempts exhausted; service parked as FAILED"
                    );
                }
                Ok(JobOutcome::Superseded) => {
                    tracing::debug!(
                        service_id = %job.service_id,
                        "job replaced mid-flight; dropping result"
                    );
                }
                Err(error) => {
                    tracing::error!(job_id = %job.id, "retry accounting failed: {error:#}");
                }
            }
        }
    }
}

/// One refresh cycle for one service: load, resolve the driver, validate,
/// run the update under its deadline, stamp, and re-arm when still UP.
pub(crate) async fn execute_service(
    scheduler: &Scheduler,
    service_id: &str,
) -> Result<ExecuteOutcome> {
    let Some(service) = services::find_service(&scheduler.config, service_id)? else {
        return Ok(ExecuteOutcome::ServiceGone);
    };

    let driver = scheduler.drivers.get(&service.type_tag)?;
    let ctx = scheduler.driver_context(
        &service.identity_id,
        &service.id,
        service.configuration.clone(),
    );

    if !driver.init(&ctx) {
        anyhow::bail!(
            "configuration rejected by driver '{}' for service {service_id}",
            service.type_tag
        );
    }

    let deadline = Duration::from_secs(scheduler.config.scheduler.update_timeout_secs);
    time::timeout(deadline, driver.update(&ctx))
        .await
        .map_err(|_| {
            anyhow::anyhow!(
                "update timed out after {}s",
                scheduler.config.scheduler.update_timeout_secs
            )
        })??;

    services::touch_last_updated(&scheduler.config, service_id)?;

    // Re-read before re-arming: a concurrent disable or removal between
    // update and here must win.
    if let Some(current) = services::find_service(&scheduler.config, service_id)?
        && current.status == ServiceStatus::Up
        && current.interval_ms > 0
    {
        queue::schedule(
            &scheduler.config,
            service_id,
            ChronoDuration::milliseconds(current.interval_ms),
        )?;
    }

    Ok(ExecuteOutcome::Done)
}
