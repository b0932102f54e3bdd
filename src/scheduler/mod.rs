//! The scheduler: one explicitly constructed value owning the worker loop
//! and the reconciliation sweep, with a documented start/stop lifecycle.

pub mod reconcile;
pub mod worker;

use crate::config::Config;
use crate::identity::{CredentialStore, IdentityRegistry, TokenAuthority};
use crate::queue;
use crate::security::SecretCipher;
use crate::service::{DriverContext, ServiceRegistry};
use anyhow::{Context, Result};
use chrono::Duration as ChronoDuration;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub struct Scheduler {
    pub(crate) config: Arc<Config>,
    pub(crate) drivers: Arc<ServiceRegistry>,
    pub(crate) authority: Arc<TokenAuthority>,
    pub(crate) http: reqwest::Client,
}

impl Scheduler {
    pub fn new(
        config: Arc<Config>,
        drivers: Arc<ServiceRegistry>,
        authority: Arc<TokenAuthority>,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.scheduler.update_timeout_secs))
            .build()
            .expect("failed to build scheduler HTTP client");

        Self {
            config,
            drivers,
            authority,
            http,
        }
    }

    /// Scheduler wired with the built-in driver and provider registries.
    pub fn with_builtin_registries(config: Arc<Config>) -> Result<Self> {
        let cipher = Arc::new(SecretCipher::from_config(&config)?);
        let providers = Arc::new(IdentityRegistry::with_builtin_providers(&config));
        let credentials = CredentialStore::new(Arc::clone(&config), cipher);
        let authority = Arc::new(TokenAuthority::new(
            Arc::clone(&config),
            credentials,
            providers,
        ));
        let drivers = Arc::new(ServiceRegistry::with_builtin_drivers());
        Ok(Self::new(config, drivers, authority))
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub fn drivers(&self) -> &Arc<ServiceRegistry> {
        &self.drivers
    }

    pub fn authority(&self) -> &Arc<TokenAuthority> {
        &self.authority
    }

    /// Arm (or re-arm) the refresh job for a service. Replace semantics:
    /// exactly one outstanding job exists for the service afterwards.
    pub fn schedule_service(&self, service_id: &str, interval_ms: i64) -> Result<()> {
        queue::schedule(
            &self.config,
            service_id,
            ChronoDuration::milliseconds(interval_ms.max(0)),
        )?;
        Ok(())
    }

    /// Drop any outstanding job for a service. No-op when none exist.
    pub fn cancel_service(&self, service_id: &str) -> Result<()> {
        queue::cancel(&self.config, service_id)?;
        Ok(())
    }

    /// Manual refresh: one worker iteration for this service, run in the
    /// caller. May race with an already-dequeued automatic job; that race
    /// is benign (last writer wins on `last_updated`) because `schedule`
    /// replaces rather than duplicates.
    pub async fn run_once(&self, service_id: &str) -> Result<()> {
        match worker::execute_service(self, service_id).await? {
            worker::ExecuteOutcome::Done => Ok(()),
            worker::ExecuteOutcome::ServiceGone => {
                anyhow::bail!("Service '{service_id}' not found")
            }
        }
    }

    /// Process every currently-due job once. Returns the number handled.
    /// The run loop calls this on its poll interval; tests and embedders
    /// can call it directly to pump the queue.
    pub async fn drain_due(&self) -> Result<usize> {
        let mut handled = 0;
        while worker::process_one(self).await? {
            handled += 1;
        }
        Ok(handled)
    }

    /// One reconciliation sweep, run in the caller. Returns how many
    /// services were re-armed. The background loop calls this on its
    /// period; embedders can call it directly after a cold start.
    pub fn reconcile_now(&self) -> Result<usize> {
        reconcile::sweep(self)
    }

    /// Spawn the worker loop and the reconciliation loop. The returned
    /// handle owns both; dropping it detaches them, `shutdown` stops them.
    pub fn start(self: &Arc<Self>) -> SchedulerHandle {
        let cancel = CancellationToken::new();

        let worker_task = tokio::spawn(worker::run(Arc::clone(self), cancel.child_token()));
        let reconcile_task = tokio::spawn(reconcile::run(Arc::clone(self), cancel.child_token()));

        tracing::info!("scheduler started");
        SchedulerHandle {
            cancel,
            tasks: vec![worker_task, reconcile_task],
        }
    }

    pub(crate) fn driver_context(
        &self,
        identity_id: &str,
        service_id: &str,
        configuration: Value,
    ) -> DriverContext {
        DriverContext::new(
            Arc::clone(&self.config),
            Arc::clone(&self.authority),
            self.http.clone(),
            identity_id.to_string(),
            service_id.to_string(),
            configuration,
        )
    }
}

/// Running scheduler loops. `shutdown` requests cancellation and waits for
/// in-flight work to finish; it never abandons a mid-flight job.
pub struct SchedulerHandle {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl SchedulerHandle {
    pub async fn shutdown(self) -> Result<()> {
        self.cancel.cancel();
        for task in self.tasks {
            task.await.context("scheduler task panicked")?;
        }
        tracing::info!("scheduler stopped");
        Ok(())
    }
}
