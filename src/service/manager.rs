use super::DriverDescriptor;
use crate::config::Config;
use crate::scheduler::Scheduler;
use crate::store::identities;
use crate::store::services::{self, NewService, ServiceRecord, ServiceStatus};
use anyhow::Result;
use serde_json::Value;
use std::sync::Arc;

/// Service lifecycle operations the application surface calls: attach,
/// remove, enable/disable, manual refresh. Configuration problems fail fast
/// here and never enter the queue.
pub struct ServiceManager {
    config: Arc<Config>,
    scheduler: Arc<Scheduler>,
}

impl ServiceManager {
    pub fn new(config: Arc<Config>, scheduler: Arc<Scheduler>) -> Self {
        Self { config, scheduler }
    }

    /// Catalog of drivers available for attachment.
    pub fn catalog(&self) -> Vec<DriverDescriptor> {
        self.scheduler.drivers().descriptors()
    }

    /// Attach a service: validate the driver type, the identity's existence
    /// and compatibility, the uniqueness of the binding, and the
    /// configuration; run the first update; arm the refresh job.
    pub async fn attach(
        &self,
        owner: &str,
        type_tag: &str,
        identity_id: &str,
        configuration: Value,
    ) -> Result<ServiceRecord> {
        let driver = self.scheduler.drivers().get(type_tag)?;

        let identity = identities::find_identity(&self.config, identity_id)?
            .filter(|record| record.owner == owner)
            .ok_or_else(|| anyhow::anyhow!("Identity '{identity_id}' not found"))?;

        if !driver
            .identity_types()
            .contains(&identity.type_tag.as_str())
        {
            anyhow::bail!(
                "Identity type '{}' cannot back a '{type_tag}' service",
                identity.type_tag
            );
        }

        if services::find_duplicate(&self.config, owner, type_tag, identity_id)?.is_some() {
            anyhow::bail!("Service already exists");
        }

        let probe_ctx = self
            .scheduler
            .driver_context(identity_id, "", configuration.clone());
        if !driver.init(&probe_ctx) {
            anyhow::bail!("Invalid service configuration");
        }

        let record = services::insert_service(
            &self.config,
            NewService {
                owner: owner.to_string(),
                type_tag: type_tag.to_string(),
                identity_id: identity_id.to_string(),
                configuration: configuration.clone(),
                interval_ms: driver.interval_ms(),
            },
        )?;
        tracing::info!(service_id = %record.id, type_tag, "service attached");

        // First sync runs inline so the caller sees immediate data (or its
        // error); the service row persists either way and reconciliation
        // will arm it later if this fails.
        let ctx = self
            .scheduler
            .driver_context(identity_id, &record.id, configuration);
        driver.update(&ctx).await?;
        services::touch_last_updated(&self.config, &record.id)?;

        if record.interval_ms > 0 {
            self.scheduler
                .schedule_service(&record.id, record.interval_ms)?;
        }

        Ok(record)
    }

    /// Remove a service and cancel its pending job.
    pub fn remove(&self, owner: &str, service_id: &str) -> Result<()> {
        let service = self.owned(owner, service_id)?;

        services::delete_service(&self.config, &service.id)?;
        self.scheduler.cancel_service(&service.id)?;
        tracing::info!(service_id, "service removed");
        Ok(())
    }

    /// Disable cancels the pending job; enable re-arms immediately rather
    /// than waiting for the next reconciliation sweep. Enabling also clears
    /// a FAILED state.
    pub fn set_enabled(&self, owner: &str, service_id: &str, enabled: bool) -> Result<()> {
        let service = self.owned(owner, service_id)?;

        if enabled {
            services::set_status(&self.config, &service.id, ServiceStatus::Up)?;
            if service.interval_ms > 0 {
                self.scheduler
                    .schedule_service(&service.id, service.interval_ms)?;
            }
            tracing::info!(service_id, "service enabled");
        } else {
            services::set_status(&self.config, &service.id, ServiceStatus::Disabled)?;
            self.scheduler.cancel_service(&service.id)?;
            tracing::info!(service_id, "service disabled");
        }
        Ok(())
    }

    /// Manual refresh, run synchronously in the caller.
    pub async fn refresh(&self, owner: &str, service_id: &str) -> Result<()> {
        self.owned(owner, service_id)?;
        self.scheduler.run_once(service_id).await
    }

    pub fn list(&self, owner: &str) -> Result<Vec<ServiceRecord>> {
        services::list_services(&self.config, owner)
    }

    fn owned(&self, owner: &str, service_id: &str) -> Result<ServiceRecord> {
        services::find_service(&self.config, service_id)?
            .filter(|record| record.owner == owner)
            .ok_or_else(|| anyhow::anyhow!("Service '{service_id}' not found"))
    }
}
