//! Polymorphic service drivers and their registry.

pub mod library;
pub mod manager;
pub mod registry;
pub mod timetable;

pub use manager::ServiceManager;
pub use registry::ServiceRegistry;

use crate::config::Config;
use crate::identity::{Parameter, TokenAuthority};
use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

/// Catalog entry describing one driver to the rest of the application.
#[derive(Debug, Clone, Serialize)]
pub struct DriverDescriptor {
    pub type_tag: String,
    pub name: String,
    pub description: String,
    pub category: String,
    /// Identity type tags this driver can operate with.
    pub identity_types: Vec<String>,
    pub params: Vec<Parameter>,
    /// Default refresh period in milliseconds; 0 means "never scheduled".
    pub interval_ms: i64,
    pub rag: bool,
}

/// Everything one driver invocation needs: the owning service's identity,
/// configuration, and handles for authorized fetches and runtime-blob
/// persistence.
pub struct DriverContext {
    pub identity_id: String,
    pub service_id: String,
    pub configuration: Value,
    pub authority: Arc<TokenAuthority>,
    pub http: reqwest::Client,
    config: Arc<Config>,
}

impl DriverContext {
    pub fn new(
        config: Arc<Config>,
        authority: Arc<TokenAuthority>,
        http: reqwest::Client,
        identity_id: String,
        service_id: String,
        configuration: Value,
    ) -> Self {
        Self {
            identity_id,
            service_id,
            configuration,
            authority,
            http,
            config,
        }
    }

    /// Persist the driver-private cache on the owning service.
    pub fn save_runtime(&self, runtime: &Value) -> Result<()> {
        crate::store::services::set_runtime(&self.config, &self.service_id, runtime)
    }

    /// Load the driver-private cache, if any.
    pub fn load_runtime(&self) -> Result<Option<Value>> {
        Ok(crate::store::services::find_service(&self.config, &self.service_id)?
            .and_then(|service| service.runtime))
    }

    pub fn config_str(&self, field: &str) -> Option<&str> {
        self.configuration.get(field).and_then(Value::as_str)
    }
}

/// Capability set of one service driver.
///
/// Drivers are stateless values created per dispatch by the registry; all
/// per-invocation state travels in the [`DriverContext`].
#[async_trait]
pub trait ServiceDriver: Send + Sync {
    /// Type tag keyed in the registry, e.g. "timetable".
    fn type_tag(&self) -> &str;

    fn name(&self) -> &str;

    fn description(&self) -> &str;

    fn category(&self) -> &str;

    /// Identity types this driver accepts.
    fn identity_types(&self) -> Vec<&str>;

    /// Configuration fields the driver expects.
    fn params(&self) -> Vec<Parameter> {
        Vec::new()
    }

    /// Default refresh period; 0 disables periodic refresh.
    fn interval_ms(&self) -> i64;

    fn supports_rag(&self) -> bool {
        false
    }

    /// Validate the context before `update`/`prompt`. The default checks
    /// that every required configuration field is present and non-empty.
    fn init(&self, ctx: &DriverContext) -> bool {
        required_params_present(&self.params(), &ctx.configuration)
    }

    /// Refresh external data. Called by the scheduler on the service's
    /// interval; must be idempotent (at-least-once delivery).
    async fn update(&self, ctx: &DriverContext) -> Result<()>;

    /// Answer a user question from the driver's cached data.
    async fn prompt(&self, ctx: &DriverContext, question: &str) -> Result<String>;

    fn descriptor(&self) -> DriverDescriptor {
        DriverDescriptor {
            type_tag: self.type_tag().to_string(),
            name: self.name().to_string(),
            description: self.description().to_string(),
            category: self.category().to_string(),
            identity_types: self
                .identity_types()
                .into_iter()
                .map(ToOwned::to_owned)
                .collect(),
            params: self.params(),
            interval_ms: self.interval_ms(),
            rag: self.supports_rag(),
        }
    }
}

pub(crate) fn required_params_present(params: &[Parameter], configuration: &Value) -> bool {
    params.iter().filter(|p| p.required).all(|p| {
        configuration
            .get(&p.field_name)
            .is_some_and(|v| !v.is_null() && v.as_str() != Some(""))
    })
}
