pub mod schema;

pub use schema::{
    CasProviderConfig, Config, ProvidersConfig, SchedulerConfig, SecretsConfig,
};
