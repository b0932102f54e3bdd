use super::IdentityProvider;
use crate::config::Config;
use crate::error::RegistryError;
use std::collections::HashMap;
use std::sync::Arc;

/// Central registry mapping identity type tags to provider singletons.
///
/// Populated once at process start; lookups after that treat it as
/// read-only.
#[derive(Default)]
pub struct IdentityRegistry {
    providers: HashMap<String, Arc<dyn IdentityProvider>>,
}

impl IdentityRegistry {
    pub fn new() -> Self {
        Self {
            providers: HashMap::new(),
        }
    }

    /// Registry pre-populated with the built-in providers.
    pub fn with_builtin_providers(config: &Config) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(super::cas::CasProvider::from_config(
            &config.providers.cas,
        )));
        registry
    }

    /// Register a provider. Replaces any existing provider with the same tag.
    pub fn register(&mut self, provider: Arc<dyn IdentityProvider>) {
        self.providers
            .insert(provider.type_tag().to_string(), provider);
    }

    pub fn get(&self, type_tag: &str) -> Result<Arc<dyn IdentityProvider>, RegistryError> {
        self.providers
            .get(type_tag)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownIdentityType {
                type_tag: type_tag.to_string(),
            })
    }

    /// Sorted list of registered type tags.
    pub fn type_tags(&self) -> Vec<&str> {
        let mut tags: Vec<&str> = self.providers.keys().map(String::as_str).collect();
        tags.sort_unstable();
        tags
    }
}
