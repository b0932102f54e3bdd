use super::{DriverDescriptor, ServiceDriver};
use crate::error::RegistryError;
use std::collections::HashMap;

type DriverFactory = Box<dyn Fn() -> Box<dyn ServiceDriver> + Send + Sync>;

/// Central registry mapping service type tags to driver factories.
///
/// Populated once at process start; lookups after that treat it as
/// read-only. A fresh driver value is created per dispatch.
#[derive(Default)]
pub struct ServiceRegistry {
    factories: HashMap<String, DriverFactory>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registry pre-populated with the built-in drivers.
    pub fn with_builtin_drivers() -> Self {
        let mut registry = Self::new();
        registry.register(|| Box::new(super::library::LibraryDriver::new()));
        registry.register(|| Box::new(super::timetable::TimetableDriver::new()));
        registry
    }

    /// Register a driver factory. Replaces any existing factory with the
    /// same type tag.
    pub fn register<F>(&mut self, factory: F)
    where
        F: Fn() -> Box<dyn ServiceDriver> + Send + Sync + 'static,
    {
        let type_tag = factory().type_tag().to_string();
        self.factories.insert(type_tag, Box::new(factory));
    }

    pub fn get(&self, type_tag: &str) -> Result<Box<dyn ServiceDriver>, RegistryError> {
        self.factories
            .get(type_tag)
            .map(|factory| factory())
            .ok_or_else(|| RegistryError::UnknownServiceType {
                type_tag: type_tag.to_string(),
            })
    }

    /// Catalog of all registered drivers, sorted by type tag.
    pub fn descriptors(&self) -> Vec<DriverDescriptor> {
        let mut descriptors: Vec<DriverDescriptor> = self
            .factories
            .values()
            .map(|factory| factory().descriptor())
            .collect();
        descriptors.sort_by(|a, b| a.type_tag.cmp(&b.type_tag));
        descriptors
    }

    /// Sorted list of registered type tags.
    pub fn type_tags(&self) -> Vec<&str> {
        let mut tags: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        tags.sort_unstable();
        tags
    }
}
