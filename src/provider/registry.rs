//! Mapping from resource types to adapters.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::error::ProviderError;
use crate::resource::ResourceType;

use super::adapter::ProviderAdapter;

/// Adapters per resource type, with an optional fallback.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    adapters: BTreeMap<ResourceType, Arc<dyn ProviderAdapter>>,
    fallback: Option<Arc<dyn ProviderAdapter>>,
}

impl ProviderRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry serving every type with one adapter.
    #[must_use]
    pub fn single(adapter: Arc<dyn ProviderAdapter>) -> Self {
        Self::new().with_fallback(adapter)
    }

    /// Registers an adapter for some resource types.
    #[must_use]
    pub fn register(
        mut self,
        types: impl IntoIterator<Item = ResourceType>,
        adapter: Arc<dyn ProviderAdapter>,
    ) -> Self {
        for resource_type in types {
            self.adapters.insert(resource_type, Arc::clone(&adapter));
        }
        self
    }

    /// Sets the adapter used for types without a specific registration.
    #[must_use]
    pub fn with_fallback(mut self, adapter: Arc<dyn ProviderAdapter>) -> Self {
        self.fallback = Some(adapter);
        self
    }

    /// Gets the adapter for a resource type.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::NoAdapter`] if no adapter serves the type.
    pub fn adapter_for(
        &self,
        resource_type: ResourceType,
    ) -> Result<Arc<dyn ProviderAdapter>, ProviderError> {
        self.adapters
            .get(&resource_type)
            .or(self.fallback.as_ref())
            .cloned()
            .ok_or_else(|| ProviderError::NoAdapter {
                resource_type: resource_type.to_string(),
            })
    }

    /// Returns the types without an adapter.
    #[must_use]
    pub fn unserved(&self) -> Vec<ResourceType> {
        if self.fallback.is_some() {
            return Vec::new();
        }
        ResourceType::ALL
            .iter()
            .copied()
            .filter(|t| !self.adapters.contains_key(t))
            .collect()
    }
}

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let adapters: BTreeMap<&str, &str> = self
            .adapters
            .iter()
            .map(|(t, a)| (t.as_str(), a.name()))
            .collect();
        f.debug_struct("ProviderRegistry")
            .field("adapters", &adapters)
            .field("fallback", &self.fallback.as_ref().map(|a| a.name()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::SimulatedProvider;

    #[test]
    fn test_specific_adapter_wins_over_fallback() {
        let databases = Arc::new(SimulatedProvider::new("us-east-1", "123456789012").named("databases"));
        let everything = Arc::new(SimulatedProvider::new("us-east-1", "123456789012"));

        let registry = ProviderRegistry::new()
            .register([ResourceType::Database], databases)
            .with_fallback(everything);

        assert_eq!(
            registry.adapter_for(ResourceType::Database).unwrap().name(),
            "databases"
        );
        assert_eq!(
            registry.adapter_for(ResourceType::Bucket).unwrap().name(),
            "simulated"
        );
        assert!(registry.unserved().is_empty());
    }

    #[test]
    fn test_missing_adapter() {
        let registry = ProviderRegistry::new().register(
            [ResourceType::Bucket],
            Arc::new(SimulatedProvider::new("us-east-1", "123456789012")),
        );
        assert!(matches!(
            registry.adapter_for(ResourceType::Cdn),
            Err(ProviderError::NoAdapter { .. })
        ));
        assert_eq!(registry.unserved().len(), ResourceType::ALL.len() - 1);
    }
}
