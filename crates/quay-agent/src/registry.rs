//! Model versions assigned to this agent by the scheduler

use dashmap::DashMap;
use quay_types::{ModelVersionDetails, ModelVersionId};
use std::collections::BTreeMap;

/// A registered model version and the name the backend knows it by
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredModel {
    pub details: ModelVersionDetails,
    pub backend_name: String,
}

/// Logical model name to the versions currently assigned here.
///
/// Only registered models can be served through the proxy. A name may carry
/// several versions while a rollout drains the older one; requests resolve
/// to the newest. Deregistering removes a single version, so a late unload
/// of a drained version cannot remove its replacement and a failed upgrade
/// leaves the previous version serving.
#[derive(Debug, Default)]
pub struct ModelRegistry {
    models: DashMap<String, BTreeMap<u32, RegisteredModel>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `details`, returning its backend name
    pub fn register(&self, details: ModelVersionDetails) -> String {
        let id = details.id();
        let backend_name = id.backend_name();
        self.models.entry(id.name).or_default().insert(
            id.version,
            RegisteredModel {
                details,
                backend_name: backend_name.clone(),
            },
        );
        backend_name
    }

    pub fn deregister(&self, id: &ModelVersionId) -> Option<RegisteredModel> {
        let removed = {
            let mut versions = self.models.get_mut(&id.name)?;
            versions.remove(&id.version)
        };
        self.models.remove_if(&id.name, |_, versions| versions.is_empty());
        removed
    }

    /// Newest registered version of `name`
    pub fn resolve(&self, name: &str) -> Option<RegisteredModel> {
        self.models
            .get(name)
            .and_then(|versions| versions.values().next_back().cloned())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.models.contains_key(name)
    }

    /// Every registered version, sorted by name then version
    pub fn list(&self) -> Vec<RegisteredModel> {
        let mut models: Vec<_> = self
            .models
            .iter()
            .flat_map(|versions| versions.values().cloned().collect::<Vec<_>>())
            .collect();
        models.sort_by(|a, b| {
            a.details
                .model
                .name()
                .cmp(b.details.model.name())
                .then_with(|| a.details.version.cmp(&b.details.version))
        });
        models
    }

    /// Number of registered versions across all names
    pub fn len(&self) -> usize {
        self.models.iter().map(|versions| versions.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quay_types::Model;

    fn details(name: &str, version: u32) -> ModelVersionDetails {
        ModelVersionDetails {
            model: Model::new(name),
            version,
        }
    }

    #[test]
    fn test_register_and_resolve() {
        let registry = ModelRegistry::new();
        assert_eq!(registry.register(details("iris", 1)), "iris_1");

        let resolved = registry.resolve("iris").unwrap();
        assert_eq!(resolved.backend_name, "iris_1");
        assert!(registry.resolve("mnist").is_none());
    }

    #[test]
    fn test_versions_tracked_independently() {
        let registry = ModelRegistry::new();
        registry.register(details("iris", 1));
        registry.register(details("iris", 2));
        assert_eq!(registry.resolve("iris").unwrap().backend_name, "iris_2");
        assert_eq!(registry.len(), 2);

        // Draining the old version leaves the new one in place
        assert!(registry.deregister(&ModelVersionId::new("iris", 1)).is_some());
        assert_eq!(registry.resolve("iris").unwrap().backend_name, "iris_2");
        assert!(registry.deregister(&ModelVersionId::new("iris", 1)).is_none());

        assert!(registry.deregister(&ModelVersionId::new("iris", 2)).is_some());
        assert!(registry.is_empty());
        assert!(!registry.contains("iris"));
    }

    #[test]
    fn test_list_orders_by_name_then_version() {
        let registry = ModelRegistry::new();
        registry.register(details("mnist", 1));
        registry.register(details("iris", 2));
        registry.register(details("iris", 1));

        let names: Vec<_> = registry.list().into_iter().map(|m| m.backend_name).collect();
        assert_eq!(names, vec!["iris_1", "iris_2", "mnist_1"]);
    }
}
