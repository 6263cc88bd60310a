//! Model specification types
//!
//! A [`Model`] is the desired-state record a user submits. The scheduler
//! turns it into [`ModelVersion`](crate::ModelVersion)s placed on servers.

use serde::{Deserialize, Serialize};

/// A model as submitted to the scheduler
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Model {
    pub meta: ModelMeta,

    #[serde(default)]
    pub model_spec: ModelSpec,

    #[serde(default)]
    pub deployment_spec: DeploymentSpec,
}

impl Model {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            meta: ModelMeta { name: name.into() },
            model_spec: ModelSpec::default(),
            deployment_spec: DeploymentSpec::default(),
        }
    }

    pub fn with_model_spec(mut self, model_spec: ModelSpec) -> Self {
        self.model_spec = model_spec;
        self
    }

    pub fn with_deployment_spec(mut self, deployment_spec: DeploymentSpec) -> Self {
        self.deployment_spec = deployment_spec;
        self
    }

    pub fn name(&self) -> &str {
        &self.meta.name
    }
}

/// Model metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelMeta {
    pub name: String,
}

/// What to load and where it may run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSpec {
    /// Artifact location handed to the backend
    #[serde(default)]
    pub uri: String,

    /// Memory the model needs once loaded
    #[serde(default)]
    pub memory_bytes: Option<u64>,

    /// Capabilities a server must advertise to host the model
    #[serde(default)]
    pub requirements: Vec<String>,

    /// Pin the model to a named server
    #[serde(default)]
    pub server: Option<String>,
}

/// Replica configuration of a model.
///
/// `min_replicas == 0 && max_replicas == 0` disables autoscaling.
/// `max_replicas == 0` alone means unbounded scale-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentSpec {
    pub replicas: u32,

    #[serde(default)]
    pub min_replicas: u32,

    #[serde(default)]
    pub max_replicas: u32,
}

impl Default for DeploymentSpec {
    fn default() -> Self {
        Self {
            replicas: 1,
            min_replicas: 0,
            max_replicas: 0,
        }
    }
}

impl DeploymentSpec {
    pub fn new(replicas: u32) -> Self {
        Self {
            replicas,
            ..Default::default()
        }
    }

    pub fn with_bounds(mut self, min_replicas: u32, max_replicas: u32) -> Self {
        self.min_replicas = min_replicas;
        self.max_replicas = max_replicas;
        self
    }

    pub fn autoscaling_enabled(&self) -> bool {
        !(self.min_replicas == 0 && self.max_replicas == 0)
    }
}

/// Request to create or update a model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadModelRequest {
    pub model: Model,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_autoscaling_disabled_without_bounds() {
        assert!(!DeploymentSpec::new(3).autoscaling_enabled());
        assert!(DeploymentSpec::new(1).with_bounds(1, 0).autoscaling_enabled());
        assert!(DeploymentSpec::new(1).with_bounds(0, 2).autoscaling_enabled());
    }

    #[test]
    fn test_model_deserialize_defaults() {
        let model: Model = serde_json::from_str(r#"{"meta":{"name":"iris"}}"#).unwrap();
        assert_eq!(model.name(), "iris");
        assert_eq!(model.deployment_spec.replicas, 1);
        assert!(model.model_spec.requirements.is_empty());
    }
}
