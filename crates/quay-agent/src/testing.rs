//! Test doubles shared by the unit tests

use crate::backend::BackendClient;
use crate::error::{BackendError, BackendResult};
use crate::registry::ModelRegistry;
use async_trait::async_trait;
use bytes::Bytes;
use quay_types::{Model, ModelSpec, ModelVersionDetails};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Records every call; loads of names in `reject` fail with a 400
#[derive(Default)]
pub(crate) struct MockBackend {
    pub calls: Mutex<Vec<String>>,
    pub loaded: Mutex<HashSet<String>>,
    pub max_loaded: AtomicUsize,
    pub reject: HashSet<String>,
    pub delay: Duration,
}

impl MockBackend {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl BackendClient for MockBackend {
    async fn load(&self, model: &str) -> BackendResult<()> {
        tokio::time::sleep(self.delay).await;
        self.calls.lock().unwrap().push(format!("load:{model}"));
        if self.reject.contains(model) {
            return Err(BackendError::Rejected {
                operation: "load",
                model: model.to_string(),
                status: 400,
                message: "unknown model".into(),
            });
        }
        let mut loaded = self.loaded.lock().unwrap();
        loaded.insert(model.to_string());
        self.max_loaded.fetch_max(loaded.len(), Ordering::SeqCst);
        Ok(())
    }

    async fn unload(&self, model: &str) -> BackendResult<()> {
        self.calls.lock().unwrap().push(format!("unload:{model}"));
        self.loaded.lock().unwrap().remove(model);
        Ok(())
    }

    async fn infer(&self, model: &str, _payload: Bytes) -> BackendResult<Bytes> {
        Ok(Bytes::from(format!("Model inference: {model}")))
    }

    async fn ready(&self) -> BackendResult<bool> {
        Ok(true)
    }
}

pub(crate) fn details(name: &str, version: u32, memory_bytes: u64) -> ModelVersionDetails {
    ModelVersionDetails {
        model: Model::new(name).with_model_spec(ModelSpec {
            memory_bytes: Some(memory_bytes),
            ..Default::default()
        }),
        version,
    }
}

pub(crate) fn registry_with(models: &[&str]) -> ModelRegistry {
    let registry = ModelRegistry::new();
    for name in models {
        registry.register(details(name, 1, 0));
    }
    registry
}
