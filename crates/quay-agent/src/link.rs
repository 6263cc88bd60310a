//! Agent side of the scheduler control stream
//!
//! The agent opens `POST /v1/agents/subscribe` with its
//! [`AgentSubscribeRequest`] and reads load/unload commands from the
//! newline-delimited JSON response body. Each command is applied to the
//! local registry and cache, and the outcome is reported back on
//! `POST /v1/agents/events`. A dropped stream is re-established with
//! capped exponential backoff; the handshake then carries every model the
//! agent still holds so the scheduler can restore its view.

use crate::cache::CacheManager;
use crate::config::AgentConfig;
use crate::error::{AgentError, AgentResult};
use futures_util::StreamExt;
use quay_types::{
    AgentSubscribeRequest, ModelEventMessage, ModelEventType, ModelOperation,
    ModelOperationMessage, ModelScalingTriggerMessage, ReplicaConfig, ScalingTrigger, ServerKey,
};
use reqwest::{Client, Response};
use serde::Serialize;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

/// Split complete lines off the front of `buf`, leaving any partial line
pub(crate) fn drain_lines(buf: &mut Vec<u8>) -> Vec<Vec<u8>> {
    let mut lines = Vec::new();
    while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
        let mut line: Vec<u8> = buf.drain(..=pos).collect();
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        // Blank lines are keepalives
        if !line.iter().all(u8::is_ascii_whitespace) {
            lines.push(line);
        }
    }
    lines
}

/// Connection from one agent to the scheduler
pub struct AgentLink {
    config: AgentConfig,
    client: Client,
    cache: CacheManager,
}

impl AgentLink {
    pub fn new(config: AgentConfig, cache: CacheManager) -> AgentResult<Self> {
        // No overall timeout: the subscribe response is a long-lived stream
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .no_proxy()
            .build()?;
        Ok(Self {
            config,
            client,
            cache,
        })
    }

    pub fn server_key(&self) -> ServerKey {
        ServerKey::new(&self.config.server_name, self.config.replica_idx)
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.scheduler_url.trim_end_matches('/'), path)
    }

    /// Memory left once every resident registered model is accounted for
    pub async fn available_memory(&self) -> u64 {
        let mut used = 0u64;
        for model in self.cache.registry().list() {
            if self.cache.contains(&model.backend_name).await {
                used = used.saturating_add(model.details.memory_bytes());
            }
        }
        self.config.memory_bytes.saturating_sub(used)
    }

    pub async fn subscribe_request(&self) -> AgentSubscribeRequest {
        let mut loaded_models = Vec::new();
        for model in self.cache.registry().list() {
            if self.cache.contains(&model.backend_name).await {
                loaded_models.push(model.details);
            }
        }
        AgentSubscribeRequest {
            server_name: self.config.server_name.clone(),
            replica_idx: self.config.replica_idx,
            shared: self.config.shared,
            replica_config: ReplicaConfig {
                inference_svc: self.config.inference_svc.clone(),
                inference_http_port: self.config.proxy.listen_addr.port(),
                capabilities: self.config.capabilities.clone(),
                memory_bytes: self.config.memory_bytes,
                available_memory_bytes: Some(self.available_memory().await),
            },
            loaded_models,
        }
    }

    /// Apply one scheduler command and describe the outcome
    #[instrument(skip(self, op), fields(model = %op.model_version.id(), operation = ?op.operation))]
    pub async fn handle_operation(&self, op: ModelOperationMessage) -> ModelEventMessage {
        let id = op.model_version.id();
        let registry = self.cache.registry();

        let (event, message) = match op.operation {
            // Registered only once resident: a version that fails to load
            // must not shadow the one still serving
            ModelOperation::LoadModel => match self.cache.load(&id.backend_name()).await {
                Ok(()) => {
                    registry.register(op.model_version);
                    info!("Model loaded");
                    (ModelEventType::Loaded, String::new())
                }
                Err(e) => {
                    warn!(error = %e, "Model load failed");
                    (ModelEventType::LoadFailed, e.to_string())
                }
            },
            ModelOperation::UnloadModel => match self.cache.unload(&id.backend_name()).await {
                Ok(was_resident) => {
                    info!(was_resident, "Model unloaded");
                    registry.deregister(&id);
                    (ModelEventType::Unloaded, String::new())
                }
                Err(e) => {
                    warn!(error = %e, "Model unload failed");
                    (ModelEventType::UnloadFailed, e.to_string())
                }
            },
        };

        ModelEventMessage {
            server_name: self.config.server_name.clone(),
            replica_idx: self.config.replica_idx,
            model_name: id.name,
            model_version: id.version,
            event,
            message,
            available_memory_bytes: Some(self.available_memory().await),
        }
    }

    async fn post<T: Serialize>(&self, path: &str, body: &T) -> AgentResult<Response> {
        let response = self.client.post(self.url(path)).json(body).send().await?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(AgentError::Scheduler {
                status: status.as_u16(),
                message,
            });
        }
        Ok(response)
    }

    pub async fn report_event(&self, event: &ModelEventMessage) -> AgentResult<()> {
        self.post("/v1/agents/events", event).await.map(|_| ())
    }

    /// Ask the scheduler to add or remove a replica of a model
    pub async fn send_scaling_trigger(
        &self,
        model_name: &str,
        model_version: u32,
        trigger: ScalingTrigger,
    ) -> AgentResult<()> {
        let message = ModelScalingTriggerMessage {
            server_name: self.config.server_name.clone(),
            replica_idx: self.config.replica_idx,
            model_name: model_name.to_string(),
            model_version,
            trigger,
        };
        debug!(model = model_name, version = model_version, ?trigger, "Sending scaling trigger");
        self.post("/v1/agents/scale", &message).await.map(|_| ())
    }

    /// One subscription, until the scheduler closes it or it fails
    async fn run_stream(&self, connected: &mut bool) -> AgentResult<()> {
        let request = self.subscribe_request().await;
        let response = self.post("/v1/agents/subscribe", &request).await?;
        *connected = true;
        info!(
            server = %self.server_key(),
            loaded = request.loaded_models.len(),
            "Subscribed to scheduler"
        );

        let mut body = response.bytes_stream();
        let mut buf = Vec::new();
        while let Some(chunk) = body.next().await {
            buf.extend_from_slice(&chunk?);
            for line in drain_lines(&mut buf) {
                let op: ModelOperationMessage = match serde_json::from_slice(&line) {
                    Ok(op) => op,
                    Err(e) => {
                        warn!(error = %e, "Skipping malformed command");
                        continue;
                    }
                };
                let event = self.handle_operation(op).await;
                if let Err(e) = self.report_event(&event).await {
                    warn!(
                        model = %event.model_name,
                        version = event.model_version,
                        error = %e,
                        "Failed to report model event"
                    );
                }
            }
        }
        Ok(())
    }

    /// Keep a subscription open until `shutdown` flips to true
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let initial = self.config.initial_backoff();
        let max = self.config.max_backoff();
        let mut backoff = initial;

        loop {
            if *shutdown.borrow() {
                break;
            }

            let started = Instant::now();
            let mut connected = false;
            tokio::select! {
                result = self.run_stream(&mut connected) => match result {
                    Ok(()) => info!("Scheduler closed control stream"),
                    Err(e) => warn!(error = %e, "Control stream failed"),
                },
                _ = shutdown.changed() => break,
            }

            // A connection that stayed up for a while starts the backoff over
            if connected && started.elapsed() >= max {
                backoff = initial;
            }
            debug!(?backoff, "Reconnecting to scheduler");
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = shutdown.changed() => break,
            }
            backoff = (backoff * 2).min(max);
        }
        info!("Agent link stopped");
    }
}
