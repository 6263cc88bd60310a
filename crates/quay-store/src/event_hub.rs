//! Broadcast of store changes to interested control loops

use quay_types::{ModelEventMsg, ServerEventMsg};
use tokio::sync::broadcast;
use tracing::trace;

const DEFAULT_CAPACITY: usize = 1024;

/// Fan-out of model and server change notifications
#[derive(Debug, Clone)]
pub struct EventHub {
    model_tx: broadcast::Sender<ModelEventMsg>,
    server_tx: broadcast::Sender<ServerEventMsg>,
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventHub {
    pub fn new(capacity: usize) -> Self {
        let (model_tx, _) = broadcast::channel(capacity);
        let (server_tx, _) = broadcast::channel(capacity);
        Self { model_tx, server_tx }
    }

    pub fn publish_model(&self, event: ModelEventMsg) {
        trace!(model = %event.model_name, version = event.model_version, source = %event.source, "model event");
        // No subscribers is not an error
        let _ = self.model_tx.send(event);
    }

    pub fn publish_server(&self, event: ServerEventMsg) {
        trace!(server = %event.server_name, replica = event.replica_idx, source = %event.source, "server event");
        let _ = self.server_tx.send(event);
    }

    pub fn subscribe_models(&self) -> broadcast::Receiver<ModelEventMsg> {
        self.model_tx.subscribe()
    }

    pub fn subscribe_servers(&self) -> broadcast::Receiver<ServerEventMsg> {
        self.server_tx.subscribe()
    }
}
