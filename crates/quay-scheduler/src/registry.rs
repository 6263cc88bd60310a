//! Live agent links, keyed by server replica

use crate::error::{SchedulerError, SchedulerResult};
use quay_types::{ModelOperationMessage, ServerKey};
use std::collections::HashMap;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

/// One connected server replica and the sending half of its command stream
#[derive(Debug, Clone)]
pub struct AgentSubscriber {
    /// Distinguishes successive connections from the same replica
    pub connection_id: Uuid,
    pub server_key: ServerKey,
    tx: mpsc::UnboundedSender<ModelOperationMessage>,
}

impl AgentSubscriber {
    /// Queue a command on this link. Fails once the stream has gone away.
    pub fn send(&self, op: ModelOperationMessage) -> SchedulerResult<()> {
        self.tx
            .send(op)
            .map_err(|_| SchedulerError::UnreachableAgent(self.server_key.clone()))
    }
}

/// ServerKey to live link. Populated on subscribe, depopulated on stream
/// failure; read by every `Sync`.
#[derive(Debug, Default)]
pub struct AgentRegistry {
    subscribers: RwLock<HashMap<ServerKey, AgentSubscriber>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new link, replacing any previous one for the same key.
    ///
    /// Returns the connection id and the receiving half of the command
    /// stream.
    pub async fn register(
        &self,
        server_key: ServerKey,
    ) -> (Uuid, mpsc::UnboundedReceiver<ModelOperationMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscriber = AgentSubscriber {
            connection_id: Uuid::new_v4(),
            server_key: server_key.clone(),
            tx,
        };
        let connection_id = subscriber.connection_id;

        let previous = self
            .subscribers
            .write()
            .await
            .insert(server_key.clone(), subscriber);
        if let Some(previous) = previous {
            info!(
                server = %server_key,
                previous = %previous.connection_id,
                "Replacing existing agent link"
            );
        }
        (connection_id, rx)
    }

    /// Remove the link for `key` if it is still the connection `connection_id`
    pub async fn remove(&self, key: &ServerKey, connection_id: Uuid) -> bool {
        let mut subscribers = self.subscribers.write().await;
        match subscribers.get(key) {
            Some(s) if s.connection_id == connection_id => {
                subscribers.remove(key);
                true
            }
            _ => {
                debug!(server = %key, connection = %connection_id, "Ignoring removal of superseded link");
                false
            }
        }
    }

    pub async fn send(&self, key: &ServerKey, op: ModelOperationMessage) -> SchedulerResult<()> {
        let subscribers = self.subscribers.read().await;
        subscribers
            .get(key)
            .ok_or_else(|| SchedulerError::UnreachableAgent(key.clone()))?
            .send(op)
    }

    pub async fn contains(&self, key: &ServerKey) -> bool {
        self.subscribers.read().await.contains_key(key)
    }

    pub async fn len(&self) -> usize {
        self.subscribers.read().await.len()
    }
}
