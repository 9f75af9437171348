//! Request/response channels.
//!
//! A channel binds a request [`Queue`] and a pub/sub topic to one name.
//! Requests travel as ids; each payload sits under its own key and each
//! response goes to a queue scoped to one request id, so concurrent
//! requests never see each other's data. The topic only carries wake-up
//! hints. Responses are always read from the response queue.

pub mod client;
pub mod server;

pub use client::Client;
pub use server::Server;

use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::Result;
use crate::model::RequestId;
use crate::queue::Queue;
use crate::store::Store;

/// Tunables shared by both ends of a channel.
#[derive(Debug, Clone, Default)]
pub struct ChannelConfig {
    /// Expiry for stored request payloads. `None` keeps them until the
    /// server acks, so a payload orphaned by a failed enqueue stays behind.
    pub request_ttl: Option<Duration>,
}

/// Background task feeding response notifications to a handler.
struct HandlerTask {
    stop: Arc<Notify>,
    join: JoinHandle<()>,
}

pub struct Channel {
    store: Arc<dyn Store>,
    name: String,
    request_queue: Queue,
    topic: String,
    config: ChannelConfig,
    handler: Option<HandlerTask>,
}

impl Channel {
    pub fn new(store: Arc<dyn Store>, name: impl Into<String>) -> Self {
        Self::with_config(store, name, ChannelConfig::default())
    }

    pub fn with_config(store: Arc<dyn Store>, name: impl Into<String>, config: ChannelConfig) -> Self {
        let name = name.into();
        Self {
            request_queue: Queue::new(Arc::clone(&store), format!("channel_request_queue_{name}")),
            topic: format!("channel_response_{name}"),
            store,
            name,
            config,
            handler: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    pub fn request_queue(&self) -> &Queue {
        &self.request_queue
    }

    pub(crate) fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Deterministic id for a payload. `ordinal` tells identical payloads
    /// apart.
    pub fn request_id(&self, payload: &[u8], ordinal: u64) -> RequestId {
        let mut hasher = Sha256::new();
        hasher.update(b"request_");
        hasher.update(self.name.as_bytes());
        hasher.update(b":");
        hasher.update(ordinal.to_string().as_bytes());
        hasher.update(b":");
        hasher.update(payload);
        RequestId(hex::encode(hasher.finalize()))
    }

    /// Per-channel arrival counter, shared by every client process.
    pub(crate) async fn next_ordinal(&self) -> Result<u64> {
        let n = self
            .store
            .incr(&format!("channel_sequence_{}", self.name))
            .await?;
        Ok(n.max(0) as u64)
    }

    /// Key holding a request's payload.
    pub fn request_key(&self, id: &RequestId) -> String {
        format!("channel_request_{}:{id}", self.name)
    }

    pub fn response_queue_name(&self, id: &RequestId) -> String {
        format!("channel_response_queue_{}:{id}", self.name)
    }

    pub fn response_queue(&self, id: &RequestId) -> Queue {
        Queue::new(Arc::clone(&self.store), self.response_queue_name(id))
    }

    pub fn is_subscribed(&self) -> bool {
        self.handler.is_some()
    }

    /// Subscribe to the topic and call `handler` with each notified id on a
    /// background task. Replaces any running handler.
    pub(crate) async fn subscribe<F>(&mut self, handler: F) -> Result<()>
    where
        F: Fn(RequestId) + Send + Sync + 'static,
    {
        self.unsubscribe().await;

        let mut subscription = self.store.subscribe(&self.topic).await?;
        let stop = Arc::new(Notify::new());
        let join = tokio::spawn({
            let stop = Arc::clone(&stop);
            let topic = self.topic.clone();
            async move {
                loop {
                    tokio::select! {
                        _ = stop.notified() => break,
                        msg = subscription.recv() => match msg {
                            Some(raw) => handler(RequestId::from_bytes(&raw)),
                            None => break,
                        },
                    }
                }
                debug!(topic = %topic, "response handler stopped");
            }
        });

        self.handler = Some(HandlerTask { stop, join });
        Ok(())
    }

    /// Stop the handler task and wait for it to finish.
    pub(crate) async fn unsubscribe(&mut self) {
        let Some(task) = self.handler.take() else {
            return;
        };
        task.stop.notify_one();
        if let Err(e) = task.join.await {
            warn!(channel = %self.name, "response handler task failed: {e}");
        }
    }

    /// Tear down background subscriptions.
    pub async fn close(&mut self) {
        self.unsubscribe().await;
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        if let Some(task) = self.handler.take() {
            task.join.abort();
        }
    }
}
