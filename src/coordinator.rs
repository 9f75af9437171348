//! Factory for the coordination primitives over one shared store handle.

use std::sync::Arc;

use crate::channel::{ChannelConfig, Client, Server};
use crate::error::Result;
use crate::lock::Lock;
use crate::queue::Queue;
use crate::store::{MemoryStore, RedisStore, Store};

/// Owns the store handle shared by every lock, queue and channel end it
/// creates.
#[derive(Clone)]
pub struct Coordinator {
    store: Arc<dyn Store>,
    channel_config: ChannelConfig,
}

impl Coordinator {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            channel_config: ChannelConfig::default(),
        }
    }

    /// Connect to Redis.
    pub async fn connect(url: &str) -> Result<Self> {
        let store = RedisStore::connect(url).await?;
        Ok(Self::new(Arc::new(store)))
    }

    /// A coordinator over a fresh in-process store.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    pub fn with_channel_config(mut self, config: ChannelConfig) -> Self {
        self.channel_config = config;
        self
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn lock(&self, name: impl Into<String>) -> Lock {
        Lock::new(Arc::clone(&self.store), name)
    }

    pub fn queue(&self, name: impl Into<String>) -> Queue {
        Queue::new(Arc::clone(&self.store), name)
    }

    pub fn client(&self, channel: impl Into<String>) -> Client {
        Client::with_config(Arc::clone(&self.store), channel, self.channel_config.clone())
    }

    pub fn server(&self, channel: impl Into<String>) -> Server {
        Server::with_config(Arc::clone(&self.store), channel, self.channel_config.clone())
    }
}
