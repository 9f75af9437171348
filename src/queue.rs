//! Reliable at-least-once queue over two store lists.
//!
//! Producers push onto `visible`. Consumers move the oldest visible item
//! onto `in_flight` in one store command and remove it from there only when
//! they ack. A consumer that dies between the move and the ack leaves the
//! item in `in_flight`, where [`Queue::in_flight`] and [`Queue::requeue`]
//! can find and recover it. Nothing reclaims it automatically.
//!
//! Ack removes the first matching value, so duplicate values in flight are
//! indistinguishable.

use std::sync::Arc;
use std::time::Duration;

use opentelemetry::KeyValue;
use tokio::time::Instant;
use tracing::debug;

use crate::error::Result;
use crate::store::{Script, Store, wait_limit};
use crate::telemetry::metrics;

pub struct Queue {
    store: Arc<dyn Store>,
    name: String,
    visible_key: String,
    in_flight_key: String,
}

impl Queue {
    pub fn new(store: Arc<dyn Store>, name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            store,
            visible_key: format!("{name}:visible"),
            in_flight_key: format!("{name}:in_flight"),
            name,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn visible_key(&self) -> &str {
        &self.visible_key
    }

    pub fn in_flight_key(&self) -> &str {
        &self.in_flight_key
    }

    fn count(&self, operation: &'static str) {
        metrics::queue_operations().add(
            1,
            &[
                KeyValue::new("queue", self.name.clone()),
                KeyValue::new("operation", operation),
            ],
        );
    }

    /// Append an item. Returns `true` once it is visible to consumers.
    pub async fn push(&self, item: impl AsRef<[u8]>) -> Result<bool> {
        let len = self.store.lpush(&self.visible_key, item.as_ref()).await?;
        self.count("push");
        Ok(len > 0)
    }

    /// Claim the oldest visible item without waiting.
    pub async fn pop(&self) -> Result<Option<Vec<u8>>> {
        let item = self
            .store
            .rpoplpush(&self.visible_key, &self.in_flight_key)
            .await?;
        self.count(if item.is_some() { "pop" } else { "pop_empty" });
        Ok(item)
    }

    /// Claim the oldest visible item, waiting up to `timeout` for one.
    ///
    /// `None` or a zero timeout waits indefinitely. Concurrent consumers
    /// never receive the same push.
    pub async fn block_pop(&self, timeout: Option<Duration>) -> Result<Option<Vec<u8>>> {
        let started = Instant::now();
        let item = self
            .store
            .brpoplpush(&self.visible_key, &self.in_flight_key, wait_limit(timeout))
            .await?;
        metrics::wait_duration_ms().record(
            started.elapsed().as_secs_f64() * 1000.0,
            &[KeyValue::new("operation", "queue.block_pop")],
        );
        self.count(if item.is_some() { "pop" } else { "pop_empty" });
        if item.is_none() {
            debug!(queue = %self.name, "block_pop timed out");
        }
        Ok(item)
    }

    /// Mark a claimed item as processed. Returns `false` if it was not in
    /// flight.
    pub async fn ack(&self, item: impl AsRef<[u8]>) -> Result<bool> {
        let removed = self.store.lrem(&self.in_flight_key, item.as_ref()).await?;
        self.count("ack");
        Ok(removed > 0)
    }

    /// Put one in-flight occurrence of `item` back in front of the visible
    /// items, so it is the next one claimed. Returns `false` if it was not
    /// in flight.
    pub async fn requeue(&self, item: impl AsRef<[u8]>) -> Result<bool> {
        let moved = self
            .store
            .eval(
                Script::QueueRequeue,
                &[self.visible_key.as_str(), self.in_flight_key.as_str()],
                &[item.as_ref()],
            )
            .await?
            == 1;
        if moved {
            self.count("requeue");
        }
        Ok(moved)
    }

    /// Claimed but unacknowledged items, most recently claimed first.
    pub async fn in_flight(&self) -> Result<Vec<Vec<u8>>> {
        self.store.lrange(&self.in_flight_key).await
    }

    pub async fn visible_len(&self) -> Result<usize> {
        self.store.llen(&self.visible_key).await
    }

    pub async fn in_flight_len(&self) -> Result<usize> {
        self.store.llen(&self.in_flight_key).await
    }

    /// Items not yet acknowledged: visible plus in flight.
    pub async fn len(&self) -> Result<usize> {
        Ok(self.visible_len().await? + self.in_flight_len().await?)
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }
}
