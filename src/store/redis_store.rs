//! Redis backend.
//!
//! Non-blocking commands share one `ConnectionManager`. Blocking pops open a
//! dedicated multiplexed connection per call, because a BLPOP parked on the
//! shared connection would hold up every other command behind it.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt as _;
use redis::AsyncCommands as _;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{KeyTtl, Script, Store, Subscription};
use crate::error::Result;

/// Compiled scripts, built once per store.
///
/// `redis::Script` keeps the SHA1 of its source and falls back from
/// EVALSHA to EVAL on the first call against a fresh server, so nothing
/// needs to be preloaded.
pub struct ScriptRegistry {
    lock_acquire: redis::Script,
    lock_release: redis::Script,
    lock_extend: redis::Script,
    queue_requeue: redis::Script,
}

impl ScriptRegistry {
    pub fn new() -> Self {
        Self {
            lock_acquire: redis::Script::new(Script::LockAcquire.source()),
            lock_release: redis::Script::new(Script::LockRelease.source()),
            lock_extend: redis::Script::new(Script::LockExtend.source()),
            queue_requeue: redis::Script::new(Script::QueueRequeue.source()),
        }
    }

    pub fn get(&self, script: Script) -> &redis::Script {
        match script {
            Script::LockAcquire => &self.lock_acquire,
            Script::LockRelease => &self.lock_release,
            Script::LockExtend => &self.lock_extend,
            Script::QueueRequeue => &self.queue_requeue,
        }
    }

    /// SHA1 digest Redis uses to cache the script.
    pub fn hash(&self, script: Script) -> &str {
        self.get(script).get_hash()
    }
}

impl Default for ScriptRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Store handle backed by a Redis server.
pub struct RedisStore {
    client: redis::Client,
    conn: ConnectionManager,
    scripts: ScriptRegistry,
}

impl RedisStore {
    /// Connect to Redis and register the coordination scripts.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client.clone()).await?;
        Ok(Self {
            client,
            conn,
            scripts: ScriptRegistry::new(),
        })
    }

    /// Round-trip a PING.
    pub async fn health_check(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    pub fn scripts(&self) -> &ScriptRegistry {
        &self.scripts
    }

    async fn blocking_connection(&self) -> Result<MultiplexedConnection> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }
}

/// Redis reads a zero timeout as "block forever", so a finite wait must
/// never round down to zero.
fn timeout_secs(timeout: Option<Duration>) -> f64 {
    match timeout {
        Some(t) => t.as_secs_f64().max(0.001),
        None => 0.0,
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn eval(&self, script: Script, keys: &[&str], args: &[&[u8]]) -> Result<i64> {
        let mut invocation = self.scripts.get(script).prepare_invoke();
        for key in keys {
            invocation.key(*key);
        }
        for arg in args {
            invocation.arg(*arg);
        }
        let mut conn = self.conn.clone();
        let result: i64 = invocation.invoke_async(&mut conn).await?;
        debug!(%script, result, "script evaluated");
        Ok(result)
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn.clone();
        let value: Option<Vec<u8>> = conn.get(key).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<()> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg((ttl.as_millis() as u64).max(1));
        }
        let mut conn = self.conn.clone();
        let _: () = cmd.query_async(&mut conn).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: usize = conn.del(key).await?;
        Ok(removed > 0)
    }

    async fn ttl(&self, key: &str) -> Result<KeyTtl> {
        let mut conn = self.conn.clone();
        let millis: i64 = conn.pttl(key).await?;
        Ok(match millis {
            -2 => KeyTtl::Missing,
            ms if ms < 0 => KeyTtl::Persistent,
            ms => KeyTtl::Expires(Duration::from_millis(ms as u64)),
        })
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        let mut conn = self.conn.clone();
        let value: i64 = conn.incr(key, 1).await?;
        Ok(value)
    }

    async fn lpush(&self, key: &str, value: &[u8]) -> Result<usize> {
        let mut conn = self.conn.clone();
        let len: usize = conn.lpush(key, value).await?;
        Ok(len)
    }

    async fn llen(&self, key: &str) -> Result<usize> {
        let mut conn = self.conn.clone();
        let len: usize = conn.llen(key).await?;
        Ok(len)
    }

    async fn lrange(&self, key: &str) -> Result<Vec<Vec<u8>>> {
        let mut conn = self.conn.clone();
        let items: Vec<Vec<u8>> = conn.lrange(key, 0, -1).await?;
        Ok(items)
    }

    async fn lrem(&self, key: &str, value: &[u8]) -> Result<usize> {
        let mut conn = self.conn.clone();
        let removed: usize = conn.lrem(key, 1, value).await?;
        Ok(removed)
    }

    async fn blpop(&self, key: &str, timeout: Option<Duration>) -> Result<Option<Vec<u8>>> {
        let mut conn = self.blocking_connection().await?;
        let popped: Option<(Vec<u8>, Vec<u8>)> = redis::cmd("BLPOP")
            .arg(key)
            .arg(timeout_secs(timeout))
            .query_async(&mut conn)
            .await?;
        Ok(popped.map(|(_, value)| value))
    }

    async fn rpoplpush(&self, source: &str, destination: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn.clone();
        let moved: Option<Vec<u8>> = conn.rpoplpush(source, destination).await?;
        Ok(moved)
    }

    async fn brpoplpush(
        &self,
        source: &str,
        destination: &str,
        timeout: Option<Duration>,
    ) -> Result<Option<Vec<u8>>> {
        let mut conn = self.blocking_connection().await?;
        let moved: Option<Vec<u8>> = redis::cmd("BRPOPLPUSH")
            .arg(source)
            .arg(destination)
            .arg(timeout_secs(timeout))
            .query_async(&mut conn)
            .await?;
        Ok(moved)
    }

    async fn publish(&self, topic: &str, message: &[u8]) -> Result<usize> {
        let mut conn = self.conn.clone();
        let receivers: usize = conn.publish(topic, message).await?;
        Ok(receivers)
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(topic).await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let topic = topic.to_string();
        tokio::spawn(async move {
            let mut messages = Box::pin(pubsub.into_on_message());
            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    msg = messages.next() => {
                        let Some(msg) = msg else { break };
                        match msg.get_payload::<Vec<u8>>() {
                            Ok(payload) => {
                                if tx.send(payload).is_err() {
                                    break;
                                }
                            }
                            Err(e) => warn!(topic = %topic, "undecodable pubsub payload: {e}"),
                        }
                    }
                }
            }
            // Dropping the message stream closes the pubsub connection.
            debug!(topic = %topic, "subscription closed");
        });

        Ok(rx)
    }
}
