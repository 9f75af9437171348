//! Store seam: the handful of key-value operations the coordination
//! primitives are allowed to use.
//!
//! Everything that must be atomic is either a single native command or a
//! registered [`Script`]. Two backends implement the trait: [`RedisStore`]
//! for real deployments and [`MemoryStore`] for tests and single-process
//! hosts.

pub mod memory;
pub mod redis_store;

pub use memory::MemoryStore;
pub use redis_store::{RedisStore, ScriptRegistry};

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;

/// Messages delivered to a subscriber, in publish order.
///
/// Dropping the receiver ends the subscription.
pub type Subscription = mpsc::UnboundedReceiver<Vec<u8>>;

/// Atomic scripts known to every backend.
///
/// Key and argument layout per script:
///
/// | script         | keys                  | args                     |
/// |----------------|-----------------------|--------------------------|
/// | `LockAcquire`  | lock                  | token, lease ms          |
/// | `LockRelease`  | lock, event           | token                    |
/// | `LockExtend`   | lock                  | token, additional ms     |
/// | `QueueRequeue` | visible, in-flight    | item                     |
///
/// Each returns 1 on success and 0 otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Script {
    LockAcquire,
    LockRelease,
    LockExtend,
    QueueRequeue,
}

impl Script {
    pub const ALL: [Script; 4] = [
        Script::LockAcquire,
        Script::LockRelease,
        Script::LockExtend,
        Script::QueueRequeue,
    ];

    /// Lua source used by the Redis backend.
    pub fn source(self) -> &'static str {
        match self {
            Script::LockAcquire => include_str!("scripts/lock_acquire.lua"),
            Script::LockRelease => include_str!("scripts/lock_release.lua"),
            Script::LockExtend => include_str!("scripts/lock_extend.lua"),
            Script::QueueRequeue => include_str!("scripts/queue_requeue.lua"),
        }
    }
}

impl std::fmt::Display for Script {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Script::LockAcquire => "lock_acquire",
            Script::LockRelease => "lock_release",
            Script::LockExtend => "lock_extend",
            Script::QueueRequeue => "queue_requeue",
        };
        write!(f, "{s}")
    }
}

/// Remaining lifetime of a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTtl {
    /// The key does not exist.
    Missing,
    /// The key exists without an expiry.
    Persistent,
    /// The key expires after the given duration.
    Expires(Duration),
}

/// The store contract.
///
/// List operations follow Redis conventions: `lpush` adds at the head,
/// `blpop` takes from the head, and `rpoplpush` moves the tail of one list
/// to the head of another. Blocking calls wait forever when `timeout` is
/// `None`.
#[async_trait]
pub trait Store: Send + Sync {
    /// Run a registered script atomically.
    async fn eval(&self, script: Script, keys: &[&str], args: &[&[u8]]) -> Result<i64>;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<()>;

    /// Delete a key of any type. Returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool>;

    async fn ttl(&self, key: &str) -> Result<KeyTtl>;

    /// Atomically increment a counter, returning the new value.
    async fn incr(&self, key: &str) -> Result<i64>;

    /// Push onto the head of a list. Returns the new length.
    async fn lpush(&self, key: &str, value: &[u8]) -> Result<usize>;

    async fn llen(&self, key: &str) -> Result<usize>;

    /// Whole list, head first.
    async fn lrange(&self, key: &str) -> Result<Vec<Vec<u8>>>;

    /// Remove the first occurrence of `value`. Returns the number removed.
    async fn lrem(&self, key: &str, value: &[u8]) -> Result<usize>;

    async fn blpop(&self, key: &str, timeout: Option<Duration>) -> Result<Option<Vec<u8>>>;

    async fn rpoplpush(&self, source: &str, destination: &str) -> Result<Option<Vec<u8>>>;

    async fn brpoplpush(
        &self,
        source: &str,
        destination: &str,
        timeout: Option<Duration>,
    ) -> Result<Option<Vec<u8>>>;

    /// Fire-and-forget publish. Returns how many subscribers received it.
    async fn publish(&self, topic: &str, message: &[u8]) -> Result<usize>;

    async fn subscribe(&self, topic: &str) -> Result<Subscription>;
}

/// Public APIs treat a zero timeout as "wait forever".
pub(crate) fn wait_limit(timeout: Option<Duration>) -> Option<Duration> {
    timeout.filter(|t| !t.is_zero())
}
