//! Distributed mutual-exclusion lock with a lease.
//!
//! The lock key holds the current holder's token and expires with the
//! lease. Acquire and release are single scripts, so no other client can
//! interleave between the check and the write. Waiters park on a separate
//! event list that every successful release pushes one sentinel onto.
//!
//! Waking is a hint, not a hand-off: a woken waiter re-runs the acquire
//! script and may lose to a client that never waited. There is no fairness.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use opentelemetry::KeyValue;
use sha2::{Digest, Sha256};
use tokio::time::Instant;
use tracing::{Instrument, debug, warn};

use crate::error::{Error, Result};
use crate::store::{KeyTtl, Script, Store, wait_limit};
use crate::telemetry::{metrics, spans};

/// Shortest park between attempts when the lease is about to run out.
const MIN_WAIT: Duration = Duration::from_millis(5);

/// A named lock. One instance per would-be holder.
pub struct Lock {
    store: Arc<dyn Store>,
    name: String,
    event_key: String,
    token: Option<String>,
}

impl Lock {
    pub fn new(store: Arc<dyn Store>, name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            store,
            event_key: format!("lock_event_{name}"),
            name,
            token: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Key of the wake-up list.
    pub fn event_key(&self) -> &str {
        &self.event_key
    }

    /// Whether this instance believes it holds the lock. The lease may
    /// still have run out in the store.
    pub fn is_held(&self) -> bool {
        self.token.is_some()
    }

    /// Token for this acquisition: the name digested with a fresh nonce, so
    /// two holders of the same name never share one.
    fn mint_token(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.name.as_bytes());
        hasher.update(b":");
        hasher.update(uuid::Uuid::new_v4().as_bytes());
        hex::encode(hasher.finalize())
    }

    async fn try_acquire(&self, token: &str, lease: Duration) -> Result<bool> {
        let lease_ms = (lease.as_millis() as u64).max(1).to_string();
        let acquired = self
            .store
            .eval(
                Script::LockAcquire,
                &[self.name.as_str()],
                &[token.as_bytes(), lease_ms.as_bytes()],
            )
            .await?;
        Ok(acquired == 1)
    }

    /// Acquire the lock for `lease`, waiting up to `block_timeout`.
    ///
    /// `None` or a zero timeout waits indefinitely. Returns `false` when the
    /// wait ran out without acquiring.
    pub async fn acquire(&mut self, lease: Duration, block_timeout: Option<Duration>) -> Result<bool> {
        if lease.is_zero() {
            return Err(Error::InvalidLease);
        }
        let started = Instant::now();
        let deadline = wait_limit(block_timeout).map(|t| started + t);
        let token = self.mint_token();

        let acquired = loop {
            if self.try_acquire(&token, lease).await? {
                break true;
            }

            let remaining = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        break false;
                    }
                    Some(deadline - now)
                }
                None => None,
            };

            // A holder that dies never pushes a sentinel, so never park
            // past the point where its lease lets the key go.
            let wait = match self.store.ttl(&self.name).await? {
                KeyTtl::Missing => continue,
                KeyTtl::Persistent => remaining,
                KeyTtl::Expires(left) => {
                    let left = left.max(MIN_WAIT);
                    Some(remaining.map_or(left, |r| r.min(left)))
                }
            };

            if self.store.blpop(&self.event_key, wait).await?.is_some() {
                debug!(lock = %self.name, "woken by release");
            }
        };

        metrics::lock_acquisitions().add(
            1,
            &[
                KeyValue::new("lock", self.name.clone()),
                KeyValue::new("result", if acquired { "acquired" } else { "timeout" }),
            ],
        );
        metrics::wait_duration_ms().record(
            started.elapsed().as_secs_f64() * 1000.0,
            &[KeyValue::new("operation", "lock.acquire")],
        );

        if acquired {
            debug!(lock = %self.name, lease_ms = lease.as_millis() as u64, "lock acquired");
            self.token = Some(token);
        }
        Ok(acquired)
    }

    /// Release the lock and wake one waiter.
    ///
    /// Returns `false` if this instance holds nothing or its token no longer
    /// owns the key. The latter means the lease ran out and someone else may
    /// have held the lock concurrently; callers should treat it as a failure.
    ///
    /// A store error leaves the token in place so the release can be retried.
    pub async fn release(&mut self) -> Result<bool> {
        let Some(token) = self.token.as_deref() else {
            return Ok(false);
        };
        let released = self
            .store
            .eval(
                Script::LockRelease,
                &[self.name.as_str(), self.event_key.as_str()],
                &[token.as_bytes()],
            )
            .await?
            == 1;
        self.token = None;

        metrics::lock_releases().add(
            1,
            &[
                KeyValue::new("lock", self.name.clone()),
                KeyValue::new("result", if released { "released" } else { "lost" }),
            ],
        );
        if released {
            debug!(lock = %self.name, "lock released");
        } else {
            warn!(lock = %self.name, "release found a foreign token; lease was lost");
        }
        Ok(released)
    }

    /// Push the lease deadline out by `additional`.
    ///
    /// Returns `false` if the lease already ran out or belongs to someone
    /// else.
    pub async fn extend(&mut self, additional: Duration) -> Result<bool> {
        let Some(ref token) = self.token else {
            return Ok(false);
        };
        let additional_ms = (additional.as_millis() as u64).to_string();
        let extended = self
            .store
            .eval(
                Script::LockExtend,
                &[self.name.as_str()],
                &[token.as_bytes(), additional_ms.as_bytes()],
            )
            .await?
            == 1;
        if !extended {
            warn!(lock = %self.name, "extend refused; lease was lost");
        }
        Ok(extended)
    }

    /// Time left on whoever currently holds the lock, if anyone.
    pub async fn remaining_lease(&self) -> Result<Option<Duration>> {
        Ok(match self.store.ttl(&self.name).await? {
            KeyTtl::Expires(left) => Some(left),
            KeyTtl::Missing | KeyTtl::Persistent => None,
        })
    }

    /// Operator reset: drop the lock key and its event list regardless of
    /// who holds it.
    pub async fn clear(&mut self) -> Result<()> {
        self.store.delete(&self.name).await?;
        self.store.delete(&self.event_key).await?;
        self.token = None;
        Ok(())
    }

    /// Run `f` while holding the lock.
    ///
    /// Returns `Ok(None)` if the lock could not be acquired in time. The
    /// lock is released after `f` completes whatever it returns; a release
    /// that finds a foreign token is reported as [`Error::LockRelease`].
    ///
    /// Release happens only when `f` runs to completion. If `f` panics, or
    /// the returned future is dropped mid-section (e.g. by an outer
    /// `tokio::time::timeout`), the key stays held until its lease expires.
    pub async fn run<F, Fut, T>(
        &mut self,
        lease: Duration,
        block_timeout: Option<Duration>,
        f: F,
    ) -> Result<Option<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let span = spans::start_lock_span(&self.name);
        let acquired = self
            .acquire(lease, block_timeout)
            .instrument(span.clone())
            .await?;
        span.record("lock.acquired", acquired);
        if !acquired {
            return Ok(None);
        }

        let output = f().instrument(span.clone()).await;

        if !self.release().instrument(span).await? {
            return Err(Error::LockRelease {
                name: self.name.clone(),
            });
        }
        Ok(Some(output))
    }
}
