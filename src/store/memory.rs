//! In-process backend with the same semantics as the Redis one.
//!
//! Keys expire lazily on access. Blocking pops park on a single `Notify`
//! that every list push wakes; woken waiters re-check under the state
//! mutex, so each pushed item is handed to exactly one of them.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Notify, mpsc};
use tokio::time::Instant;

use super::{KeyTtl, Script, Store, Subscription};
use crate::error::{Error, Result};

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    pushed: Notify,
}

#[derive(Default)]
struct State {
    values: HashMap<String, Value>,
    lists: HashMap<String, VecDeque<Vec<u8>>>,
    topics: HashMap<String, Vec<mpsc::UnboundedSender<Vec<u8>>>>,
}

struct Value {
    data: Vec<u8>,
    expires_at: Option<Instant>,
}

impl State {
    /// Look up a value, dropping it first if its expiry has passed.
    fn value(&mut self, key: &str) -> Option<&mut Value> {
        let expired = self
            .values
            .get(key)
            .and_then(|v| v.expires_at)
            .is_some_and(|at| at <= Instant::now());
        if expired {
            self.values.remove(key);
        }
        self.values.get_mut(key)
    }

    fn push_head(&mut self, key: &str, item: Vec<u8>) -> usize {
        let list = self.lists.entry(key.to_string()).or_default();
        list.push_front(item);
        list.len()
    }

    fn push_tail(&mut self, key: &str, item: Vec<u8>) -> usize {
        let list = self.lists.entry(key.to_string()).or_default();
        list.push_back(item);
        list.len()
    }

    /// Pop from a list end, removing the list once it is empty.
    fn pop(&mut self, key: &str, from_head: bool) -> Option<Vec<u8>> {
        let list = self.lists.get_mut(key)?;
        let item = if from_head {
            list.pop_front()
        } else {
            list.pop_back()
        };
        if list.is_empty() {
            self.lists.remove(key);
        }
        item
    }

    fn remove_first(&mut self, key: &str, item: &[u8]) -> usize {
        let Some(list) = self.lists.get_mut(key) else {
            return 0;
        };
        let Some(pos) = list.iter().position(|v| v.as_slice() == item) else {
            return 0;
        };
        list.remove(pos);
        if list.is_empty() {
            self.lists.remove(key);
        }
        1
    }

    fn move_tail_to_head(&mut self, source: &str, destination: &str) -> Option<Vec<u8>> {
        let item = self.pop(source, false)?;
        self.push_head(destination, item.clone());
        Some(item)
    }

    /// Returns the script result and whether a list grew.
    fn run_script(&mut self, script: Script, keys: &[&str], args: &[&[u8]]) -> Result<(i64, bool)> {
        match script {
            Script::LockAcquire => {
                let lock = key_at(script, keys, 0)?;
                let token = arg_at(script, args, 0)?;
                let lease = millis_at(script, args, 1)?;
                if self.value(lock).is_some() {
                    return Ok((0, false));
                }
                self.values.insert(
                    lock.to_string(),
                    Value {
                        data: token.to_vec(),
                        expires_at: Some(Instant::now() + lease),
                    },
                );
                Ok((1, false))
            }
            Script::LockRelease => {
                let lock = key_at(script, keys, 0)?;
                let event = key_at(script, keys, 1)?;
                let token = arg_at(script, args, 0)?;
                if !self.value(lock).is_some_and(|v| v.data == token) {
                    return Ok((0, false));
                }
                self.values.remove(lock);
                self.push_head(event, b"1".to_vec());
                if let Some(list) = self.lists.get_mut(event) {
                    list.truncate(1);
                }
                Ok((1, true))
            }
            Script::LockExtend => {
                let lock = key_at(script, keys, 0)?;
                let token = arg_at(script, args, 0)?;
                let additional = millis_at(script, args, 1)?;
                let Some(value) = self.value(lock) else {
                    return Ok((0, false));
                };
                if value.data != token {
                    return Ok((0, false));
                }
                if let Some(at) = value.expires_at {
                    value.expires_at = Some(at + additional);
                }
                Ok((1, false))
            }
            Script::QueueRequeue => {
                let visible = key_at(script, keys, 0)?;
                let in_flight = key_at(script, keys, 1)?;
                let item = arg_at(script, args, 0)?;
                if self.remove_first(in_flight, item) == 0 {
                    return Ok((0, false));
                }
                self.push_tail(visible, item.to_vec());
                Ok((1, true))
            }
        }
    }
}

fn key_at<'a>(script: Script, keys: &[&'a str], i: usize) -> Result<&'a str> {
    keys.get(i)
        .copied()
        .ok_or_else(|| Error::Other(format!("{script}: missing key {}", i + 1)))
}

fn arg_at<'a>(script: Script, args: &[&'a [u8]], i: usize) -> Result<&'a [u8]> {
    args.get(i)
        .copied()
        .ok_or_else(|| Error::Other(format!("{script}: missing argument {}", i + 1)))
}

fn millis_at(script: Script, args: &[&[u8]], i: usize) -> Result<Duration> {
    let raw = arg_at(script, args, i)?;
    std::str::from_utf8(raw)
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_millis)
        .ok_or_else(|| Error::Other(format!("{script}: argument {} is not milliseconds", i + 1)))
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Retry `take` until it yields an item or the timeout passes.
    async fn wait_for<F>(&self, timeout: Option<Duration>, mut take: F) -> Option<Vec<u8>>
    where
        F: FnMut(&mut State) -> Option<Vec<u8>> + Send,
    {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            // Register interest before looking so a push between the check
            // and the await still wakes us.
            let notified = self.pushed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let taken = {
                let mut state = self.state();
                take(&mut state)
            };
            if taken.is_some() {
                return taken;
            }

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return None;
                    }
                }
                None => notified.await,
            }
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn eval(&self, script: Script, keys: &[&str], args: &[&[u8]]) -> Result<i64> {
        let (result, grew) = self.state().run_script(script, keys, args)?;
        if grew {
            self.pushed.notify_waiters();
        }
        Ok(result)
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.state().value(key).map(|v| v.data.clone()))
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<()> {
        self.state().values.insert(
            key.to_string(),
            Value {
                data: value.to_vec(),
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut state = self.state();
        let had_value = state.value(key).is_some();
        state.values.remove(key);
        let had_list = state.lists.remove(key).is_some();
        Ok(had_value || had_list)
    }

    async fn ttl(&self, key: &str) -> Result<KeyTtl> {
        let mut state = self.state();
        if let Some(value) = state.value(key) {
            return Ok(match value.expires_at {
                Some(at) => KeyTtl::Expires(at.saturating_duration_since(Instant::now())),
                None => KeyTtl::Persistent,
            });
        }
        Ok(if state.lists.contains_key(key) {
            KeyTtl::Persistent
        } else {
            KeyTtl::Missing
        })
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        let mut state = self.state();
        let current = match state.value(key) {
            Some(value) => std::str::from_utf8(&value.data)
                .ok()
                .and_then(|s| s.parse::<i64>().ok())
                .ok_or_else(|| Error::Other(format!("value at {key} is not an integer")))?,
            None => 0,
        };
        let next = current + 1;
        let expires_at = state.value(key).and_then(|v| v.expires_at);
        state.values.insert(
            key.to_string(),
            Value {
                data: next.to_string().into_bytes(),
                expires_at,
            },
        );
        Ok(next)
    }

    async fn lpush(&self, key: &str, value: &[u8]) -> Result<usize> {
        let len = self.state().push_head(key, value.to_vec());
        self.pushed.notify_waiters();
        Ok(len)
    }

    async fn llen(&self, key: &str) -> Result<usize> {
        Ok(self.state().lists.get(key).map_or(0, VecDeque::len))
    }

    async fn lrange(&self, key: &str) -> Result<Vec<Vec<u8>>> {
        Ok(self
            .state()
            .lists
            .get(key)
            .map(|list| list.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn lrem(&self, key: &str, value: &[u8]) -> Result<usize> {
        Ok(self.state().remove_first(key, value))
    }

    async fn blpop(&self, key: &str, timeout: Option<Duration>) -> Result<Option<Vec<u8>>> {
        Ok(self.wait_for(timeout, |state| state.pop(key, true)).await)
    }

    async fn rpoplpush(&self, source: &str, destination: &str) -> Result<Option<Vec<u8>>> {
        let moved = self.state().move_tail_to_head(source, destination);
        if moved.is_some() {
            self.pushed.notify_waiters();
        }
        Ok(moved)
    }

    async fn brpoplpush(
        &self,
        source: &str,
        destination: &str,
        timeout: Option<Duration>,
    ) -> Result<Option<Vec<u8>>> {
        let moved = self
            .wait_for(timeout, |state| state.move_tail_to_head(source, destination))
            .await;
        if moved.is_some() {
            self.pushed.notify_waiters();
        }
        Ok(moved)
    }

    async fn publish(&self, topic: &str, message: &[u8]) -> Result<usize> {
        let mut state = self.state();
        let Some(subscribers) = state.topics.get_mut(topic) else {
            return Ok(0);
        };
        subscribers.retain(|tx| tx.send(message.to_vec()).is_ok());
        let delivered = subscribers.len();
        if delivered == 0 {
            state.topics.remove(topic);
        }
        Ok(delivered)
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state()
            .topics
            .entry(topic.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }
}
