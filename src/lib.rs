//! # tandem-rs
//!
//! Coordination primitives for separate processes sharing one Redis store.
//!
//! Provides a leased distributed lock, an at-least-once queue built from a
//! visible and an in-flight list, and request/response channels on top of
//! that queue with pub/sub wake-up hints. All shared state lives in the
//! store and changes only through its atomic commands and scripts.

pub mod channel;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod lock;
pub mod model;
pub mod queue;
pub mod store;
pub mod telemetry;

pub use channel::{Channel, ChannelConfig, Client, Server};
pub use coordinator::Coordinator;
pub use error::{Error, Result};
pub use lock::Lock;
pub use model::{Request, RequestId, RequestState};
pub use queue::Queue;
pub use store::{MemoryStore, RedisStore, Store};
