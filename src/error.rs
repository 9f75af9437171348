//! Error types for tandem-rs.
//!
//! Timeouts and empty pops are not errors; they come back as `Ok(None)`
//! or `Ok(false)`. Only store failures and protocol violations land here.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("store error: {0}")]
    Store(#[from] redis::RedisError),

    /// The lock was released with a token that no longer owns the key.
    /// The critical section may have overrun its lease.
    #[error("lock {name} released after its lease was lost")]
    LockRelease { name: String },

    /// The payload was stored but the id never reached the request queue.
    #[error("request {request_id} stored but not enqueued: {source}")]
    DeliveryLoss {
        request_id: String,
        #[source]
        source: Box<Error>,
    },

    #[error("request {request_id} has no stored payload")]
    MissingPayload { request_id: String },

    #[error("lock lease must be longer than zero")]
    InvalidLease,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
