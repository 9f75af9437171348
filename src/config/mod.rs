//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing or
//! malformed. The Redis URL may carry credentials, so it is held as a
//! `SecretString`.

pub mod secrets;

use std::time::Duration;

use crate::channel::ChannelConfig;
use crate::error::{Error, Result};
use secrecy::SecretString;

#[derive(Debug)]
pub struct Config {
    pub redis_url: SecretString,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    /// Expiry for stored request payloads. `None` keeps them until acked.
    pub request_ttl: Option<Duration>,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            redis_url: SecretString::from(required_var("REDIS_URL")?),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            request_ttl: optional_secs("TANDEM_REQUEST_TTL_SECS")?,
        })
    }

    pub fn channel_config(&self) -> ChannelConfig {
        ChannelConfig {
            request_ttl: self.request_ttl,
        }
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

fn optional_secs(name: &str) -> Result<Option<Duration>> {
    let Ok(raw) = std::env::var(name) else {
        return Ok(None);
    };
    match raw.trim().parse::<u64>() {
        Ok(0) => Err(Error::Config(format!("{name} must be greater than zero"))),
        Ok(secs) => Ok(Some(Duration::from_secs(secs))),
        Err(_) => Err(Error::Config(format!(
            "{name} must be a whole number of seconds, got {raw:?}"
        ))),
    }
}
