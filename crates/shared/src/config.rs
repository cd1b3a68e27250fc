//! Configuration management using environment variables
//!
//! This crate only owns the piece of configuration shared across every
//! binary built on top of the queue-listener core: how to reach Redis.
//! Listener-specific options (batch size, visibility timeout, ...) are
//! owned by `queue_listener::config` since their defaults and validation
//! are part of that component's contract, not the host application's.

use crate::error::{Error, Result};
use serde::Deserialize;
use std::env;

/// Redis connection configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    /// Redis host
    pub host: String,

    /// Redis port
    pub port: u16,

    /// Redis password (optional)
    pub password: Option<String>,
}

impl RedisConfig {
    /// Build a Redis connection URL
    pub fn connection_url(&self) -> String {
        if let Some(password) = &self.password {
            format!("redis://:{}@{}:{}", password, self.host, self.port)
        } else {
            format!("redis://{}:{}", self.host, self.port)
        }
    }

    /// Load from environment variables, applying the `dotenvy` convention
    /// used across this workspace (`.env` is loaded once, best-effort).
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        Ok(Self {
            host: env::var("REDIS_HOST").unwrap_or_else(|_| "localhost".to_string()),
            port: env::var("REDIS_PORT")
                .unwrap_or_else(|_| "6379".to_string())
                .parse()
                .map_err(|e| Error::config(format!("Invalid REDIS_PORT: {}", e)))?,
            password: env::var("REDIS_PASSWORD").ok(),
        })
    }
}
