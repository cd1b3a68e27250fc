//! Shared library for the queue-trigger listener workspace
//!
//! This crate provides the ambient stack used across every binary built on
//! top of the `queue-listener` core:
//! - Error handling types
//! - Redis connection configuration
//! - Logging infrastructure

pub mod config;
pub mod error;

// Re-export commonly used types
pub use config::RedisConfig;
pub use error::{Error, Result};

/// Initialize tracing subscriber for structured logging
pub fn init_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "shared=debug,queue_listener=debug,info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
