//! Queue-trigger listener binary
//!
//! Wires the library's `QueueListener` to a Redis-backed queue and a demo
//! handler that just logs the payload. The concrete handler a production
//! deployment runs is a host concern this crate never owns; swap
//! `LoggingHandler` for a real one when embedding this crate rather than
//! running the binary directly.

use anyhow::{Context, Result};
use async_trait::async_trait;
use queue_listener::{
    Handler, HandlerOutcome, Message, QueueListener, QueueListenerOptions, RedisMessageProcessor,
    RedisQueueClient,
};
use redis::aio::ConnectionManager;
use shared::RedisConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Demo handler: logs the payload and always succeeds. Stands in for the
/// user handler runtime this crate deliberately does not own.
struct LoggingHandler;

#[async_trait]
impl Handler for LoggingHandler {
    async fn handle(&self, msg: &Message, _poll_cancel: &CancellationToken) -> HandlerOutcome {
        tracing::info!(
            message_id = %msg.id,
            dequeue_count = msg.dequeue_count,
            payload_len = msg.payload.len(),
            "Handling message"
        );
        HandlerOutcome::Success
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    shared::init_tracing();
    queue_listener::metrics::init_metrics();

    tracing::info!("Starting queue-trigger listener...");

    let redis_config = RedisConfig::from_env().context("Failed to load Redis configuration")?;
    let options = QueueListenerOptions::from_env().context("Failed to load listener configuration")?;

    let redis_client =
        redis::Client::open(redis_config.connection_url()).context("Failed to create Redis client")?;
    let conn = ConnectionManager::new(redis_client)
        .await
        .context("Failed to connect to Redis")?;

    tracing::info!("Connected to Redis");

    let queue_name = std::env::var("QUEUE_LISTENER_QUEUE_NAME").unwrap_or_else(|_| "default".to_string());
    let poison_queue_name =
        std::env::var("QUEUE_LISTENER_POISON_QUEUE_NAME").unwrap_or_else(|_| format!("{queue_name}-poison"));
    let function_id = std::env::var("QUEUE_LISTENER_FUNCTION_ID").unwrap_or_else(|_| "queue-listener".to_string());

    let client = Arc::new(RedisQueueClient::new(conn, queue_name.clone()));
    client
        .ensure_provisioned()
        .await
        .context("Failed to provision queue")?;

    let processor = Arc::new(RedisMessageProcessor::new(
        client.clone(),
        poison_queue_name,
        options.max_dequeue_count,
        options.batch_size,
        options.new_batch_threshold,
        options.max_polling_interval,
    ));

    let listener = Arc::new(QueueListener::new(
        function_id,
        client,
        processor,
        options,
    ));

    tracing::info!(descriptor = %listener.descriptor(), "Listener descriptor");

    listener
        .start(Arc::new(LoggingHandler))
        .context("Failed to start listener")?;

    signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    tracing::info!("Shutdown signal received, stopping listener...");
    listener
        .stop(CancellationToken::new())
        .await
        .context("Failed to stop listener cleanly")?;

    // Give a hard-abort fallback a moment to settle in tests/operators
    // tailing logs; no behavioral effect on an already-clean stop.
    tokio::time::sleep(Duration::from_millis(10)).await;

    tracing::info!("Queue-trigger listener stopped");
    Ok(())
}
