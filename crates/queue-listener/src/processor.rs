//! `MessageProcessor`: the begin/complete/poison contract
//!
//! The dispatcher treats this as an external collaborator — the
//! poison-message *policy* beyond a dequeue-count comparison is the host's
//! business rule to set — but the crate ships a default Redis-backed
//! implementation so the listener is runnable on its own rather than a
//! pile of abstract traits.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::ListenerResult;
use crate::queue_client::{Message, QueueClient};

/// Outcome of invoking the user handler on a message.
#[derive(Debug, Clone)]
pub struct FunctionResult {
    pub success: bool,
    pub error: Option<String>,
}

impl FunctionResult {
    pub fn success() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
        }
    }
}

/// A sink notified after a message is moved to the poison queue. The
/// listener forwards this to the shared cross-queue watcher so any
/// listener on the poison queue wakes immediately.
#[async_trait]
pub trait PoisonEventSink: Send + Sync {
    async fn on_poisoned(&self, poison_queue: &str, message_id: &str);
}

/// A sink that does nothing; the default when no cross-queue watcher is
/// wired up.
pub struct NoopPoisonEventSink;

#[async_trait]
impl PoisonEventSink for NoopPoisonEventSink {
    async fn on_poisoned(&self, _poison_queue: &str, _message_id: &str) {}
}

/// Per-queue processing policy: batch sizing, retry threshold, and the
/// begin/complete/poison hooks.
#[async_trait]
pub trait MessageProcessor: Send + Sync {
    fn batch_size(&self) -> u32;
    fn new_batch_threshold(&self) -> u32;
    fn max_polling_interval(&self) -> std::time::Duration;

    /// Returns `false` to skip this message entirely (e.g. dequeue-count
    /// already exceeded, already poisoned by a concurrent listener).
    async fn begin(&self, msg: &Message) -> bool;

    /// Finalize a message after the handler has returned. Uses the
    /// graceful-completion cancellation scope, not the poll scope, so that
    /// delete/poison calls can finish during an ordinary stop.
    async fn complete(
        &self,
        msg: &Message,
        result: FunctionResult,
        graceful_cancel: &CancellationToken,
    ) -> ListenerResult<()>;
}

/// Default `MessageProcessor`: deletes on success, and on failure either
/// leaves the message to become visible again (implicit retry, handled by
/// the queue client's reclaim path) or moves it to the poison queue.
pub struct RedisMessageProcessor {
    client: Arc<dyn QueueClient>,
    poison_queue_name: String,
    max_dequeue_count: u32,
    batch_size: u32,
    new_batch_threshold: u32,
    max_polling_interval: std::time::Duration,
    poison_sink: Arc<dyn PoisonEventSink>,
}

impl RedisMessageProcessor {
    pub fn new(
        client: Arc<dyn QueueClient>,
        poison_queue_name: impl Into<String>,
        max_dequeue_count: u32,
        batch_size: u32,
        new_batch_threshold: u32,
        max_polling_interval: std::time::Duration,
    ) -> Self {
        Self {
            client,
            poison_queue_name: poison_queue_name.into(),
            max_dequeue_count,
            batch_size,
            new_batch_threshold,
            max_polling_interval,
            poison_sink: Arc::new(NoopPoisonEventSink),
        }
    }

    pub fn with_poison_sink(mut self, sink: Arc<dyn PoisonEventSink>) -> Self {
        self.poison_sink = sink;
        self
    }
}

#[async_trait]
impl MessageProcessor for RedisMessageProcessor {
    fn batch_size(&self) -> u32 {
        self.batch_size
    }

    fn new_batch_threshold(&self) -> u32 {
        self.new_batch_threshold
    }

    fn max_polling_interval(&self) -> std::time::Duration {
        self.max_polling_interval
    }

    async fn begin(&self, msg: &Message) -> bool {
        if msg.dequeue_count > self.max_dequeue_count {
            tracing::warn!(
                message_id = %msg.id,
                dequeue_count = msg.dequeue_count,
                max_dequeue_count = self.max_dequeue_count,
                "Skipping message that already exceeded dequeue budget"
            );
            return false;
        }
        true
    }

    async fn complete(
        &self,
        msg: &Message,
        result: FunctionResult,
        graceful_cancel: &CancellationToken,
    ) -> ListenerResult<()> {
        if graceful_cancel.is_cancelled() {
            return Err(crate::error::ListenerError::Cancelled);
        }

        if result.success {
            self.client.delete_message(msg).await?;
            tracing::debug!(message_id = %msg.id, "Message completed successfully");
            return Ok(());
        }

        if msg.dequeue_count >= self.max_dequeue_count {
            self.client
                .add_message(&self.poison_queue_name, &msg.payload)
                .await?;
            self.client.delete_message(msg).await?;

            tracing::error!(
                message_id = %msg.id,
                dequeue_count = msg.dequeue_count,
                error = ?result.error,
                "Message exceeded dequeue budget; moved to poison queue"
            );
            metrics::counter!("queue_listener_poisoned_total").increment(1);
            self.poison_sink
                .on_poisoned(&self.poison_queue_name, &msg.id)
                .await;
        } else {
            tracing::warn!(
                message_id = %msg.id,
                dequeue_count = msg.dequeue_count,
                error = ?result.error,
                "Handler failed; leaving message for implicit redelivery"
            );
        }

        Ok(())
    }
}
