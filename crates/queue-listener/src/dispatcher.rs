//! Dispatcher: the per-message lifecycle
//!
//! `begin → renewer-start → handler → renewer-stop → complete`, strictly
//! sequenced. Runs as its own spawned task so the poll loop can fan a batch
//! out concurrently; the poll loop tracks completion through the
//! `JoinHandle` it gets back, not through any state this module owns.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::handler::Handler;
use crate::processor::{FunctionResult, MessageProcessor};
use crate::queue_client::{Message, QueueClient};
use crate::visibility_renewer;

/// Run one message through its full lifecycle.
///
/// `poll_cancel` is handed to the handler so it can cooperatively check it,
/// but the dispatcher itself never uses it to abort an in-flight handler —
/// that is what lets `Stop` await every dispatcher to natural completion
/// rather than truncating whatever the handler was doing. `complete` is
/// called against `graceful_cancel` instead, so that a soft `Stop` lets the
/// final delete/poison call finish even though the poll scope has already
/// been cancelled; only a hard shutdown (dispose, or `external_cancel`
/// firing during `Stop`) cancels that scope and causes `complete` to abort.
pub async fn process(
    client: Arc<dyn QueueClient>,
    processor: Arc<dyn MessageProcessor>,
    handler: Arc<dyn Handler>,
    msg: Message,
    visibility: Duration,
    min_visibility_renewal_interval: Duration,
    poll_cancel: CancellationToken,
    graceful_cancel: CancellationToken,
) {
    if !processor.begin(&msg).await {
        tracing::debug!(message_id = %msg.id, "begin() declined message, skipping");
        return;
    }

    let renewer = visibility_renewer::spawn(
        client.clone(),
        msg.clone(),
        visibility,
        min_visibility_renewal_interval,
    );

    let started = Instant::now();
    let result: FunctionResult = handler.handle(&msg, &poll_cancel).await.into();
    let handler_duration = started.elapsed();

    renewer.stop().await;

    metrics::histogram!("queue_listener_handler_duration_seconds")
        .record(handler_duration.as_secs_f64());
    metrics::counter!(
        "queue_listener_handler_outcomes_total",
        "success" => result.success.to_string()
    )
    .increment(1);

    match processor.complete(&msg, result, &graceful_cancel).await {
        Ok(()) => {}
        Err(err) if err.is_cancelled() => {
            tracing::debug!(
                message_id = %msg.id,
                "complete() cancelled by hard shutdown, message will be redelivered"
            );
        }
        Err(err) => {
            // Not a task fault: this dispatcher may never be awaited, so the
            // only way the host learns of this is an immediate log at the
            // point of occurrence.
            tracing::error!(
                message_id = %msg.id,
                error = %err,
                "Unhandled error completing message"
            );
        }
    }
}
