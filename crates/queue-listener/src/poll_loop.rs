//! PollLoop: the adaptive poll driver
//!
//! Repeatedly probes queue existence (cached), fetches a batch, fans each
//! message out to its own dispatcher task, and decides the next wait from
//! either draining the in-flight set (work was found) or a notifiable
//! backoff delay (idle or erroring). Everything here runs on a single
//! logical task so the in-flight set and existence cache need no locking.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::stream::FuturesUnordered;
use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::backoff::BackoffStrategy;
use crate::dispatcher;
use crate::handler::Handler;
use crate::notify::NotifiableDelay;
use crate::processor::MessageProcessor;
use crate::queue_client::QueueClient;

/// Tri-state cache for whether the target queue currently exists.
/// Reset to `Unknown` by any storage error so the next cycle re-probes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExistenceCache {
    Unknown,
    Exists,
    MissingOrError,
}

/// Everything the poll loop needs, bundled so `Listener` can hand it off to
/// a single spawned task without threading a dozen parameters through.
pub struct PollLoopContext {
    pub client: Arc<dyn QueueClient>,
    pub processor: Arc<dyn MessageProcessor>,
    pub handler: Arc<dyn Handler>,
    pub visibility_timeout: Duration,
    pub min_visibility_renewal_interval: Duration,
    pub min_polling_interval: Duration,
    pub notify: NotifiableDelay,
    pub poll_cancel: CancellationToken,
    pub graceful_cancel: CancellationToken,
}

/// Wall-clock budget for a single `get_messages` call. The timeout handler
/// is diagnostic-only: it logs a warning but does not abort the call
/// unless the poll-scope cancellation token fires first.
const FETCH_DIAGNOSTIC_TIMEOUT: Duration = Duration::from_secs(30);

/// Run the poll loop until `ctx.poll_cancel` fires, or until a non-transient
/// storage error faults the listener. On return, every dispatcher task
/// spawned by this loop has been awaited to completion — callers relying on
/// the in-flight set being empty after `Stop` depend on this.
///
/// `Ok(())` means the loop exited because its poll scope was cancelled
/// (graceful exit). `Err(_)` means a "storage-other" error (§7) propagated
/// out of a fetch and the listener has faulted; the host/supervisor owns
/// restarting it (§7, §8 — no further queue calls are made after this
/// returns either way).
pub async fn run(ctx: PollLoopContext) -> crate::error::ListenerResult<()> {
    let mut existence = ExistenceCache::Unknown;
    let mut backoff = BackoffStrategy::new(ctx.min_polling_interval, ctx.processor.max_polling_interval());
    let mut in_flight: FuturesUnordered<tokio::task::JoinHandle<()>> = FuturesUnordered::new();
    let new_batch_threshold = ctx.processor.new_batch_threshold() as usize;

    loop {
        if ctx.poll_cancel.is_cancelled() {
            break;
        }

        let poll_started = Instant::now();
        let mut succeeded = false;

        if existence != ExistenceCache::Exists {
            match ctx.client.exists().await {
                Ok(true) => existence = ExistenceCache::Exists,
                Ok(false) => {
                    existence = ExistenceCache::MissingOrError;
                }
                Err(err) => {
                    existence = ExistenceCache::Unknown;
                    tracing::warn!(error = %err, "Queue existence probe failed");
                }
            }
        }

        if existence == ExistenceCache::Exists {
            let fetch = ctx
                .client
                .get_messages(ctx.processor.batch_size(), ctx.visibility_timeout);

            let batch_result = tokio::select! {
                biased;
                _ = ctx.poll_cancel.cancelled() => None,
                result = timed_fetch(fetch) => Some(result),
            };

            match batch_result {
                None => break,
                Some(Ok(batch)) => {
                    metrics::histogram!("queue_listener_poll_latency_seconds")
                        .record(poll_started.elapsed().as_secs_f64());
                    metrics::histogram!("queue_listener_batch_size").record(batch.len() as f64);

                    if !batch.is_empty() {
                        succeeded = true;
                    }

                    for msg in batch {
                        let client = ctx.client.clone();
                        let processor = ctx.processor.clone();
                        let handler = ctx.handler.clone();
                        let visibility = ctx.visibility_timeout;
                        let min_renewal = ctx.min_visibility_renewal_interval;
                        let poll_cancel = ctx.poll_cancel.clone();
                        let graceful_cancel = ctx.graceful_cancel.clone();

                        in_flight.push(tokio::spawn(async move {
                            dispatcher::process(
                                client,
                                processor,
                                handler,
                                msg,
                                visibility,
                                min_renewal,
                                poll_cancel,
                                graceful_cancel,
                            )
                            .await;
                        }));
                        metrics::gauge!("queue_listener_in_flight_dispatchers")
                            .set(in_flight.len() as f64);
                    }
                }
                Some(Err(err)) => {
                    existence = ExistenceCache::Unknown;
                    if err.is_transient_storage() {
                        tracing::warn!(error = %err, "Transient storage error during poll, backing off");
                        metrics::counter!("queue_listener_transient_storage_errors_total").increment(1);
                    } else {
                        tracing::error!(error = %err, "Fatal storage error, listener faulting");
                        metrics::counter!("queue_listener_fatal_errors_total").increment(1);
                        // Drain remaining dispatchers before surfacing the
                        // fault so Stop-after-fault still sees InFlightSet
                        // empty; the fault itself propagates to the caller
                        // so a supervisor can tell a faulted exit from a
                        // clean one instead of both looking like `Ok(())`.
                        drain_completed(&mut in_flight, usize::MAX).await;
                        return Err(err);
                    }
                }
            }
        }

        // Decide the next wait. A success resets the backoff state even
        // though this path doesn't consult it, so the first failure after
        // any streak of successes starts growing from `min` again.
        if succeeded {
            backoff.next(true);
            drain_completed(&mut in_flight, new_batch_threshold).await;
        } else {
            let delay = backoff.next(false);
            metrics::histogram!("queue_listener_backoff_delay_seconds").record(delay.as_secs_f64());
            let reason = ctx.notify.wait(delay, &ctx.poll_cancel).await;
            if reason == crate::notify::WaitReason::Cancelled {
                break;
            }
        }
    }

    // Graceful exit: await every still-running dispatcher to completion so
    // a `Stop` caller observes an empty in-flight set.
    drain_completed(&mut in_flight, 0).await;
    Ok(())
}

/// Await `fetch` to completion, logging a diagnostic if it runs past
/// [`FETCH_DIAGNOSTIC_TIMEOUT`]. The diagnostic never aborts the call — the
/// future keeps being polled in the loop below — only the caller's race
/// against `poll_cancel` can do that.
async fn timed_fetch(
    fetch: impl std::future::Future<Output = crate::error::ListenerResult<Vec<crate::queue_client::Message>>>,
) -> crate::error::ListenerResult<Vec<crate::queue_client::Message>> {
    tokio::pin!(fetch);
    let mut warned = false;
    loop {
        tokio::select! {
            biased;
            result = &mut fetch => return result,
            _ = tokio::time::sleep(FETCH_DIAGNOSTIC_TIMEOUT), if !warned => {
                warned = true;
                tracing::warn!("get_messages exceeded diagnostic timeout, still waiting");
            }
        }
    }
}

/// Pop completed dispatcher tasks off `in_flight` until its length is at
/// most `target`, or (when `target == 0`/`usize::MAX`) fully drained.
async fn drain_completed(
    in_flight: &mut FuturesUnordered<tokio::task::JoinHandle<()>>,
    target: usize,
) {
    while in_flight.len() > target {
        match in_flight.next().await {
            Some(Ok(())) => {}
            Some(Err(join_err)) if join_err.is_cancelled() => {}
            Some(Err(join_err)) => {
                tracing::error!(error = %join_err, "Dispatcher task panicked");
            }
            None => break,
        }
        metrics::gauge!("queue_listener_in_flight_dispatchers").set(in_flight.len() as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::tests::ScriptedHandler;
    use crate::handler::HandlerOutcome;
    use crate::processor::RedisMessageProcessor;
    use crate::queue_client::tests::InMemoryQueueClient;
    use crate::queue_client::Message;
    use chrono::Utc;

    fn sample_message(id: &str) -> Message {
        Message {
            id: id.to_string(),
            payload: b"{}".to_vec(),
            dequeue_count: 1,
            inserted_at: Utc::now(),
            receipt: String::new(),
        }
    }

    fn make_ctx(
        client: Arc<dyn QueueClient>,
        handler: Arc<dyn Handler>,
    ) -> (PollLoopContext, CancellationToken) {
        let processor: Arc<dyn MessageProcessor> = Arc::new(RedisMessageProcessor::new(
            client.clone(),
            "test-poison",
            3,
            4,
            2,
            Duration::from_millis(200),
        ));
        let poll_cancel = CancellationToken::new();
        let graceful_cancel = CancellationToken::new();
        (
            PollLoopContext {
                client,
                processor,
                handler,
                visibility_timeout: Duration::from_secs(600),
                min_visibility_renewal_interval: Duration::from_secs(60),
                min_polling_interval: Duration::from_millis(5),
                notify: NotifiableDelay::new(),
                poll_cancel: poll_cancel.clone(),
                graceful_cancel,
            },
            poll_cancel,
        )
    }

    #[tokio::test]
    async fn test_drains_batch_and_stops_on_cancel() {
        let client = Arc::new(InMemoryQueueClient::new("test"));
        for i in 0..3 {
            client.push(sample_message(&format!("m{i}")));
        }
        let client: Arc<dyn QueueClient> = client;
        let handler = Arc::new(ScriptedHandler::new(HandlerOutcome::Success));
        let (ctx, poll_cancel) = make_ctx(client.clone(), handler.clone());

        let run_handle = tokio::spawn(run(ctx));
        tokio::time::sleep(Duration::from_millis(100)).await;
        poll_cancel.cancel();
        run_handle.await.unwrap().unwrap();

        assert_eq!(
            handler.invocations.load(std::sync::atomic::Ordering::SeqCst),
            3
        );
        assert_eq!(client.fetch_attributes().await.unwrap().approximate_count, 0);
    }

    #[tokio::test]
    async fn test_empty_queue_backs_off_without_panicking() {
        let client: Arc<dyn QueueClient> = Arc::new(InMemoryQueueClient::new("test"));
        let handler = Arc::new(ScriptedHandler::new(HandlerOutcome::Success));
        let (ctx, poll_cancel) = make_ctx(client, handler);

        let run_handle = tokio::spawn(run(ctx));
        tokio::time::sleep(Duration::from_millis(50)).await;
        poll_cancel.cancel();
        run_handle.await.unwrap().unwrap();
    }

    /// A client whose `get_messages` always fails with a non-transient
    /// error, to exercise the "storage-other" fault path (§7).
    struct FaultyQueueClient;

    #[async_trait::async_trait]
    impl QueueClient for FaultyQueueClient {
        async fn exists(&self) -> crate::error::ListenerResult<bool> {
            Ok(true)
        }

        async fn get_messages(
            &self,
            _count: u32,
            _visibility: Duration,
        ) -> crate::error::ListenerResult<Vec<crate::queue_client::Message>> {
            Err(crate::error::ListenerError::internal("disk full"))
        }

        async fn update_message_visibility(
            &self,
            _msg: &crate::queue_client::Message,
            _new_visibility: Duration,
        ) -> crate::error::ListenerResult<()> {
            Ok(())
        }

        async fn delete_message(&self, _msg: &crate::queue_client::Message) -> crate::error::ListenerResult<()> {
            Ok(())
        }

        async fn add_message(&self, _poison_queue: &str, _payload: &[u8]) -> crate::error::ListenerResult<()> {
            Ok(())
        }

        async fn fetch_attributes(&self) -> crate::error::ListenerResult<crate::queue_client::QueueAttributes> {
            Ok(crate::queue_client::QueueAttributes { approximate_count: 0 })
        }

        async fn peek(&self) -> crate::error::ListenerResult<Option<crate::queue_client::Message>> {
            Ok(None)
        }

        fn queue_name(&self) -> &str {
            "faulty"
        }
    }

    #[tokio::test]
    async fn test_fatal_storage_error_faults_the_loop() {
        let client: Arc<dyn QueueClient> = Arc::new(FaultyQueueClient);
        let handler = Arc::new(ScriptedHandler::new(HandlerOutcome::Success));
        let (ctx, _poll_cancel) = make_ctx(client, handler);

        // A non-transient error propagates out of `run` as `Err`, distinct
        // from the `Ok(())` a graceful cancellation produces, so a caller
        // awaiting the poll task can tell a fault from a clean stop.
        let result = run(ctx).await;
        assert!(result.is_err());
    }
}
