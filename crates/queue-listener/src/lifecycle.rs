//! Lifecycle: Start/Stop/Cancel/Dispose over the poll loop
//!
//! Owns two independent cancellation scopes: a **poll scope** (cancelled
//! by `cancel()` or `stop()`) and a **graceful-completion scope**
//! (cancelled only by a hard shutdown, so ordinary `stop()` still lets
//! in-flight `complete()` calls finish). Start/Stop are not reentrant; a
//! host supervisor is expected to own one `QueueListener` per queue.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::sync::Mutex;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::QueueListenerOptions;
use crate::error::{ListenerError, ListenerResult};
use crate::handler::Handler;
use crate::notify::{NotifiableDelay, NotifyHandle};
use crate::poll_loop::{self, PollLoopContext};
use crate::processor::MessageProcessor;
use crate::queue_client::QueueClient;
use crate::scale_monitor::{QueueMetric, ScaleMonitor, ScaleVote};

/// A single queue-trigger listener instance: one poll loop, one in-flight
/// dispatcher set, one scale monitor, bound to one queue.
pub struct QueueListener {
    client: Arc<dyn QueueClient>,
    processor: Arc<dyn MessageProcessor>,
    options: QueueListenerOptions,
    function_id: String,

    notify: NotifiableDelay,
    poll_cancel: CancellationToken,
    graceful_cancel: CancellationToken,
    poll_task: Mutex<Option<JoinHandle<ListenerResult<()>>>>,
    disposed: AtomicBool,
    /// Set as soon as the poll loop exits with a "storage-other" error
    /// (§7), independent of whether anyone is awaiting `stop()` — a
    /// supervisor polling `is_faulted()` observes it even if it never calls
    /// `stop()` itself.
    fault: Arc<Mutex<Option<String>>>,

    scale_monitor: ScaleMonitor,
}

impl QueueListener {
    pub fn new(
        function_id: impl Into<String>,
        client: Arc<dyn QueueClient>,
        processor: Arc<dyn MessageProcessor>,
        options: QueueListenerOptions,
    ) -> Self {
        let scale_monitor = ScaleMonitor::new(client.clone(), options.num_samples_to_consider);
        Self {
            client,
            processor,
            options,
            function_id: function_id.into(),
            notify: NotifiableDelay::new(),
            poll_cancel: CancellationToken::new(),
            graceful_cancel: CancellationToken::new(),
            poll_task: Mutex::new(None),
            disposed: AtomicBool::new(false),
            fault: Arc::new(Mutex::new(None)),
            scale_monitor,
        }
    }

    fn check_not_disposed(&self) -> ListenerResult<()> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(ListenerError::Disposed);
        }
        Ok(())
    }

    /// Launch the poll loop. The first poll happens immediately — there is
    /// no initial backoff wait (§4.8).
    pub fn start(&self, handler: Arc<dyn Handler>) -> ListenerResult<()> {
        self.check_not_disposed()?;

        let ctx = PollLoopContext {
            client: self.client.clone(),
            processor: self.processor.clone(),
            handler,
            visibility_timeout: self.options.visibility_timeout,
            min_visibility_renewal_interval: self.options.min_visibility_renewal_interval,
            min_polling_interval: self.options.min_polling_interval,
            notify: self.notify.clone(),
            poll_cancel: self.poll_cancel.clone(),
            graceful_cancel: self.graceful_cancel.clone(),
        };

        let fault = self.fault.clone();
        let handle = tokio::spawn(async move {
            let result = poll_loop::run(ctx).await;
            if let Err(ref err) = result {
                *fault.lock().unwrap() = Some(err.to_string());
            }
            result
        });
        *self.poll_task.lock().unwrap() = Some(handle);
        Ok(())
    }

    /// Whether the poll loop has faulted on a non-transient storage error
    /// (§7). A supervisor should treat this as "needs restart" regardless of
    /// whether it has called [`Self::stop`] yet.
    pub fn is_faulted(&self) -> bool {
        self.fault.lock().unwrap().is_some()
    }

    /// The fault message, if any, recorded when the poll loop last exited
    /// with a non-transient storage error.
    pub fn fault(&self) -> Option<String> {
        self.fault.lock().unwrap().clone()
    }

    /// A cloneable handle a shared cross-queue watcher can hold to wake
    /// this listener without owning it.
    pub fn notify_handle(&self) -> NotifyHandle {
        self.notify.handle()
    }

    /// Resolve the currently installed wake handle, short-circuiting an
    /// active backoff delay (§6 "Cross-queue wake").
    pub fn notify(&self) {
        self.notify.notify();
    }

    /// Request the poll loop to exit its current wait. Does not await
    /// in-flight dispatchers (§4.8) — use [`Self::stop`] for that.
    pub fn cancel(&self) {
        self.poll_cancel.cancel();
    }

    /// Cancel the poll scope, await every in-flight dispatcher to its
    /// natural completion (so `complete` calls finish), then await the
    /// poll-loop task itself. If `external_cancel` fires while this is in
    /// progress, the graceful-completion scope is also cancelled, and any
    /// `complete` call still in flight aborts (§4.8).
    pub async fn stop(&self, external_cancel: CancellationToken) -> ListenerResult<()> {
        self.check_not_disposed()?;

        self.poll_cancel.cancel();

        let handle = self.poll_task.lock().unwrap().take();
        let Some(handle) = handle else {
            return Ok(());
        };

        let graceful_cancel = self.graceful_cancel.clone();
        tokio::select! {
            result = handle => {
                match result {
                    Ok(Ok(())) => Ok(()),
                    // The poll loop faulted (§7); propagate it so the
                    // caller can tell a faulted stop from a clean one
                    // instead of both surfacing as `Ok(())`.
                    Ok(Err(fault)) => Err(fault),
                    Err(join_err) => Err(ListenerError::internal(join_err.to_string())),
                }
            }
            _ = external_cancel.cancelled() => {
                graceful_cancel.cancel();
                Ok(())
            }
        }
    }

    /// Tear down cancellation scopes. Subsequent public calls fail with
    /// [`ListenerError::Disposed`] (§4.8, §7).
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.poll_cancel.cancel();
        self.graceful_cancel.cancel();
        if let Some(handle) = self.poll_task.lock().unwrap().take() {
            handle.abort();
        }
    }

    /// `get_metrics` / `get_scale_status` per §6: samples a fresh queue
    /// metric, folds it into the sliding window, and returns the resulting
    /// vote for a pool of `worker_count` workers.
    pub async fn get_scale_status(&self, worker_count: u64) -> ListenerResult<ScaleVote> {
        self.check_not_disposed()?;
        self.scale_monitor.sample_and_vote(worker_count).await
    }

    /// A single fresh sample without folding it into the window, exposed
    /// for observability callers that just want the current depth/age.
    pub async fn get_metrics(&self) -> ListenerResult<QueueMetric> {
        self.check_not_disposed()?;
        self.scale_monitor.get_metrics().await
    }

    /// `"<function_id>-queuetrigger-<queue_name>"`, lowercased (§6).
    pub fn descriptor(&self) -> String {
        format!(
            "{}-queuetrigger-{}",
            self.function_id,
            self.client.queue_name()
        )
        .to_lowercase()
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
    use std::time::Duration;

    fn sample_message(id: &str) -> Message {
        Message {
            id: id.to_string(),
            payload: b"{}".to_vec(),
            dequeue_count: 1,
            inserted_at: chrono::Utc::now(),
            receipt: String::new(),
        }
    }

    fn make_listener(client: Arc<dyn QueueClient>) -> QueueListener {
        let processor: Arc<dyn MessageProcessor> = Arc::new(RedisMessageProcessor::new(
            client.clone(),
            "test-poison",
            3,
            4,
            2,
            Duration::from_millis(200),
        ));
        let mut options = QueueListenerOptions::default();
        options.min_polling_interval = Duration::from_millis(5);
        options.max_polling_interval = Duration::from_millis(200);
        options.visibility_timeout = Duration::from_secs(600);
        QueueListener::new("fn-1", client, processor, options)
    }

    #[test]
    fn test_descriptor_is_lowercased() {
        let client: Arc<dyn QueueClient> = Arc::new(InMemoryQueueClient::new("MyQueue"));
        let listener = make_listener(client);
        assert_eq!(listener.descriptor(), "fn-1-queuetrigger-myqueue");
    }

    #[tokio::test]
    async fn test_stop_drains_in_flight_and_leaves_queue_empty() {
        let client = Arc::new(InMemoryQueueClient::new("test"));
        for i in 0..3 {
            client.push(sample_message(&format!("m{i}")));
        }
        let client: Arc<dyn QueueClient> = client;
        let listener = make_listener(client.clone());
        let handler = Arc::new(ScriptedHandler::new(HandlerOutcome::Success));

        listener.start(handler.clone()).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        listener.stop(CancellationToken::new()).await.unwrap();

        assert_eq!(client.fetch_attributes().await.unwrap().approximate_count, 0);
    }

    #[tokio::test]
    async fn test_dispose_rejects_further_calls() {
        let client: Arc<dyn QueueClient> = Arc::new(InMemoryQueueClient::new("test"));
        let listener = make_listener(client);
        listener.dispose();

        let handler = Arc::new(ScriptedHandler::new(HandlerOutcome::Success));
        assert!(listener.start(handler).is_err());
        assert!(listener.get_metrics().await.is_err());
    }

    #[tokio::test]
    async fn test_notify_wakes_backoff_promptly() {
        let client: Arc<dyn QueueClient> = Arc::new(InMemoryQueueClient::new("test"));
        let mut options = QueueListenerOptions::default();
        options.min_polling_interval = Duration::from_millis(50);
        options.max_polling_interval = Duration::from_secs(5);
        let processor: Arc<dyn MessageProcessor> = Arc::new(RedisMessageProcessor::new(
            client.clone(),
            "test-poison",
            3,
            4,
            2,
            options.max_polling_interval,
        ));
        let listener = QueueListener::new("fn-1", client, processor, options);
        let handler = Arc::new(ScriptedHandler::new(HandlerOutcome::Success));

        listener.start(handler).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let start = std::time::Instant::now();
        listener.notify();
        // Give the poll loop a moment to re-enter its wait loop and observe
        // the queue is still empty before we assert timing.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(start.elapsed() < Duration::from_secs(1));

        listener.stop(CancellationToken::new()).await.unwrap();
    }

    /// A client whose `get_messages` always fails with a non-transient
    /// error, so `start()` leads the poll loop straight into the fault path.
    struct FaultyQueueClient;

    #[async_trait::async_trait]
    impl QueueClient for FaultyQueueClient {
        async fn exists(&self) -> ListenerResult<bool> {
            Ok(true)
        }

        async fn get_messages(
            &self,
            _count: u32,
            _visibility: Duration,
        ) -> ListenerResult<Vec<crate::queue_client::Message>> {
            Err(crate::error::ListenerError::internal("disk full"))
        }

        async fn update_message_visibility(
            &self,
            _msg: &crate::queue_client::Message,
            _new_visibility: Duration,
        ) -> ListenerResult<()> {
            Ok(())
        }

        async fn delete_message(&self, _msg: &crate::queue_client::Message) -> ListenerResult<()> {
            Ok(())
        }

        async fn add_message(&self, _poison_queue: &str, _payload: &[u8]) -> ListenerResult<()> {
            Ok(())
        }

        async fn fetch_attributes(&self) -> ListenerResult<crate::queue_client::QueueAttributes> {
            Ok(crate::queue_client::QueueAttributes { approximate_count: 0 })
        }

        async fn peek(&self) -> ListenerResult<Option<crate::queue_client::Message>> {
            Ok(None)
        }

        fn queue_name(&self) -> &str {
            "faulty"
        }
    }

    #[tokio::test]
    async fn test_fatal_storage_error_is_observable_as_a_fault() {
        let client: Arc<dyn QueueClient> = Arc::new(FaultyQueueClient);
        let listener = make_listener(client);
        let handler = Arc::new(ScriptedHandler::new(HandlerOutcome::Success));

        listener.start(handler).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Observable even without ever calling stop().
        assert!(listener.is_faulted());
        assert!(listener.fault().is_some());

        // stop() also surfaces the same fault rather than reporting a clean
        // exit, so a caller awaiting it can distinguish the two.
        assert!(listener.stop(CancellationToken::new()).await.is_err());
    }
}
