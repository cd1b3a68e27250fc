//! Visibility renewer: keeps a checked-out message invisible while its
//! handler is still running
//!
//! Spawned by the dispatcher alongside the handler invocation and stopped
//! once the handler returns. The first extension attempt fires at `V/2`;
//! after that, a `LinearSpeedupStrategy` keeps the normal cadence on
//! success and halves the interval (floored) on failure, so a struggling
//! queue backend gets retried faster right up until the message goes
//! invisible again.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::queue_client::{Message, QueueClient};

/// Schedule for the accelerated retry cadence: normal interval on success,
/// halved (floored) on failure.
#[derive(Debug, Clone, Copy)]
struct LinearSpeedupStrategy {
    normal_interval: Duration,
    minimum_interval: Duration,
    current_interval: Duration,
}

impl LinearSpeedupStrategy {
    fn new(normal_interval: Duration, minimum_interval: Duration) -> Self {
        Self {
            normal_interval,
            minimum_interval,
            current_interval: normal_interval,
        }
    }

    fn next(&mut self, succeeded: bool) -> Duration {
        self.current_interval = if succeeded {
            self.normal_interval
        } else {
            (self.current_interval / 2).max(self.minimum_interval)
        };
        self.current_interval
    }
}

/// Handle to a running renewer task. Dropping this without calling
/// [`VisibilityRenewerHandle::stop`] still aborts the task (so a panicking
/// dispatcher can't leak it), but `stop` is the cooperative path that lets
/// the renewer observe its own cancellation and exit cleanly.
pub struct VisibilityRenewerHandle {
    stop: Arc<Notify>,
    task: JoinHandle<()>,
}

impl VisibilityRenewerHandle {
    /// Signal the renewer to stop and await its exit. Per §4.3, the
    /// renewer must not outlive the dispatcher call site that started it.
    pub async fn stop(self) {
        self.stop.notify_one();
        let _ = self.task.await;
    }
}

/// Start a renewer for `msg`, extending its invisibility by `visibility`
/// every tick on the schedule described above. `client` is used for the
/// actual `update_message_visibility` calls.
pub fn spawn(
    client: Arc<dyn QueueClient>,
    msg: Message,
    visibility: Duration,
    min_renewal_interval: Duration,
) -> VisibilityRenewerHandle {
    let stop = Arc::new(Notify::new());
    let stop_waiter = stop.clone();

    let task = tokio::spawn(async move {
        run(client, msg, visibility, min_renewal_interval, stop_waiter).await;
    });

    VisibilityRenewerHandle { stop, task }
}

async fn run(
    client: Arc<dyn QueueClient>,
    msg: Message,
    visibility: Duration,
    min_renewal_interval: Duration,
    stop: Arc<Notify>,
) {
    let normal_interval = visibility / 2;
    let mut schedule = LinearSpeedupStrategy::new(normal_interval, min_renewal_interval);
    let mut next_delay = normal_interval;

    loop {
        tokio::select! {
            biased;
            _ = stop.notified() => {
                return;
            }
            _ = tokio::time::sleep(next_delay) => {}
        }

        match client.update_message_visibility(&msg, visibility).await {
            Ok(()) => {
                tracing::debug!(message_id = %msg.id, "Extended message visibility");
                metrics::counter!("queue_listener_visibility_extensions_total").increment(1);
                next_delay = schedule.next(true);
            }
            Err(err) if err.is_message_gone() => {
                tracing::debug!(
                    message_id = %msg.id,
                    "Message gone during visibility renewal, stopping renewer"
                );
                return;
            }
            Err(err) => {
                tracing::warn!(
                    message_id = %msg.id,
                    error = %err,
                    "Visibility extension failed, retrying on accelerated schedule"
                );
                metrics::counter!("queue_listener_visibility_extension_failures_total").increment(1);
                next_delay = schedule.next(false);
            }
        }
    }
}
