//! The user handler contract
//!
//! The concrete action execution (an HTTP call, a message send, whatever
//! the host wants to do with the payload) is explicitly out of scope per
//! §1 — this crate only defines the seam the dispatcher invokes through.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::queue_client::Message;

/// Host-supplied unit of work invoked once per message.
///
/// Implementations should treat `poll_cancel` as advisory: if it fires
/// mid-invocation, the poll scope is shutting down and the handler should
/// wind down promptly, but it is still expected to return a `FunctionResult`
/// rather than panic (dispatcher-level errors are swallowed only for the
/// cancellation family — anything else surfaces as an unhandled exception).
#[async_trait]
pub trait Handler: Send + Sync {
    /// Execute the unit of work represented by `msg`. `poll_cancel` is the
    /// listener's poll-scope cancellation token, observable but not owned by
    /// the handler.
    async fn handle(&self, msg: &Message, poll_cancel: &CancellationToken) -> HandlerOutcome;
}

/// Result of invoking a handler. Mirrors `FunctionResult` at the boundary
/// the handler sees; `processor::FunctionResult` is the form the
/// `MessageProcessor` contract consumes.
#[derive(Debug, Clone)]
pub enum HandlerOutcome {
    Success,
    Failure(String),
}

impl From<HandlerOutcome> for crate::processor::FunctionResult {
    fn from(outcome: HandlerOutcome) -> Self {
        match outcome {
            HandlerOutcome::Success => crate::processor::FunctionResult::success(),
            HandlerOutcome::Failure(err) => crate::processor::FunctionResult::failure(err),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    /// A handler stand-in for dispatcher/poll-loop tests: always returns a
    /// fixed outcome after an optional artificial delay, and counts
    /// invocations so tests can assert exactly-once dispatch.
    pub struct ScriptedHandler {
        pub outcome: HandlerOutcome,
        pub delay: Duration,
        pub invocations: Arc<AtomicUsize>,
    }

    impl ScriptedHandler {
        pub fn new(outcome: HandlerOutcome) -> Self {
            Self {
                outcome,
                delay: Duration::ZERO,
                invocations: Arc::new(AtomicUsize::new(0)),
            }
        }

        pub fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }
    }

    #[async_trait]
    impl Handler for ScriptedHandler {
        async fn handle(&self, _msg: &Message, _poll_cancel: &CancellationToken) -> HandlerOutcome {
            self.invocations.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.outcome.clone()
        }
    }
}
