//! A queue-trigger listener core
//!
//! Consumes messages from a durable queue, dispatches each to a
//! user-supplied [`Handler`], renews its invisibility while the handler
//! runs, completes or poisons it according to the outcome, and exposes
//! scaling advice to an external autoscaler. The concrete queue SDK wire
//! protocol, the handler's own execution runtime, the poison-message retry
//! policy beyond a dequeue-count comparison, and the host's
//! listener-registry/lifecycle machinery are all out of scope — this crate
//! owns the four concerns that compose the hard part: adaptive polling
//! with backoff, a concurrency governor with graceful shutdown, a
//! visibility-extension sub-timer racing the handler, and the scale-vote
//! function.
//!
//! The crate also ships one concrete [`QueueClient`] implementation,
//! `RedisQueueClient`, so it is runnable end-to-end rather than a pile of
//! abstract traits; hosts that target a different queue service provide
//! their own adapter against the same trait.

pub mod backoff;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod handler;
pub mod lifecycle;
pub mod metrics;
pub mod notify;
pub mod poll_loop;
pub mod processor;
pub mod queue_client;
pub mod scale_monitor;
pub mod visibility_renewer;

pub use config::QueueListenerOptions;
pub use error::{ListenerError, ListenerResult};
pub use handler::{Handler, HandlerOutcome};
pub use lifecycle::QueueListener;
pub use processor::{FunctionResult, MessageProcessor, PoisonEventSink, RedisMessageProcessor};
pub use queue_client::{Message, QueueAttributes, QueueClient, RedisQueueClient};
pub use scale_monitor::{QueueMetric, ScaleMonitor, ScaleVote};
