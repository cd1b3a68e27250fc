//! Listener configuration
//!
//! `QueueListenerOptions` owns every knob named in the external-interfaces
//! option table: batch size, retry limit, poll gating threshold, backoff
//! ceiling, visibility timeout and its renewal floor, and the scale-monitor
//! sample window. Defaults mirror the documented defaults; validation runs
//! once at construction time so a bad value is a configuration error, not a
//! panic deep inside the poll loop.

use std::time::Duration;

use crate::error::{ListenerError, ListenerResult};

/// The minimum polling interval the backoff ceiling may not go below.
pub const MINIMUM_POLLING_INTERVAL: Duration = Duration::from_millis(50);

/// Validated configuration for a single queue listener.
#[derive(Debug, Clone)]
pub struct QueueListenerOptions {
    /// Messages requested per poll. Must be > 0.
    pub batch_size: u32,

    /// Retry limit before a message is poisoned. Must be > 0.
    pub max_dequeue_count: u32,

    /// In-flight dispatcher count above which the poll loop waits instead
    /// of issuing another fetch. Unsigned, so the documented "must be >= 0"
    /// constraint always holds; kept as its own field since it's a
    /// user-tunable knob, not a derived value.
    pub new_batch_threshold: u32,

    /// Backoff upper bound. Must be >= `MINIMUM_POLLING_INTERVAL`.
    pub max_polling_interval: Duration,

    /// Initial invisibility window granted to a dequeued message.
    pub visibility_timeout: Duration,

    /// Floor for the visibility renewer's accelerated schedule.
    pub min_visibility_renewal_interval: Duration,

    /// Width of the ScaleMonitor's sliding sample window (W).
    pub num_samples_to_consider: usize,

    /// Lower bound for the randomized-exponential backoff strategy.
    pub min_polling_interval: Duration,
}

impl Default for QueueListenerOptions {
    fn default() -> Self {
        Self {
            batch_size: 16,
            max_dequeue_count: 5,
            new_batch_threshold: 8,
            max_polling_interval: Duration::from_secs(30),
            visibility_timeout: Duration::from_secs(600),
            min_visibility_renewal_interval: Duration::from_secs(60),
            num_samples_to_consider: 5,
            min_polling_interval: MINIMUM_POLLING_INTERVAL,
        }
    }
}

impl QueueListenerOptions {
    /// Validate the option set, returning a configuration error describing
    /// the first constraint violated.
    pub fn validate(&self) -> ListenerResult<()> {
        if self.batch_size == 0 {
            return Err(ListenerError::invalid_config("batch_size must be > 0"));
        }
        if self.max_dequeue_count == 0 {
            return Err(ListenerError::invalid_config("max_dequeue_count must be > 0"));
        }
        if self.max_polling_interval < MINIMUM_POLLING_INTERVAL {
            return Err(ListenerError::invalid_config(format!(
                "max_polling_interval must be >= {:?}",
                MINIMUM_POLLING_INTERVAL
            )));
        }
        if self.min_polling_interval < Duration::from_millis(1) {
            return Err(ListenerError::invalid_config(
                "min_polling_interval must be >= 1ms",
            ));
        }
        if self.min_polling_interval > self.max_polling_interval {
            return Err(ListenerError::invalid_config(
                "min_polling_interval must be <= max_polling_interval",
            ));
        }
        if self.num_samples_to_consider == 0 {
            return Err(ListenerError::invalid_config(
                "num_samples_to_consider must be > 0",
            ));
        }
        if self.visibility_timeout.is_zero() {
            return Err(ListenerError::invalid_config(
                "visibility_timeout must be > 0",
            ));
        }
        Ok(())
    }

    /// Load options from environment variables, falling back to documented
    /// defaults for anything unset. Follows the `dotenvy`-first convention
    /// used across this workspace.
    pub fn from_env() -> ListenerResult<Self> {
        dotenvy::dotenv().ok();

        let defaults = Self::default();

        let batch_size = env_or_default("QUEUE_LISTENER_BATCH_SIZE", defaults.batch_size)?;
        let max_dequeue_count =
            env_or_default("QUEUE_LISTENER_MAX_DEQUEUE_COUNT", defaults.max_dequeue_count)?;
        let new_batch_threshold = env_or_default(
            "QUEUE_LISTENER_NEW_BATCH_THRESHOLD",
            defaults.new_batch_threshold,
        )?;
        let max_polling_interval_secs = env_or_default(
            "QUEUE_LISTENER_MAX_POLLING_INTERVAL_SECS",
            defaults.max_polling_interval.as_secs(),
        )?;
        let visibility_timeout_secs = env_or_default(
            "QUEUE_LISTENER_VISIBILITY_TIMEOUT_SECS",
            defaults.visibility_timeout.as_secs(),
        )?;
        let min_visibility_renewal_interval_secs = env_or_default(
            "QUEUE_LISTENER_MIN_VISIBILITY_RENEWAL_INTERVAL_SECS",
            defaults.min_visibility_renewal_interval.as_secs(),
        )?;
        let num_samples_to_consider = env_or_default(
            "QUEUE_LISTENER_NUM_SAMPLES_TO_CONSIDER",
            defaults.num_samples_to_consider,
        )?;

        let options = Self {
            batch_size,
            max_dequeue_count,
            new_batch_threshold,
            max_polling_interval: Duration::from_secs(max_polling_interval_secs),
            visibility_timeout: Duration::from_secs(visibility_timeout_secs),
            min_visibility_renewal_interval: Duration::from_secs(
                min_visibility_renewal_interval_secs,
            ),
            num_samples_to_consider,
            min_polling_interval: defaults.min_polling_interval,
        };

        options.validate()?;
        Ok(options)
    }
}

fn env_or_default<T>(key: &str, default: T) -> ListenerResult<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| ListenerError::invalid_config(format!("Invalid {}: {}", key, e))),
        Err(_) => Ok(default),
    }
}
