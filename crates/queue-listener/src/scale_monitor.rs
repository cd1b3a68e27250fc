//! ScaleMonitor: sliding-window sampling and the scale-decision function
//!
//! `get_metrics` is queried synchronously on demand by an external
//! autoscaler — the sampling cadence itself is that caller's
//! responsibility, not this core's. `get_scale_status` is a pure function
//! of `(worker_count, samples)` so it is trivially testable in isolation
//! from any queue backend.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::error::ListenerResult;
use crate::queue_client::QueueClient;

/// One sample of queue depth and head-of-line age.
#[derive(Debug, Clone, Copy)]
pub struct QueueMetric {
    pub queue_length: u64,
    pub head_age: Duration,
    pub timestamp: Instant,
}

/// Advisory scale decision consumed by an external autoscaler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleVote {
    ScaleOut,
    ScaleIn,
    None,
}

/// Samples queue attributes on demand and evaluates the scale-vote rules
/// over the caller-supplied sliding window.
pub struct ScaleMonitor {
    client: Arc<dyn QueueClient>,
    window: usize,
    samples: Mutex<VecDeque<QueueMetric>>,
}

impl ScaleMonitor {
    pub fn new(client: Arc<dyn QueueClient>, window: usize) -> Self {
        Self {
            client,
            window,
            samples: Mutex::new(VecDeque::with_capacity(window)),
        }
    }

    /// Take one fresh sample, push it into the buffer (evicting the oldest
    /// once the buffer holds `window` entries), and return the scale vote
    /// over the resulting window. This is the method the exposed
    /// `get_scale_status` entry point calls; `get_scale_status` itself
    /// stays a free function of `(worker_count, samples)` for unit testing.
    pub async fn sample_and_vote(&self, worker_count: u64) -> ListenerResult<ScaleVote> {
        let metric = self.get_metrics().await?;
        let mut samples = self.samples.lock().unwrap();
        if samples.len() == self.window {
            samples.pop_front();
        }
        samples.push_back(metric);

        if samples.len() < self.window {
            // Evaluated against the configured window, since
            // `get_scale_status` itself only knows the length of what it
            // was handed.
            return Ok(ScaleVote::None);
        }

        let ordered: Vec<QueueMetric> = samples.iter().copied().collect();
        Ok(Self::get_scale_status(worker_count, &ordered))
    }

    /// Fetch one fresh [`QueueMetric`] sample.
    ///
    /// Transient storage errors (the same classification the poll loop
    /// uses) degrade to a zero-metric sample with a warning rather than
    /// propagating, since a scale decision based on one missed sample is
    /// preferable to crashing the autoscaler's polling loop; any other
    /// error propagates.
    pub async fn get_metrics(&self) -> ListenerResult<QueueMetric> {
        let attrs = match self.client.fetch_attributes().await {
            Ok(attrs) => attrs,
            Err(err) if err.is_transient_storage() => {
                tracing::warn!(error = %err, "Transient error sampling queue attributes");
                return Ok(QueueMetric {
                    queue_length: 0,
                    head_age: Duration::ZERO,
                    timestamp: Instant::now(),
                });
            }
            Err(err) => return Err(err),
        };

        if attrs.approximate_count == 0 {
            return Ok(QueueMetric {
                queue_length: 0,
                head_age: Duration::ZERO,
                timestamp: Instant::now(),
            });
        }

        // Attributes are stale for an empty queue: force length to 0 if the
        // peek comes back empty even though the attribute count said
        // otherwise.
        let head = self.client.peek().await?;
        let (queue_length, head_age) = match head {
            Some(msg) => (
                attrs.approximate_count,
                (chrono::Utc::now() - msg.inserted_at)
                    .to_std()
                    .unwrap_or(Duration::ZERO),
            ),
            None => (0, Duration::ZERO),
        };

        Ok(QueueMetric {
            queue_length,
            head_age,
            timestamp: Instant::now(),
        })
    }

    /// Evaluate the scale-vote rules over the most recent `samples`
    /// (`samples[0]` oldest, last element newest) for a pool currently
    /// running `worker_count` workers. Pure function, no I/O.
    ///
    /// Callers are expected to pass exactly the configured window size W;
    /// [`Self::sample_and_vote`] enforces "fewer than W samples available"
    /// before ever calling this. A bare length check here only guards the
    /// adjacent-pair helpers, which require W > 1.
    pub fn get_scale_status(worker_count: u64, samples: &[QueueMetric]) -> ScaleVote {
        let w = samples.len();
        if w < 2 {
            return ScaleVote::None;
        }

        let last = &samples[w - 1];
        let first = &samples[0];

        if last.queue_length > worker_count * 1000 {
            return ScaleVote::ScaleOut;
        }

        if samples.iter().all(|s| s.queue_length == 0) {
            return ScaleVote::ScaleIn;
        }

        if first.queue_length > 0 && strictly_increasing(samples, |s| s.queue_length) {
            return ScaleVote::ScaleOut;
        }

        if first.head_age > Duration::ZERO
            && first.head_age < last.head_age
            && non_decreasing(samples, |s| s.head_age)
        {
            return ScaleVote::ScaleOut;
        }

        if strictly_decreasing(samples, |s| s.queue_length) {
            return ScaleVote::ScaleIn;
        }

        if strictly_decreasing(samples, |s| s.head_age) {
            return ScaleVote::ScaleIn;
        }

        ScaleVote::None
    }
}

/// Asserts `window.len() > 1`; every adjacent-pair predicate below is
/// built on this.
fn adjacent_pairs_hold<T, K: PartialOrd>(
    window: &[T],
    key: impl Fn(&T) -> K,
    holds: impl Fn(&K, &K) -> bool,
) -> bool {
    assert!(window.len() > 1, "scale-vote window must contain W > 1 samples");
    window.windows(2).all(|pair| holds(&key(&pair[0]), &key(&pair[1])))
}

fn strictly_increasing<T, K: PartialOrd>(window: &[T], key: impl Fn(&T) -> K) -> bool {
    adjacent_pairs_hold(window, key, |a, b| a < b)
}

fn strictly_decreasing<T, K: PartialOrd>(window: &[T], key: impl Fn(&T) -> K) -> bool {
    adjacent_pairs_hold(window, key, |a, b| a > b)
}

fn non_decreasing<T, K: PartialOrd>(window: &[T], key: impl Fn(&T) -> K) -> bool {
    adjacent_pairs_hold(window, key, |a, b| a <= b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue_client::tests::InMemoryQueueClient;
    use crate::queue_client::Message;

    fn sample(queue_length: u64, head_age_secs: u64) -> QueueMetric {
        QueueMetric {
            queue_length,
            head_age: Duration::from_secs(head_age_secs),
            timestamp: Instant::now(),
        }
    }

    #[test]
    fn test_fewer_than_window_samples_votes_none() {
        let samples = vec![sample(1, 1)];
        assert_eq!(ScaleMonitor::get_scale_status(10, &samples), ScaleVote::None);
    }

    #[test]
    fn test_all_zero_length_votes_scale_in() {
        let samples: Vec<_> = (0..5).map(|_| sample(0, 0)).collect();
        assert_eq!(ScaleMonitor::get_scale_status(10, &samples), ScaleVote::ScaleIn);
    }

    #[test]
    fn test_growth_above_threshold_votes_scale_out() {
        // samples[W-1].length > worker_count * 1000 takes priority.
        let samples = vec![
            sample(100, 1),
            sample(100, 1),
            sample(100, 1),
            sample(100, 1),
            sample(20_000, 1),
        ];
        assert_eq!(ScaleMonitor::get_scale_status(10, &samples), ScaleVote::ScaleOut);
    }

    #[test]
    fn test_exact_threshold_is_not_scale_out() {
        // samples[W-1].length == worker_count * 1000 must not trigger rule 2
        // (strict inequality); flat, non-monotonic otherwise, so no other
        // rule fires either.
        let samples = vec![
            sample(1_000, 1),
            sample(1_000, 1),
            sample(1_000, 1),
            sample(1_000, 1),
            sample(10_000, 1),
        ];
        assert_eq!(ScaleMonitor::get_scale_status(10, &samples), ScaleVote::None);
    }

    #[test]
    fn test_strictly_increasing_length_votes_scale_out() {
        let samples = vec![sample(1, 0), sample(2, 0), sample(3, 0), sample(4, 0), sample(5, 0)];
        assert_eq!(ScaleMonitor::get_scale_status(10, &samples), ScaleVote::ScaleOut);
    }

    #[test]
    fn test_increasing_age_votes_scale_out() {
        let samples = vec![
            sample(5, 1),
            sample(5, 2),
            sample(5, 2),
            sample(5, 3),
            sample(5, 3),
        ];
        assert_eq!(ScaleMonitor::get_scale_status(10, &samples), ScaleVote::ScaleOut);
    }

    #[test]
    fn test_strictly_decreasing_length_votes_scale_in() {
        let samples = vec![sample(5, 0), sample(4, 0), sample(3, 0), sample(2, 0), sample(1, 0)];
        assert_eq!(ScaleMonitor::get_scale_status(10, &samples), ScaleVote::ScaleIn);
    }

    #[test]
    fn test_strictly_decreasing_age_votes_scale_in() {
        let samples = vec![
            sample(5, 5),
            sample(6, 4),
            sample(5, 3),
            sample(6, 2),
            sample(5, 1),
        ];
        assert_eq!(ScaleMonitor::get_scale_status(10, &samples), ScaleVote::ScaleIn);
    }

    #[test]
    fn test_flat_and_noisy_votes_none() {
        let samples = vec![
            sample(5, 5),
            sample(6, 4),
            sample(5, 5),
            sample(6, 4),
            sample(5, 5),
        ];
        assert_eq!(ScaleMonitor::get_scale_status(10, &samples), ScaleVote::None);
    }

    #[tokio::test]
    async fn test_sample_and_vote_votes_none_until_window_fills() {
        let client = Arc::new(InMemoryQueueClient::new("test"));
        let monitor = ScaleMonitor::new(client.clone(), 5);

        for _ in 0..4 {
            assert_eq!(monitor.sample_and_vote(10).await.unwrap(), ScaleVote::None);
        }
        // Fifth sample fills the window; an empty queue votes ScaleIn.
        assert_eq!(monitor.sample_and_vote(10).await.unwrap(), ScaleVote::ScaleIn);
    }

    #[tokio::test]
    async fn test_get_metrics_forces_zero_length_when_peek_empty() {
        let client = Arc::new(InMemoryQueueClient::new("test"));
        // Simulate a stale attribute count with nothing actually peekable.
        client.processing.lock().unwrap().push(Message {
            id: "phantom".to_string(),
            payload: vec![],
            dequeue_count: 0,
            inserted_at: chrono::Utc::now(),
            receipt: String::new(),
        });

        let monitor = ScaleMonitor::new(client, 5);
        let metric = monitor.get_metrics().await.unwrap();
        assert_eq!(metric.queue_length, 0);
    }
}
