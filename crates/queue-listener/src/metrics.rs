//! Observability for the queue-trigger listener
//!
//! Uses the `metrics` facade (not `prometheus` directly — see the
//! workspace `Cargo.toml` note on the protobuf CVE in `prometheus` 0.13)
//! with `metrics-exporter-prometheus` as the concrete recorder, installed
//! once at process startup. Call sites across the crate emit through the
//! facade macros directly (`metrics::counter!`, `metrics::histogram!`);
//! this module only owns installation, metric descriptions, and the
//! `/metrics` render path.

use std::sync::OnceLock;

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the Prometheus recorder and describe every metric this crate
/// emits. Call once at process startup, before `QueueListener::start`.
pub fn init_metrics() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| {
            let handle = PrometheusBuilder::new()
                .install_recorder()
                .expect("failed to install Prometheus recorder");

            describe_histogram!(
                "queue_listener_poll_latency_seconds",
                "Wall-clock duration of a single get_messages poll"
            );
            describe_histogram!(
                "queue_listener_batch_size",
                "Number of messages returned by a single poll"
            );
            describe_histogram!(
                "queue_listener_backoff_delay_seconds",
                "Backoff delay chosen before the next poll"
            );
            describe_histogram!(
                "queue_listener_handler_duration_seconds",
                "Wall-clock duration of a single handler invocation"
            );
            describe_counter!(
                "queue_listener_handler_outcomes_total",
                "Handler invocations, labeled by success/failure"
            );
            describe_counter!(
                "queue_listener_visibility_extensions_total",
                "Successful visibility-extension calls"
            );
            describe_counter!(
                "queue_listener_visibility_extension_failures_total",
                "Failed visibility-extension calls"
            );
            describe_counter!(
                "queue_listener_transient_storage_errors_total",
                "Transient storage errors encountered while polling"
            );
            describe_counter!(
                "queue_listener_fatal_errors_total",
                "Non-transient storage errors that faulted the listener"
            );
            describe_counter!(
                "queue_listener_poisoned_total",
                "Messages moved to a poison queue after exhausting retries"
            );
            describe_gauge!(
                "queue_listener_in_flight_dispatchers",
                "Current count of in-flight dispatcher tasks"
            );

            handle
        })
        .clone()
}

/// The global Prometheus handle, for rendering `/metrics`.
///
/// # Panics
/// Panics if [`init_metrics`] hasn't been called yet.
pub fn prometheus_handle() -> &'static PrometheusHandle {
    PROMETHEUS_HANDLE
        .get()
        .expect("metrics not initialized: call init_metrics() first")
}
