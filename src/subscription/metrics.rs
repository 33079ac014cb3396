//! Prometheus metrics for subscription coordination.
//!
//! Metrics cover:
//! - Lock acquisition outcomes, wait time and release failures
//! - Topology increments and partition record writes
//! - Session registrations and watch notifications
//!
//! All metrics are registered to a custom registry with the
//! `nakadi_subscription` prefix. If a metric fails to register, an
//! unregistered instance is used instead of panicking.

use once_cell::sync::Lazy;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Registry, TextEncoder, opts,
};
use tracing::warn;

/// Custom registry for subscription metrics.
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    Registry::new_custom(Some("nakadi_subscription".to_string()), None)
        .unwrap_or_else(|_| Registry::new())
});

/// Declare an IntCounterVec metric with labels.
macro_rules! define_counter_vec {
    ($name:ident, $metric_name:expr, $help:expr, [$($label:expr),+ $(,)?]) => {
        #[doc = $help]
        pub static $name: Lazy<IntCounterVec> = Lazy::new(|| {
            register_int_counter_vec_safe(&REGISTRY, $metric_name, $help, &[$($label),+])
        });
    };
}

/// Declare an IntCounter metric (no labels).
macro_rules! define_counter {
    ($name:ident, $metric_name:expr, $help:expr) => {
        #[doc = $help]
        pub static $name: Lazy<IntCounter> =
            Lazy::new(|| register_int_counter_safe(&REGISTRY, $metric_name, $help));
    };
}

/// Declare a HistogramVec metric with labels and buckets.
macro_rules! define_histogram_vec {
    ($name:ident, $metric_name:expr, $help:expr, [$($label:expr),+ $(,)?], [$($bucket:expr),+ $(,)?]) => {
        #[doc = $help]
        pub static $name: Lazy<HistogramVec> = Lazy::new(|| {
            register_histogram_vec_safe(&REGISTRY, $metric_name, $help, &[$($label),+], vec![$($bucket),+])
        });
    };
}

// =============================================================================
// Lock metrics
// =============================================================================

define_counter_vec!(
    LOCK_ACQUISITIONS,
    "lock_acquisitions_total",
    "Subscription lock acquisition attempts",
    ["outcome"]
);
define_histogram_vec!(
    LOCK_WAIT_DURATION,
    "lock_wait_duration_seconds",
    "Time spent waiting for the subscription lock",
    ["outcome"],
    [0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0]
);
define_counter!(
    LOCK_RELEASE_FAILURES,
    "lock_release_failures_total",
    "Subscription lock releases that failed"
);

// =============================================================================
// State metrics
// =============================================================================

define_counter!(
    TOPOLOGY_INCREMENTS,
    "topology_increments_total",
    "Topology version increments"
);
define_counter_vec!(
    PARTITION_WRITES,
    "partition_writes_total",
    "Partition record writes by target state",
    ["state"]
);
define_counter!(
    PARTITIONS_TRANSFERRED,
    "partitions_transferred_total",
    "Partitions handed over by transfer"
);

// =============================================================================
// Session and watch metrics
// =============================================================================

define_counter_vec!(
    SESSION_REGISTRATIONS,
    "session_registrations_total",
    "Session registry operations",
    ["op", "status"]
);
define_counter_vec!(
    WATCH_NOTIFICATIONS,
    "watch_notifications_total",
    "Change notifications delivered",
    ["kind"]
);

/// Register an IntCounterVec safely, returning an unregistered fallback on error.
fn register_int_counter_vec_safe(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> IntCounterVec {
    let counter =
        IntCounterVec::new(opts!(name, help), labels).expect("metric opts should be valid");
    match registry.register(Box::new(counter.clone())) {
        Ok(()) => counter,
        Err(e) => {
            warn!(name, error = %e, "Failed to register IntCounterVec metric, using unregistered fallback");
            counter
        }
    }
}

/// Register an IntCounter safely, returning an unregistered fallback on error.
fn register_int_counter_safe(registry: &Registry, name: &str, help: &str) -> IntCounter {
    let counter = IntCounter::new(name, help).expect("metric name/help should be valid");
    match registry.register(Box::new(counter.clone())) {
        Ok(()) => counter,
        Err(e) => {
            warn!(name, error = %e, "Failed to register IntCounter metric, using unregistered fallback");
            counter
        }
    }
}

/// Register a HistogramVec safely, returning an unregistered fallback on error.
fn register_histogram_vec_safe(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
    buckets: Vec<f64>,
) -> HistogramVec {
    let histogram = HistogramVec::new(HistogramOpts::new(name, help).buckets(buckets), labels)
        .expect("metric opts should be valid");
    match registry.register(Box::new(histogram.clone())) {
        Ok(()) => histogram,
        Err(e) => {
            warn!(name, error = %e, "Failed to register HistogramVec metric, using unregistered fallback");
            histogram
        }
    }
}

/// Force registration of every metric so they show up before first use.
pub fn init_metrics() {
    let _ = &*LOCK_ACQUISITIONS;
    let _ = &*LOCK_WAIT_DURATION;
    let _ = &*LOCK_RELEASE_FAILURES;
    let _ = &*TOPOLOGY_INCREMENTS;
    let _ = &*PARTITION_WRITES;
    let _ = &*PARTITIONS_TRANSFERRED;
    let _ = &*SESSION_REGISTRATIONS;
    let _ = &*WATCH_NOTIFICATIONS;
}

/// Encode all metrics in Prometheus text format.
pub fn encode_metrics() -> Result<String, Box<dyn std::error::Error>> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

/// Gather all metric families from the registry.
pub fn gather_metrics() -> Vec<prometheus::proto::MetricFamily> {
    REGISTRY.gather()
}

pub fn record_lock_acquired(outcome: &str, wait_secs: f64) {
    LOCK_ACQUISITIONS.with_label_values(&[outcome]).inc();
    LOCK_WAIT_DURATION
        .with_label_values(&[outcome])
        .observe(wait_secs);
}

pub fn record_lock_release_failure() {
    LOCK_RELEASE_FAILURES.inc();
}

pub fn record_topology_increment() {
    TOPOLOGY_INCREMENTS.inc();
}

pub fn record_partition_write(state: &str) {
    PARTITION_WRITES.with_label_values(&[state]).inc();
}

pub fn record_partitions_transferred(count: usize) {
    PARTITIONS_TRANSFERRED.inc_by(count as u64);
}

pub fn record_session_operation(op: &str, status: &str) {
    SESSION_REGISTRATIONS.with_label_values(&[op, status]).inc();
}

pub fn record_watch_notification(kind: &str) {
    WATCH_NOTIFICATIONS.with_label_values(&[kind]).inc();
}
