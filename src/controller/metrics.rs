//! Prometheus metrics for the stack controller
//!
//! # Exported metrics
//! The `/metrics` endpoint (when built with `--features metrics`) exports the following metrics:
//! - `stack_reconcile_duration_seconds` (histogram): reconcile duration labeled by controller.
//! - `stack_reconcile_errors_total` (counter): reconcile errors labeled by controller and kind.
//! - `stack_work_queue_depth` (gauge): keys waiting in the work queue.
//! - `stack_deletions_total` (counter): stack deletions processed.
//! - `stack_child_operations_total` (counter): child writes labeled by kind and operation.

use std::sync::atomic::{AtomicI64, AtomicU64};

use once_cell::sync::Lazy;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

/// Labels for reconcile metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ReconcileLabels {
    /// Controller name, e.g. "stack"
    pub controller: String,
}

/// Labels for error metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorLabels {
    pub controller: String,
    /// Error kind, see `Error::metric_label`
    pub kind: String,
}

/// Labels for child write metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ChildOperationLabels {
    /// Child kind, e.g. "Deployment"
    pub kind: String,
    /// "create", "update", "scale", "recreate" or "delete"
    pub operation: String,
}

/// Histogram tracking reconcile duration (seconds)
pub static RECONCILE_DURATION_SECONDS: Lazy<Family<ReconcileLabels, Histogram>> = Lazy::new(|| {
    fn reconcile_histogram() -> Histogram {
        // 1ms .. ~32s across 16 buckets.
        Histogram::new(exponential_buckets(0.001, 2.0, 16))
    }

    Family::new_with_constructor(reconcile_histogram)
});

/// Counter tracking reconcile errors
pub static RECONCILE_ERRORS_TOTAL: Lazy<Family<ErrorLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

/// Gauge tracking pending keys in the work queue
pub static WORK_QUEUE_DEPTH: Lazy<Gauge<i64, AtomicI64>> = Lazy::new(Gauge::default);

/// Counter tracking processed stack deletions
pub static DELETIONS_TOTAL: Lazy<Counter<u64, AtomicU64>> = Lazy::new(Counter::default);

/// Counter tracking writes to child objects
pub static CHILD_OPERATIONS_TOTAL: Lazy<Family<ChildOperationLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let mut registry = Registry::default();

    registry.register(
        "stack_reconcile_duration_seconds",
        "Duration of reconcile loops in seconds",
        RECONCILE_DURATION_SECONDS.clone(),
    );
    registry.register(
        "stack_reconcile_errors_total",
        "Total number of reconcile errors",
        RECONCILE_ERRORS_TOTAL.clone(),
    );
    registry.register(
        "stack_work_queue_depth",
        "Number of stacks waiting to be reconciled",
        WORK_QUEUE_DEPTH.clone(),
    );
    registry.register(
        "stack_deletions_total",
        "Total number of stack deletions processed",
        DELETIONS_TOTAL.clone(),
    );
    registry.register(
        "stack_child_operations_total",
        "Total number of writes to child objects",
        CHILD_OPERATIONS_TOTAL.clone(),
    );

    registry
});

/// Observe a reconcile duration in seconds.
pub fn observe_reconcile_duration_seconds(controller: &str, seconds: f64) {
    let labels = ReconcileLabels {
        controller: controller.to_string(),
    };
    RECONCILE_DURATION_SECONDS
        .get_or_create(&labels)
        .observe(seconds);
}

/// Increment the reconcile error counter.
pub fn inc_reconcile_error(controller: &str, kind: &str) {
    let labels = ErrorLabels {
        controller: controller.to_string(),
        kind: kind.to_string(),
    };
    RECONCILE_ERRORS_TOTAL.get_or_create(&labels).inc();
}

pub fn set_work_queue_depth(depth: usize) {
    WORK_QUEUE_DEPTH.set(i64::try_from(depth).unwrap_or(i64::MAX));
}

pub fn inc_deletions() {
    DELETIONS_TOTAL.inc();
}

pub fn inc_child_operation(kind: &str, operation: &str) {
    let labels = ChildOperationLabels {
        kind: kind.to_string(),
        operation: operation.to_string(),
    };
    CHILD_OPERATIONS_TOTAL.get_or_create(&labels).inc();
}
