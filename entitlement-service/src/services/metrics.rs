//! Metrics module for entitlement-service.
//! Provides Prometheus metrics for lifecycle, discount and usage operations.

use once_cell::sync::Lazy;
use prometheus::{
    histogram_opts, opts, register_histogram_vec, register_int_counter_vec, Encoder, HistogramVec,
    IntCounterVec, TextEncoder,
};
use std::sync::OnceLock;

/// Store operation duration histogram
pub static STORE_OPERATION_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        histogram_opts!(
            "entitlement_store_operation_duration_seconds",
            "Store operation duration",
            vec![0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]
        ),
        &["backend", "operation"]
    )
    .expect("Failed to register STORE_OPERATION_DURATION")
});

/// Subscription lifecycle operations counter
pub static SUBSCRIPTION_OPERATIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Discount application attempts counter
pub static DISCOUNT_APPLICATIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Usage ingestion counter
pub static USAGE_INGESTIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Alerts latched counter
pub static ALERTS_TRIGGERED_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Recommendations generated counter
pub static RECOMMENDATIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Error counter for alerting
pub static ERRORS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Initialize all metrics. Safe to call more than once.
pub fn init_metrics() {
    SUBSCRIPTION_OPERATIONS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "entitlement_subscription_operations_total",
                "Subscription lifecycle operations by action and outcome"
            ),
            &["operation", "outcome"]
        )
        .expect("Failed to register SUBSCRIPTION_OPERATIONS_TOTAL")
    });

    DISCOUNT_APPLICATIONS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "entitlement_discount_applications_total",
                "Discount application attempts by outcome"
            ),
            &["outcome"]
        )
        .expect("Failed to register DISCOUNT_APPLICATIONS_TOTAL")
    });

    USAGE_INGESTIONS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "entitlement_usage_ingestions_total",
                "Daily usage ingestions by outcome"
            ),
            &["outcome"]
        )
        .expect("Failed to register USAGE_INGESTIONS_TOTAL")
    });

    ALERTS_TRIGGERED_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "entitlement_alerts_triggered_total",
                "Usage alerts latched by kind"
            ),
            &["kind"]
        )
        .expect("Failed to register ALERTS_TRIGGERED_TOTAL")
    });

    RECOMMENDATIONS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "entitlement_recommendations_total",
                "Active recommendations produced by kind"
            ),
            &["kind"]
        )
        .expect("Failed to register RECOMMENDATIONS_TOTAL")
    });

    ERRORS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "entitlement_errors_total",
                "Total errors by kind for alerting"
            ),
            &["error_kind", "operation"]
        )
        .expect("Failed to register ERRORS_TOTAL")
    });

    // Force initialization of lazy statics
    let _ = &*STORE_OPERATION_DURATION;
}

/// Get metrics in Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// Record a lifecycle operation.
pub fn record_subscription_operation(operation: &str, outcome: &str) {
    if let Some(counter) = SUBSCRIPTION_OPERATIONS_TOTAL.get() {
        counter.with_label_values(&[operation, outcome]).inc();
    }
}

/// Record a discount application attempt.
pub fn record_discount_application(outcome: &str) {
    if let Some(counter) = DISCOUNT_APPLICATIONS_TOTAL.get() {
        counter.with_label_values(&[outcome]).inc();
    }
}

/// Record a usage ingestion.
pub fn record_usage_ingestion(outcome: &str) {
    if let Some(counter) = USAGE_INGESTIONS_TOTAL.get() {
        counter.with_label_values(&[outcome]).inc();
    }
}

/// Record an alert latch.
pub fn record_alert_triggered(kind: &str) {
    if let Some(counter) = ALERTS_TRIGGERED_TOTAL.get() {
        counter.with_label_values(&[kind]).inc();
    }
}

/// Record a generated recommendation.
pub fn record_recommendation(kind: &str) {
    if let Some(counter) = RECOMMENDATIONS_TOTAL.get() {
        counter.with_label_values(&[kind]).inc();
    }
}

/// Record an error for alerting.
pub fn record_error(error_kind: &str, operation: &str) {
    if let Some(counter) = ERRORS_TOTAL.get() {
        counter.with_label_values(&[error_kind, operation]).inc();
    }
}
