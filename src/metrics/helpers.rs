//! Metrics helper structs for convenient metric recording

use prometheus::{Encoder, TextEncoder};

use super::{
    MANAGERS_ACTIVE, MANAGERS_CLEANED_TOTAL, MANAGERS_CREATED_TOTAL, MESSAGES_FAILED_TOTAL,
    MESSAGES_SENT_TOTAL, RECOVERY_QUEUE_DROPPED_TOTAL, RESOURCE_LIMIT_HITS_TOTAL,
    SECURITY_VIOLATIONS_TOTAL, USERS_WITH_MANAGERS,
};

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer).unwrap_or_default())
}

/// Helper struct for recording manager lifecycle metrics
pub struct ManagerLifecycleMetrics;

impl ManagerLifecycleMetrics {
    pub fn record_created() {
        MANAGERS_CREATED_TOTAL.inc();
    }

    /// Record a cleanup; `reason` is "explicit", "expired" or "shutdown"
    pub fn record_cleaned(reason: &str) {
        MANAGERS_CLEANED_TOTAL.with_label_values(&[reason]).inc();
    }

    /// Sync the gauges with the factory registry
    pub fn set_active(managers: usize, users: usize) {
        MANAGERS_ACTIVE.set(managers as i64);
        USERS_WITH_MANAGERS.set(users as i64);
    }
}

/// Helper struct for recording limit and isolation metrics
pub struct SecurityMetrics;

impl SecurityMetrics {
    pub fn record_resource_limit_hit() {
        RESOURCE_LIMIT_HITS_TOTAL.inc();
    }

    pub fn record_violation() {
        SECURITY_VIOLATIONS_TOTAL.inc();
    }
}

/// Helper struct for recording message delivery metrics
pub struct DeliveryMetrics;

impl DeliveryMetrics {
    pub fn record_sent() {
        MESSAGES_SENT_TOTAL.inc();
    }

    pub fn record_failed(reason: &str) {
        MESSAGES_FAILED_TOTAL.with_label_values(&[reason]).inc();
    }

    pub fn record_recovery_dropped() {
        RECOVERY_QUEUE_DROPPED_TOTAL.inc();
    }
}
