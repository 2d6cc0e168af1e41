//! Prometheus metrics for the isolation service.
//!
//! These mirror the in-process counters kept by the factory and managers so
//! that dashboards can scrape them without calling the stats endpoints:
//! - Manager metrics (active, created, cleaned up, expired)
//! - Limit and security metrics (resource limit hits, isolation violations)
//! - Delivery metrics (sent, failed, recovery queue drops)

mod helpers;

pub use helpers::{encode_metrics, DeliveryMetrics, ManagerLifecycleMetrics, SecurityMetrics};

use lazy_static::lazy_static;
use prometheus::{
    register_int_counter, register_int_counter_vec, register_int_gauge, IntCounter,
    IntCounterVec, IntGauge,
};

/// Prefix for all metrics
const METRIC_PREFIX: &str = "isolation";

lazy_static! {
    // ============================================================================
    // Manager Metrics
    // ============================================================================

    /// Number of currently active isolated managers
    pub static ref MANAGERS_ACTIVE: IntGauge = register_int_gauge!(
        format!("{}_managers_active", METRIC_PREFIX),
        "Number of active isolated managers"
    ).unwrap();

    /// Number of users holding at least one active manager
    pub static ref USERS_WITH_MANAGERS: IntGauge = register_int_gauge!(
        format!("{}_users_with_managers", METRIC_PREFIX),
        "Number of users with at least one active manager"
    ).unwrap();

    /// Total managers created
    pub static ref MANAGERS_CREATED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_managers_created_total", METRIC_PREFIX),
        "Total isolated managers created"
    ).unwrap();

    /// Total managers cleaned up, by reason
    pub static ref MANAGERS_CLEANED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_managers_cleaned_total", METRIC_PREFIX),
        "Total isolated managers cleaned up",
        &["reason"]
    ).unwrap();

    // ============================================================================
    // Limit & Security Metrics
    // ============================================================================

    /// Total manager creations rejected by the per-user limit
    pub static ref RESOURCE_LIMIT_HITS_TOTAL: IntCounter = register_int_counter!(
        format!("{}_resource_limit_hits_total", METRIC_PREFIX),
        "Total manager creations rejected by the per-user limit"
    ).unwrap();

    /// Total cross-user isolation violations detected
    pub static ref SECURITY_VIOLATIONS_TOTAL: IntCounter = register_int_counter!(
        format!("{}_security_violations_total", METRIC_PREFIX),
        "Total cross-user isolation violations detected"
    ).unwrap();

    // ============================================================================
    // Delivery Metrics
    // ============================================================================

    /// Total messages delivered to at least one connection
    pub static ref MESSAGES_SENT_TOTAL: IntCounter = register_int_counter!(
        format!("{}_messages_sent_total", METRIC_PREFIX),
        "Total messages delivered to at least one connection"
    ).unwrap();

    /// Total messages that could not be delivered, by reason
    pub static ref MESSAGES_FAILED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_messages_failed_total", METRIC_PREFIX),
        "Total messages moved to a recovery queue",
        &["reason"]
    ).unwrap();

    /// Total recovery queue entries dropped because the queue was full
    pub static ref RECOVERY_QUEUE_DROPPED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_recovery_queue_dropped_total", METRIC_PREFIX),
        "Total recovery queue entries dropped due to capacity"
    ).unwrap();
}
