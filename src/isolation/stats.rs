//! Counters, snapshots and recovery queue entries

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use super::context::UserExecutionContext;

/// Per-manager counters. Mutated only by the owning manager.
#[derive(Debug)]
pub struct ManagerMetrics {
    connections_managed: AtomicUsize,
    messages_sent_total: AtomicU64,
    messages_failed_total: AtomicU64,
    security_violations: AtomicU64,
    transport_errors: AtomicU64,
    recovery_dropped: AtomicU64,
    cleanup_scheduled: AtomicBool,
    created_at: DateTime<Utc>,
    /// Unix millis; atomic for lock-free updates
    last_activity: AtomicI64,
}

impl ManagerMetrics {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            connections_managed: AtomicUsize::new(0),
            messages_sent_total: AtomicU64::new(0),
            messages_failed_total: AtomicU64::new(0),
            security_violations: AtomicU64::new(0),
            transport_errors: AtomicU64::new(0),
            recovery_dropped: AtomicU64::new(0),
            cleanup_scheduled: AtomicBool::new(false),
            created_at: now,
            last_activity: AtomicI64::new(now.timestamp_millis()),
        }
    }

    pub(crate) fn connection_added(&self) {
        self.connections_managed.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    pub(crate) fn connection_removed(&self) {
        // Removal is only recorded for connections that were counted on add
        let _ = self
            .connections_managed
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
        self.touch();
    }

    pub(crate) fn message_sent(&self) {
        self.messages_sent_total.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    pub(crate) fn message_failed(&self) {
        self.messages_failed_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn security_violation(&self) {
        self.security_violations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn transport_error(&self) {
        self.transport_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn recovery_dropped(&self) {
        self.recovery_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn schedule_cleanup(&self) {
        self.cleanup_scheduled.store(true, Ordering::Relaxed);
    }

    pub(crate) fn reset_connections(&self) {
        self.connections_managed.store(0, Ordering::Relaxed);
    }

    pub(crate) fn touch(&self) {
        self.last_activity
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.last_activity.load(Ordering::Relaxed))
            .unwrap_or_else(Utc::now)
    }

    pub fn connections_managed(&self) -> usize {
        self.connections_managed.load(Ordering::Relaxed)
    }

    pub fn transport_errors(&self) -> u64 {
        self.transport_errors.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> ManagerMetricsSnapshot {
        ManagerMetricsSnapshot {
            connections_managed: self.connections_managed(),
            messages_sent_total: self.messages_sent_total.load(Ordering::Relaxed),
            messages_failed_total: self.messages_failed_total.load(Ordering::Relaxed),
            security_violations: self.security_violations.load(Ordering::Relaxed),
            transport_errors: self.transport_errors(),
            recovery_dropped: self.recovery_dropped.load(Ordering::Relaxed),
            cleanup_scheduled: self.cleanup_scheduled.load(Ordering::Relaxed),
            created_at: self.created_at,
            last_activity: self.last_activity(),
        }
    }
}

impl Default for ManagerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ManagerMetricsSnapshot {
    pub connections_managed: usize,
    pub messages_sent_total: u64,
    pub messages_failed_total: u64,
    pub security_violations: u64,
    pub transport_errors: u64,
    pub recovery_dropped: u64,
    pub cleanup_scheduled: bool,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

/// Factory-wide counters
#[derive(Debug, Default)]
pub struct FactoryMetrics {
    managers_created: AtomicU64,
    managers_active: AtomicUsize,
    managers_cleaned_up: AtomicU64,
    managers_expired: AtomicU64,
    users_with_active_managers: AtomicUsize,
    resource_limit_hits: AtomicU64,
    security_violations_detected: AtomicU64,
    expiry_sweeps: AtomicU64,
}

impl FactoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn manager_created(&self) {
        self.managers_created.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn manager_cleaned_up(&self) {
        self.managers_cleaned_up.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn manager_expired(&self) {
        self.managers_expired.fetch_add(1, Ordering::Relaxed);
    }

    /// Gauges are written while the registry lock is held
    pub(crate) fn set_active(&self, managers: usize, users: usize) {
        self.managers_active.store(managers, Ordering::Relaxed);
        self.users_with_active_managers.store(users, Ordering::Relaxed);
    }

    pub(crate) fn resource_limit_hit(&self) {
        self.resource_limit_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn security_violation(&self) {
        self.security_violations_detected
            .fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn expiry_sweep(&self) {
        self.expiry_sweeps.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> FactoryMetricsSnapshot {
        FactoryMetricsSnapshot {
            managers_created: self.managers_created.load(Ordering::Relaxed),
            managers_active: self.managers_active.load(Ordering::Relaxed),
            managers_cleaned_up: self.managers_cleaned_up.load(Ordering::Relaxed),
            managers_expired: self.managers_expired.load(Ordering::Relaxed),
            users_with_active_managers: self.users_with_active_managers.load(Ordering::Relaxed),
            resource_limit_hits: self.resource_limit_hits.load(Ordering::Relaxed),
            security_violations_detected: self
                .security_violations_detected
                .load(Ordering::Relaxed),
            expiry_sweeps: self.expiry_sweeps.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FactoryMetricsSnapshot {
    pub managers_created: u64,
    pub managers_active: usize,
    pub managers_cleaned_up: u64,
    pub managers_expired: u64,
    pub users_with_active_managers: usize,
    pub resource_limit_hits: u64,
    pub security_violations_detected: u64,
    pub expiry_sweeps: u64,
}

/// Why a message ended up in the recovery queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum FailureReason {
    NoConnections,
    TransportError(String),
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoConnections => "no_connections",
            Self::TransportError(_) => "transport_error",
        }
    }
}

/// A message that could not be delivered. Never re-sent automatically.
#[derive(Debug, Clone, Serialize)]
pub struct RecoveryQueueEntry {
    pub message: Value,
    pub failure_reason: FailureReason,
    pub failed_at: DateTime<Utc>,
}

impl RecoveryQueueEntry {
    pub fn new(message: Value, failure_reason: FailureReason) -> Self {
        Self {
            message,
            failure_reason,
            failed_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionSummary {
    pub total: usize,
    pub open: usize,
    pub connection_ids: Vec<String>,
}

/// Snapshot returned by `IsolatedManager::get_manager_stats`
#[derive(Debug, Clone, Serialize)]
pub struct ManagerStats {
    pub manager_id: String,
    pub isolation_key: String,
    pub user_context: UserExecutionContext,
    pub is_active: bool,
    pub metrics: ManagerMetricsSnapshot,
    pub connections: ConnectionSummary,
    pub recovery_queue_size: usize,
    pub error_count: u64,
}

/// Configuration echoed back in factory stats
#[derive(Debug, Clone, Serialize)]
pub struct FactoryConfigSnapshot {
    pub max_managers_per_user: usize,
    pub connection_timeout_seconds: u64,
    pub cleanup_interval_seconds: u64,
    pub recovery_queue_size: usize,
}

/// Snapshot returned by `ManagerFactory::get_factory_stats`
#[derive(Debug, Clone, Serialize)]
pub struct FactoryStats {
    pub metrics: FactoryMetricsSnapshot,
    pub config: FactoryConfigSnapshot,
    pub active_managers: usize,
    pub user_distribution: HashMap<String, usize>,
    pub oldest_manager_age_seconds: Option<i64>,
    pub background_cleanup_running: bool,
    pub is_shut_down: bool,
}
