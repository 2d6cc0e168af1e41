//! Per-connection health and expiry tracking for one isolated manager

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::error::{IsolationError, IsolationResult};

use super::connection::Connection;
use super::context::UserExecutionContext;
use super::manager::IsolatedManager;

/// Default idle time before a tracked connection is expired
pub const DEFAULT_EXPIRY_MINUTES: u64 = 30;

pub fn default_expiry() -> Duration {
    Duration::from_secs(DEFAULT_EXPIRY_MINUTES * 60)
}

/// Tracks last-health timestamps for the connections of one manager.
///
/// Removal always goes through `IsolatedManager::remove_connection`; this type
/// never touches the manager's connection table directly.
pub struct LifecycleManager {
    user_context: UserExecutionContext,
    manager: Arc<IsolatedManager>,
    /// connection_id -> last successful health check
    health: DashMap<String, DateTime<Utc>>,
    is_active: AtomicBool,
    cleanup_task: Mutex<Option<JoinHandle<()>>>,
}

impl LifecycleManager {
    pub fn new(manager: Arc<IsolatedManager>) -> Self {
        Self {
            user_context: manager.user_context().clone(),
            manager,
            health: DashMap::new(),
            is_active: AtomicBool::new(true),
            cleanup_task: Mutex::new(None),
        }
    }

    pub fn user_context(&self) -> &UserExecutionContext {
        &self.user_context
    }

    pub fn manager(&self) -> &Arc<IsolatedManager> {
        &self.manager
    }

    pub fn is_active(&self) -> bool {
        self.is_active.load(Ordering::Acquire)
    }

    pub fn tracked_connections(&self) -> Vec<String> {
        self.health.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn last_health_check(&self, connection_id: &str) -> Option<DateTime<Utc>> {
        self.health.get(connection_id).map(|ts| *ts)
    }

    /// Start tracking a connection. The owner check runs first.
    pub fn register_connection(&self, connection: &Connection) -> IsolationResult<()> {
        if connection.user_id() != self.user_context.user_id() {
            self.manager
                .record_violation(connection.user_id(), connection.connection_id());
            return Err(IsolationError::IsolationViolation {
                manager_user: self.user_context.user_id().to_string(),
                connection_user: connection.user_id().to_string(),
            });
        }

        if !self.is_active() {
            return Err(IsolationError::InactiveManager(
                self.user_context.user_id().to_string(),
            ));
        }

        self.health
            .insert(connection.connection_id().to_string(), Utc::now());

        tracing::debug!(
            user_id = %self.user_context.user_id(),
            connection_id = %connection.connection_id(),
            "Connection registered for lifecycle tracking"
        );

        Ok(())
    }

    /// Refresh a connection's timestamp if it is still held by the manager
    /// and its transport is open.
    pub async fn health_check_connection(&self, connection_id: &str) -> bool {
        if !self.health.contains_key(connection_id) {
            return false;
        }

        let healthy = match self.manager.get_connection(connection_id).await {
            Some(conn) => conn.is_open(),
            None => false,
        };

        if healthy {
            if let Some(mut ts) = self.health.get_mut(connection_id) {
                *ts = Utc::now();
            }
        } else {
            tracing::debug!(
                user_id = %self.user_context.user_id(),
                connection_id = %connection_id,
                "Health check failed"
            );
        }

        healthy
    }

    /// Remove connections whose last health check is older than `expiry`.
    ///
    /// Returns the number of connections cleaned up.
    pub async fn auto_cleanup_expired(&self, expiry: Duration) -> usize {
        let now = Utc::now();
        let expiry = chrono::Duration::from_std(expiry).unwrap_or(chrono::Duration::MAX);

        let expired: Vec<String> = self
            .health
            .iter()
            .filter(|entry| now.signed_duration_since(*entry.value()) > expiry)
            .map(|entry| entry.key().clone())
            .collect();

        for connection_id in &expired {
            self.manager.remove_connection(connection_id).await;
            self.health.remove(connection_id);
            tracing::info!(
                user_id = %self.user_context.user_id(),
                connection_id = %connection_id,
                "Removing expired connection"
            );
        }

        expired.len()
    }

    /// Run `auto_cleanup_expired` every `interval` until this lifecycle
    /// manager is force-cleaned. Replaces any previously started task.
    pub async fn spawn_auto_cleanup(self: &Arc<Self>, interval: Duration, expiry: Duration) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            // Skip immediate first tick
            timer.tick().await;

            loop {
                timer.tick().await;
                let Some(lifecycle) = weak.upgrade() else {
                    break;
                };
                if !lifecycle.is_active() {
                    break;
                }
                let removed = lifecycle.auto_cleanup_expired(expiry).await;
                if removed > 0 {
                    tracing::info!(
                        user_id = %lifecycle.user_context.user_id(),
                        removed = removed,
                        "Lifecycle sweep removed expired connections"
                    );
                }
            }
        });

        if let Some(previous) = self.cleanup_task.lock().await.replace(handle) {
            previous.abort();
        }
    }

    /// Remove every tracked connection from the manager and stop tracking.
    /// Terminal.
    pub async fn force_cleanup_all(&self) -> usize {
        self.is_active.store(false, Ordering::Release);

        if let Some(task) = self.cleanup_task.lock().await.take() {
            task.abort();
        }

        let tracked = self.tracked_connections();
        for connection_id in &tracked {
            self.manager.remove_connection(connection_id).await;
        }
        self.health.clear();

        tracing::info!(
            user_id = %self.user_context.user_id(),
            removed = tracked.len(),
            "Lifecycle manager force-cleaned"
        );

        tracked.len()
    }
}
