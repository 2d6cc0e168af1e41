//! Manager factory: creates, looks up, counts and destroys isolated managers

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::config::{IsolationConfig, LifecycleConfig};
use crate::error::{IsolationError, IsolationResult};
use crate::metrics::{ManagerLifecycleMetrics, SecurityMetrics};
use crate::tasks::ExpirySweepTask;

use super::context::{IsolationKey, UserExecutionContext};
use super::lifecycle::LifecycleManager;
use super::manager::IsolatedManager;
use super::stats::{FactoryConfigSnapshot, FactoryMetrics, FactoryStats};

/// One registry slot
#[derive(Clone)]
pub struct ManagerEntry {
    pub manager: Arc<IsolatedManager>,
    pub created_at: DateTime<Utc>,
    pub user_id: String,
}

/// Registry and per-user counts, only ever mutated together
#[derive(Default)]
struct Registry {
    managers: HashMap<IsolationKey, ManagerEntry>,
    user_counts: HashMap<String, usize>,
}

impl Registry {
    fn remove(&mut self, key: &IsolationKey) -> Option<ManagerEntry> {
        let entry = self.managers.remove(key)?;
        if let Some(count) = self.user_counts.get_mut(&entry.user_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.user_counts.remove(&entry.user_id);
            }
        }
        Some(entry)
    }

    fn user_count(&self, user_id: &str) -> usize {
        self.user_counts.get(user_id).copied().unwrap_or(0)
    }
}

struct BackgroundCleanup {
    shutdown_tx: broadcast::Sender<()>,
    handle: JoinHandle<()>,
}

/// Why a manager left the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CleanupReason {
    Explicit,
    Expired,
    Shutdown,
}

impl CleanupReason {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Explicit => "explicit",
            Self::Expired => "expired",
            Self::Shutdown => "shutdown",
        }
    }
}

/// Single authority over isolated managers.
///
/// Built once by the composition root and shared as `Arc<ManagerFactory>`.
pub struct ManagerFactory {
    config: IsolationConfig,
    lifecycle_config: LifecycleConfig,
    registry: Mutex<Registry>,
    metrics: Arc<FactoryMetrics>,
    background: Mutex<Option<BackgroundCleanup>>,
    is_shut_down: AtomicBool,
}

impl ManagerFactory {
    pub fn new(config: IsolationConfig) -> Self {
        tracing::info!(
            max_managers_per_user = config.max_managers_per_user,
            connection_timeout_secs = config.connection_timeout_seconds,
            "Manager factory initialized"
        );

        Self {
            config,
            lifecycle_config: LifecycleConfig::default(),
            registry: Mutex::new(Registry::default()),
            metrics: Arc::new(FactoryMetrics::new()),
            background: Mutex::new(None),
            is_shut_down: AtomicBool::new(false),
        }
    }

    /// Health-check cadence and expiry for lifecycle managers built by
    /// `create_lifecycle_manager`
    pub fn with_lifecycle_config(mut self, lifecycle_config: LifecycleConfig) -> Self {
        self.lifecycle_config = lifecycle_config;
        self
    }

    pub fn config(&self) -> &IsolationConfig {
        &self.config
    }

    pub fn lifecycle_config(&self) -> &LifecycleConfig {
        &self.lifecycle_config
    }

    pub fn metrics(&self) -> &FactoryMetrics {
        &self.metrics
    }

    pub fn is_shut_down(&self) -> bool {
        self.is_shut_down.load(Ordering::Acquire)
    }

    /// Return the active manager for this context's isolation key, creating
    /// one if needed.
    ///
    /// The lookup and the insert happen under one lock, so concurrent calls for
    /// the same key always observe the same manager.
    pub async fn create_manager(
        &self,
        user_context: UserExecutionContext,
    ) -> IsolationResult<Arc<IsolatedManager>> {
        user_context.validate()?;
        let key = user_context.isolation_key();
        let user_id = user_context.user_id().to_string();

        let mut registry = self.registry.lock().await;

        if self.is_shut_down() {
            return Err(IsolationError::FactoryShutDown);
        }

        match registry.managers.get(&key) {
            Some(entry) if entry.manager.is_active() => return Ok(entry.manager.clone()),
            Some(_) => {
                // Deactivated behind the factory's back; drop the stale slot
                registry.remove(&key);
            }
            None => {}
        }

        let current = registry.user_count(&user_id);
        let max = self.config.max_managers_per_user;
        if current >= max {
            self.metrics.resource_limit_hit();
            SecurityMetrics::record_resource_limit_hit();
            tracing::warn!(
                user_id = %user_id,
                current = current,
                max = max,
                "Manager creation rejected by per-user limit"
            );
            return Err(IsolationError::ResourceLimit {
                user_id,
                current,
                max,
            });
        }

        let manager = Arc::new(IsolatedManager::for_factory(
            user_context,
            self.config.recovery_queue_size,
            self.metrics.clone(),
        ));
        registry.managers.insert(
            key.clone(),
            ManagerEntry {
                manager: manager.clone(),
                created_at: manager.created_at(),
                user_id: user_id.clone(),
            },
        );
        *registry.user_counts.entry(user_id.clone()).or_insert(0) += 1;

        self.metrics.manager_created();
        ManagerLifecycleMetrics::record_created();
        self.sync_gauges(&registry);

        tracing::info!(
            isolation_key = %key,
            user_id = %user_id,
            user_managers = current + 1,
            total_managers = registry.managers.len(),
            "Isolated manager created"
        );

        Ok(manager)
    }

    /// Create (or reuse) the manager for this context and attach a lifecycle
    /// manager whose periodic expiry runs on the configured cadence.
    pub async fn create_lifecycle_manager(
        &self,
        user_context: UserExecutionContext,
    ) -> IsolationResult<Arc<LifecycleManager>> {
        let manager = self.create_manager(user_context).await?;
        let lifecycle = Arc::new(LifecycleManager::new(manager));
        lifecycle
            .spawn_auto_cleanup(
                self.lifecycle_config.health_check_interval(),
                self.lifecycle_config.expiry(),
            )
            .await;

        tracing::debug!(
            isolation_key = %lifecycle.manager().isolation_key(),
            expiry_minutes = self.lifecycle_config.expiry_minutes,
            "Lifecycle tracking started"
        );

        Ok(lifecycle)
    }

    /// Look up an active manager. Never creates.
    pub async fn get_manager(&self, key: &IsolationKey) -> Option<Arc<IsolatedManager>> {
        self.registry
            .lock()
            .await
            .managers
            .get(key)
            .filter(|entry| entry.manager.is_active())
            .map(|entry| entry.manager.clone())
    }

    /// Deactivate and remove a manager. Returns false for unknown keys.
    pub async fn cleanup_manager(&self, key: &IsolationKey) -> bool {
        self.cleanup_if(key, CleanupReason::Explicit, |_| true)
            .await
    }

    /// Whether the user has room for another manager
    pub async fn enforce_resource_limits(&self, user_id: &str) -> bool {
        self.registry.lock().await.user_count(user_id) < self.config.max_managers_per_user
    }

    pub async fn get_user_manager_count(&self, user_id: &str) -> usize {
        self.registry.lock().await.user_count(user_id)
    }

    pub async fn active_manager_count(&self) -> usize {
        self.registry.lock().await.managers.len()
    }

    /// Read-only snapshot of metrics, configuration and registry shape
    pub async fn get_factory_stats(&self) -> FactoryStats {
        let (active_managers, user_distribution, oldest) = {
            let registry = self.registry.lock().await;
            let oldest = registry
                .managers
                .values()
                .map(|entry| entry.created_at)
                .min();
            (
                registry.managers.len(),
                registry.user_counts.clone(),
                oldest,
            )
        };

        let background_cleanup_running = self
            .background
            .lock()
            .await
            .as_ref()
            .map(|bg| !bg.handle.is_finished())
            .unwrap_or(false);

        FactoryStats {
            metrics: self.metrics.snapshot(),
            config: FactoryConfigSnapshot {
                max_managers_per_user: self.config.max_managers_per_user,
                connection_timeout_seconds: self.config.connection_timeout_seconds,
                cleanup_interval_seconds: self.config.cleanup_interval_seconds,
                recovery_queue_size: self.config.recovery_queue_size,
            },
            active_managers,
            user_distribution,
            oldest_manager_age_seconds: oldest
                .map(|created_at| Utc::now().signed_duration_since(created_at).num_seconds()),
            background_cleanup_running,
            is_shut_down: self.is_shut_down(),
        }
    }

    /// One expiry pass: clean up every manager idle for longer than the
    /// connection timeout, or already deactivated.
    ///
    /// Returns the number of managers removed.
    pub async fn cleanup_expired_managers(&self) -> usize {
        let idle_limit = chrono::Duration::from_std(self.config.connection_timeout())
            .unwrap_or(chrono::Duration::MAX);
        let is_expired = move |manager: &IsolatedManager| {
            !manager.is_active()
                || Utc::now().signed_duration_since(manager.last_activity()) > idle_limit
        };

        let candidates: Vec<IsolationKey> = {
            let registry = self.registry.lock().await;
            registry
                .managers
                .iter()
                .filter(|(_, entry)| is_expired(&*entry.manager))
                .map(|(key, _)| key.clone())
                .collect()
        };

        let mut removed = 0;
        for key in candidates {
            // Re-checked under the lock: activity may have happened meanwhile
            if self
                .cleanup_if(&key, CleanupReason::Expired, is_expired)
                .await
            {
                self.metrics.manager_expired();
                removed += 1;
            }
        }

        self.metrics.expiry_sweep();
        if removed > 0 {
            tracing::info!(
                removed = removed,
                timeout_secs = self.config.connection_timeout_seconds,
                "Expired isolated managers cleaned up"
            );
        }

        removed
    }

    /// Start the periodic expiry sweep. Returns false if it is already
    /// running or the factory has been shut down.
    pub async fn start_background_cleanup(self: &Arc<Self>) -> bool {
        let mut background = self.background.lock().await;
        if self.is_shut_down() {
            return false;
        }
        if let Some(ref bg) = *background {
            if !bg.handle.is_finished() {
                return false;
            }
        }

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let task = ExpirySweepTask::new(
            Arc::downgrade(self),
            self.config.cleanup_interval(),
            shutdown_rx,
        );
        let handle = tokio::spawn(async move {
            task.run().await;
        });

        *background = Some(BackgroundCleanup {
            shutdown_tx,
            handle,
        });
        true
    }

    /// Stop the sweep and clean up every manager. Idempotent.
    ///
    /// Returns the number of managers cleaned up by this call.
    pub async fn shutdown(&self) -> usize {
        let first = !self.is_shut_down.swap(true, Ordering::AcqRel);

        if let Some(bg) = self.background.lock().await.take() {
            let _ = bg.shutdown_tx.send(());
            let mut handle = bg.handle;
            if timeout(self.config.shutdown_timeout(), &mut handle)
                .await
                .is_err()
            {
                tracing::warn!("Expiry sweep did not stop in time, aborting");
                handle.abort();
            }
        }

        let entries: Vec<(IsolationKey, ManagerEntry)> = {
            let mut registry = self.registry.lock().await;
            registry.user_counts.clear();
            let entries = registry.managers.drain().collect();
            self.sync_gauges(&registry);
            entries
        };

        let cleaned = entries.len();
        for (_, entry) in entries {
            self.finish_cleanup(&entry, CleanupReason::Shutdown).await;
        }

        if first {
            tracing::info!(cleaned = cleaned, "Manager factory shut down");
        }

        cleaned
    }

    async fn cleanup_if<F>(&self, key: &IsolationKey, reason: CleanupReason, predicate: F) -> bool
    where
        F: Fn(&IsolatedManager) -> bool,
    {
        let entry = {
            let mut registry = self.registry.lock().await;
            let matches = registry
                .managers
                .get(key)
                .map(|entry| predicate(&*entry.manager))
                .unwrap_or(false);
            if !matches {
                return false;
            }
            let entry = registry.remove(key);
            self.sync_gauges(&registry);
            entry
        };

        match entry {
            Some(entry) => {
                self.finish_cleanup(&entry, reason).await;
                true
            }
            None => false,
        }
    }

    /// Runs outside the registry lock so slow connection teardown never
    /// blocks other users.
    async fn finish_cleanup(&self, entry: &ManagerEntry, reason: CleanupReason) {
        entry.manager.cleanup_all_connections().await;
        self.metrics.manager_cleaned_up();
        ManagerLifecycleMetrics::record_cleaned(reason.as_str());

        tracing::info!(
            isolation_key = %entry.manager.isolation_key(),
            user_id = %entry.user_id,
            reason = reason.as_str(),
            "Isolated manager removed"
        );
    }

    fn sync_gauges(&self, registry: &Registry) {
        let managers = registry.managers.len();
        let users = registry.user_counts.len();
        self.metrics.set_active(managers, users);
        ManagerLifecycleMetrics::set_active(managers, users);
    }
}
