//! Isolated manager: the connection set of exactly one user scope

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{Mutex, RwLock};
use tokio::time::timeout;
use uuid::Uuid;

use crate::error::{IsolationError, IsolationResult};
use crate::metrics::{DeliveryMetrics, SecurityMetrics};

use super::connection::Connection;
use super::context::{IsolationKey, UserExecutionContext};
use super::stats::{
    ConnectionSummary, FactoryMetrics, FailureReason, ManagerMetrics, ManagerStats,
    RecoveryQueueEntry,
};

/// Timeout for a single transport send
const SEND_TIMEOUT_MS: u64 = 5000;

/// Default recovery queue capacity for standalone managers
pub const DEFAULT_RECOVERY_QUEUE_SIZE: usize = 100;

/// Outcome of a best-effort delivery
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeliveryResult {
    /// Connections that accepted the message
    pub delivered_to: usize,
    /// Live connections whose send failed or timed out
    pub failed: usize,
    /// Whether the message was moved to the recovery queue
    pub queued: bool,
}

impl DeliveryResult {
    pub fn is_delivered(&self) -> bool {
        self.delivered_to > 0
    }
}

/// Connection map and id set, always mutated together under one lock
#[derive(Default)]
struct ConnectionTable {
    connections: HashMap<String, Connection>,
    connection_ids: HashSet<String>,
}

/// Owns every connection for one isolation scope.
///
/// Each connection must belong to the manager's user. Once
/// `cleanup_all_connections` has run the manager is inactive for good.
pub struct IsolatedManager {
    manager_id: Uuid,
    user_context: UserExecutionContext,
    isolation_key: IsolationKey,
    is_active: AtomicBool,
    table: RwLock<ConnectionTable>,
    recovery_queue: Mutex<VecDeque<RecoveryQueueEntry>>,
    recovery_queue_size: usize,
    metrics: ManagerMetrics,
    /// Set when built by a factory so violations show up in factory stats
    factory_metrics: Option<Arc<FactoryMetrics>>,
}

impl IsolatedManager {
    pub fn new(user_context: UserExecutionContext) -> Self {
        Self::with_queue_size(user_context, DEFAULT_RECOVERY_QUEUE_SIZE)
    }

    pub fn with_queue_size(user_context: UserExecutionContext, recovery_queue_size: usize) -> Self {
        let isolation_key = user_context.isolation_key();
        Self {
            manager_id: Uuid::new_v4(),
            user_context,
            isolation_key,
            is_active: AtomicBool::new(true),
            table: RwLock::new(ConnectionTable::default()),
            recovery_queue: Mutex::new(VecDeque::new()),
            recovery_queue_size: recovery_queue_size.max(1),
            metrics: ManagerMetrics::new(),
            factory_metrics: None,
        }
    }

    pub(crate) fn for_factory(
        user_context: UserExecutionContext,
        recovery_queue_size: usize,
        factory_metrics: Arc<FactoryMetrics>,
    ) -> Self {
        Self {
            factory_metrics: Some(factory_metrics),
            ..Self::with_queue_size(user_context, recovery_queue_size)
        }
    }

    pub fn manager_id(&self) -> Uuid {
        self.manager_id
    }

    pub fn user_context(&self) -> &UserExecutionContext {
        &self.user_context
    }

    pub fn user_id(&self) -> &str {
        self.user_context.user_id()
    }

    pub fn isolation_key(&self) -> &IsolationKey {
        &self.isolation_key
    }

    pub fn is_active(&self) -> bool {
        self.is_active.load(Ordering::Acquire)
    }

    pub fn metrics(&self) -> &ManagerMetrics {
        &self.metrics
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.metrics.created_at()
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        self.metrics.last_activity()
    }

    /// Attach a connection to this manager.
    ///
    /// The owner check runs before anything else; a rejected connection is
    /// never stored.
    pub async fn add_connection(&self, connection: Connection) -> IsolationResult<()> {
        if connection.user_id() != self.user_id() {
            self.record_violation(connection.user_id(), connection.connection_id());
            return Err(IsolationError::IsolationViolation {
                manager_user: self.user_id().to_string(),
                connection_user: connection.user_id().to_string(),
            });
        }

        let mut table = self.table.write().await;

        // Checked under the lock so a concurrent cleanup cannot miss this connection
        if !self.is_active() {
            return Err(IsolationError::InactiveManager(self.user_id().to_string()));
        }

        let connection_id = connection.connection_id().to_string();
        let replaced = table
            .connections
            .insert(connection_id.clone(), connection)
            .is_some();
        table.connection_ids.insert(connection_id.clone());

        if replaced {
            self.metrics.touch();
        } else {
            self.metrics.connection_added();
        }

        tracing::info!(
            isolation_key = %self.isolation_key,
            connection_id = %connection_id,
            user_id = %self.user_id(),
            total = table.connections.len(),
            "Connection added to isolated manager"
        );

        Ok(())
    }

    /// Detach a connection. Unknown ids are a no-op.
    ///
    /// Returns whether a connection was removed.
    pub async fn remove_connection(&self, connection_id: &str) -> bool {
        let mut table = self.table.write().await;

        let owner = match table.connections.get(connection_id) {
            Some(conn) => conn.user_id().to_string(),
            None => return false,
        };

        if owner != self.user_id() {
            drop(table);
            self.record_violation(&owner, connection_id);
            tracing::error!(
                isolation_key = %self.isolation_key,
                connection_id = %connection_id,
                "Refusing to remove connection owned by another user"
            );
            return false;
        }

        table.connections.remove(connection_id);
        table.connection_ids.remove(connection_id);
        self.metrics.connection_removed();

        tracing::info!(
            isolation_key = %self.isolation_key,
            connection_id = %connection_id,
            remaining = table.connections.len(),
            "Connection removed from isolated manager"
        );

        true
    }

    pub async fn get_connection(&self, connection_id: &str) -> Option<Connection> {
        self.table.read().await.connections.get(connection_id).cloned()
    }

    /// Copy of the known connection ids
    pub async fn get_user_connections(&self) -> HashSet<String> {
        self.table.read().await.connection_ids.clone()
    }

    pub async fn connection_count(&self) -> usize {
        self.table.read().await.connections.len()
    }

    /// True only for this manager's own user while it holds a connection
    pub async fn is_connection_active(&self, user_id: &str) -> bool {
        if user_id != self.user_id() {
            tracing::warn!(
                isolation_key = %self.isolation_key,
                requested_user = %user_id,
                "Connection status requested for a different user"
            );
            return false;
        }

        !self.table.read().await.connection_ids.is_empty()
    }

    /// Deliver a message to every open connection.
    ///
    /// Never fails: when nothing accepts the message it is moved to the
    /// recovery queue and counted.
    pub async fn send_to_user(&self, message: Value) -> DeliveryResult {
        if !self.is_active() {
            self.metrics.message_failed();
            DeliveryMetrics::record_failed("inactive");
            tracing::debug!(
                isolation_key = %self.isolation_key,
                "Dropping message for inactive manager"
            );
            return DeliveryResult::default();
        }

        let live: Vec<Connection> = {
            let table = self.table.read().await;
            table
                .connections
                .values()
                .filter(|conn| conn.is_open())
                .cloned()
                .collect()
        };

        if live.is_empty() {
            self.enqueue_failed(message, FailureReason::NoConnections).await;
            return DeliveryResult {
                queued: true,
                ..Default::default()
            };
        }

        let send_timeout = Duration::from_millis(SEND_TIMEOUT_MS);
        let results = join_all(live.iter().map(|conn| {
            let message = &message;
            async move {
                match timeout(send_timeout, conn.send(message)).await {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => Err(e.to_string()),
                    Err(_) => Err(format!("send timed out after {}ms", SEND_TIMEOUT_MS)),
                }
            }
        }))
        .await;

        let mut result = DeliveryResult::default();
        let mut last_error = None;
        for (conn, outcome) in live.iter().zip(results) {
            match outcome {
                Ok(()) => result.delivered_to += 1,
                Err(e) => {
                    result.failed += 1;
                    self.metrics.transport_error();
                    tracing::debug!(
                        isolation_key = %self.isolation_key,
                        connection_id = %conn.connection_id(),
                        error = %e,
                        "Failed to send message to connection"
                    );
                    last_error = Some(e);
                }
            }
        }

        if result.is_delivered() {
            self.metrics.message_sent();
            DeliveryMetrics::record_sent();
        } else {
            let detail = last_error.unwrap_or_else(|| "unknown".to_string());
            self.enqueue_failed(message, FailureReason::TransportError(detail))
                .await;
            result.queued = true;
        }

        result
    }

    /// Send an event flagged as critical, wrapped with the user context
    pub async fn emit_critical_event(
        &self,
        event_type: &str,
        data: Value,
    ) -> IsolationResult<DeliveryResult> {
        if event_type.trim().is_empty() {
            return Err(IsolationError::validation("event_type must not be empty"));
        }

        let event = json!({
            "type": event_type,
            "data": data,
            "critical": true,
            "timestamp": Utc::now().to_rfc3339(),
            "user_context": self.user_context,
        });

        let result = self.send_to_user(event).await;
        if !result.is_delivered() {
            tracing::warn!(
                isolation_key = %self.isolation_key,
                event_type = %event_type,
                "Critical event could not be delivered"
            );
        }

        Ok(result)
    }

    /// Remove every connection and deactivate the manager. Idempotent.
    pub async fn cleanup_all_connections(&self) {
        let was_active = self.is_active.swap(false, Ordering::AcqRel);

        let removed = {
            let mut table = self.table.write().await;
            let removed = table.connections.len();
            table.connections.clear();
            table.connection_ids.clear();
            removed
        };
        self.metrics.reset_connections();
        self.recovery_queue.lock().await.clear();
        self.metrics.schedule_cleanup();

        if was_active {
            tracing::info!(
                isolation_key = %self.isolation_key,
                user_id = %self.user_id(),
                removed_connections = removed,
                "Isolated manager cleaned up"
            );
        }
    }

    /// Snapshot of the recovery queue
    pub async fn recovery_queue(&self) -> Vec<RecoveryQueueEntry> {
        self.recovery_queue.lock().await.iter().cloned().collect()
    }

    /// Take every queued entry, leaving the queue empty
    pub async fn drain_recovery_queue(&self) -> Vec<RecoveryQueueEntry> {
        self.recovery_queue.lock().await.drain(..).collect()
    }

    pub async fn get_manager_stats(&self) -> ManagerStats {
        let connections = {
            let table = self.table.read().await;
            let mut connection_ids: Vec<String> = table.connection_ids.iter().cloned().collect();
            connection_ids.sort();
            ConnectionSummary {
                total: table.connections.len(),
                open: table.connections.values().filter(|c| c.is_open()).count(),
                connection_ids,
            }
        };
        let recovery_queue_size = self.recovery_queue.lock().await.len();

        ManagerStats {
            manager_id: self.manager_id.to_string(),
            isolation_key: self.isolation_key.to_string(),
            user_context: self.user_context.clone(),
            is_active: self.is_active(),
            metrics: self.metrics.snapshot(),
            connections,
            recovery_queue_size,
            error_count: self.metrics.transport_errors(),
        }
    }

    async fn enqueue_failed(&self, message: Value, reason: FailureReason) {
        self.metrics.message_failed();
        DeliveryMetrics::record_failed(reason.as_str());

        let mut queue = self.recovery_queue.lock().await;
        // Full queue drops its oldest entry
        if queue.len() >= self.recovery_queue_size && queue.pop_front().is_some() {
            self.metrics.recovery_dropped();
            DeliveryMetrics::record_recovery_dropped();
        }

        tracing::debug!(
            isolation_key = %self.isolation_key,
            reason = %reason.as_str(),
            queue_size = queue.len() + 1,
            "Message moved to recovery queue"
        );

        queue.push_back(RecoveryQueueEntry::new(message, reason));
    }

    pub(crate) fn record_violation(&self, offending_user: &str, connection_id: &str) {
        self.metrics.security_violation();
        if let Some(ref factory_metrics) = self.factory_metrics {
            factory_metrics.security_violation();
        }
        SecurityMetrics::record_violation();

        tracing::warn!(
            isolation_key = %self.isolation_key,
            manager_user = %self.user_id(),
            offending_user = %offending_user,
            connection_id = %connection_id,
            "Isolation violation blocked"
        );
    }
}

impl fmt::Debug for IsolatedManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IsolatedManager")
            .field("manager_id", &self.manager_id)
            .field("isolation_key", &self.isolation_key)
            .field("is_active", &self.is_active())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isolation::connection::{ChannelTransport, Transport, TransportError};
    use async_trait::async_trait;
    use tokio::sync::mpsc;

    struct FailingTransport;

    #[async_trait]
    impl Transport for FailingTransport {
        fn is_open(&self) -> bool {
            true
        }

        async fn send(&self, _message: &Value) -> Result<(), TransportError> {
            Err(TransportError("broken pipe".to_string()))
        }
    }

    fn context(user_id: &str, connection_id: &str) -> UserExecutionContext {
        UserExecutionContext::new(user_id, "thread-1", "run-1")
            .unwrap()
            .with_websocket_connection_id(connection_id)
            .unwrap()
    }

    fn channel_connection(id: &str, user_id: &str) -> (Connection, mpsc::Receiver<Value>) {
        let (transport, rx) = ChannelTransport::channel(16);
        (Connection::new(id, user_id, Arc::new(transport)), rx)
    }

    #[tokio::test]
    async fn test_add_and_send() {
        let manager = IsolatedManager::new(context("u1", "c1"));
        let (conn, mut rx) = channel_connection("c1", "u1");

        manager.add_connection(conn).await.unwrap();
        let result = manager.send_to_user(json!({"type": "x"})).await;

        assert_eq!(result.delivered_to, 1);
        assert_eq!(rx.recv().await.unwrap()["type"], "x");

        let stats = manager.get_manager_stats().await;
        assert_eq!(stats.connections.total, 1);
        assert_eq!(stats.metrics.messages_sent_total, 1);
    }

    #[tokio::test]
    async fn test_cross_user_connection_rejected_without_mutation() {
        let manager = IsolatedManager::new(context("victim", "c1"));
        let (conn, _rx) = channel_connection("c1", "attacker");

        let err = manager.add_connection(conn).await.unwrap_err();

        assert!(err.is_security_violation());
        assert!(manager.get_user_connections().await.is_empty());
        assert_eq!(manager.connection_count().await, 0);
        assert_eq!(manager.metrics().snapshot().security_violations, 1);
    }

    #[tokio::test]
    async fn test_owner_check_runs_before_active_check() {
        let manager = IsolatedManager::new(context("victim", "c1"));
        manager.cleanup_all_connections().await;

        let (conn, _rx) = channel_connection("c1", "attacker");
        assert!(matches!(
            manager.add_connection(conn).await,
            Err(IsolationError::IsolationViolation { .. })
        ));

        let (conn, _rx) = channel_connection("c1", "victim");
        assert!(matches!(
            manager.add_connection(conn).await,
            Err(IsolationError::InactiveManager(_))
        ));
    }

    #[tokio::test]
    async fn test_returned_id_set_is_a_copy() {
        let manager = IsolatedManager::new(context("u1", "c1"));
        let (conn, _rx) = channel_connection("c1", "u1");
        manager.add_connection(conn).await.unwrap();

        let mut ids = manager.get_user_connections().await;
        ids.clear();
        ids.insert("injected".to_string());

        let current = manager.get_user_connections().await;
        assert_eq!(current.len(), 1);
        assert!(current.contains("c1"));
    }

    #[tokio::test]
    async fn test_remove_all_connections_round_trip() {
        let manager = IsolatedManager::new(context("u1", "scope"));
        let mut receivers = Vec::new();
        for i in 0..4 {
            let (conn, rx) = channel_connection(&format!("c{}", i), "u1");
            receivers.push(rx);
            manager.add_connection(conn).await.unwrap();
        }
        assert_eq!(manager.metrics().connections_managed(), 4);

        for i in 0..4 {
            assert!(manager.remove_connection(&format!("c{}", i)).await);
        }

        assert!(manager.get_user_connections().await.is_empty());
        assert_eq!(manager.metrics().connections_managed(), 0);
        assert!(!manager.remove_connection("c0").await);
    }

    #[tokio::test]
    async fn test_re_adding_same_id_does_not_double_count() {
        let manager = IsolatedManager::new(context("u1", "c1"));
        let (first, _rx1) = channel_connection("c1", "u1");
        let (second, _rx2) = channel_connection("c1", "u1");

        manager.add_connection(first).await.unwrap();
        manager.add_connection(second).await.unwrap();

        assert_eq!(manager.connection_count().await, 1);
        assert_eq!(manager.metrics().connections_managed(), 1);
    }

    #[tokio::test]
    async fn test_is_connection_active_checks_user() {
        let manager = IsolatedManager::new(context("u1", "c1"));
        assert!(!manager.is_connection_active("u1").await);

        let (conn, _rx) = channel_connection("c1", "u1");
        manager.add_connection(conn).await.unwrap();

        assert!(manager.is_connection_active("u1").await);
        assert!(!manager.is_connection_active("u2").await);
    }

    #[tokio::test]
    async fn test_send_without_connections_queues_message() {
        let manager = IsolatedManager::new(context("u1", "c1"));

        let result = manager.send_to_user(json!({"type": "x"})).await;

        assert!(result.queued);
        let queue = manager.recovery_queue().await;
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].failure_reason.as_str(), "no_connections");
        assert_eq!(manager.metrics().snapshot().messages_failed_total, 1);
    }

    #[tokio::test]
    async fn test_closed_connections_are_skipped() {
        let manager = IsolatedManager::new(context("u1", "c1"));
        let (conn, rx) = channel_connection("c1", "u1");
        manager.add_connection(conn).await.unwrap();
        drop(rx);

        let result = manager.send_to_user(json!({"type": "x"})).await;

        assert!(result.queued);
        assert_eq!(
            manager.recovery_queue().await[0].failure_reason,
            FailureReason::NoConnections
        );
    }

    #[tokio::test]
    async fn test_transport_failure_queues_with_reason() {
        let manager = IsolatedManager::new(context("u1", "c1"));
        manager
            .add_connection(Connection::new("c1", "u1", Arc::new(FailingTransport)))
            .await
            .unwrap();

        let result = manager.send_to_user(json!({"type": "x"})).await;

        assert_eq!(result.failed, 1);
        assert!(result.queued);
        let queue = manager.drain_recovery_queue().await;
        assert!(matches!(
            queue[0].failure_reason,
            FailureReason::TransportError(ref detail) if detail.contains("broken pipe")
        ));
        assert!(manager.recovery_queue().await.is_empty());
        assert_eq!(manager.get_manager_stats().await.error_count, 1);
    }

    #[tokio::test]
    async fn test_partial_failure_counts_as_delivered() {
        let manager = IsolatedManager::new(context("u1", "scope"));
        let (conn, mut rx) = channel_connection("ok", "u1");
        manager.add_connection(conn).await.unwrap();
        manager
            .add_connection(Connection::new("bad", "u1", Arc::new(FailingTransport)))
            .await
            .unwrap();

        let result = manager.send_to_user(json!({"type": "x"})).await;

        assert_eq!(result.delivered_to, 1);
        assert_eq!(result.failed, 1);
        assert!(!result.queued);
        assert!(rx.recv().await.is_some());
        assert!(manager.recovery_queue().await.is_empty());
    }

    #[tokio::test]
    async fn test_recovery_queue_is_bounded() {
        let manager = IsolatedManager::with_queue_size(context("u1", "c1"), 2);

        for i in 0..3 {
            manager.send_to_user(json!({"seq": i})).await;
        }

        let queue = manager.recovery_queue().await;
        assert_eq!(queue.len(), 2);
        assert_eq!(queue[0].message["seq"], 1);
        assert_eq!(manager.metrics().snapshot().recovery_dropped, 1);
    }

    #[tokio::test]
    async fn test_critical_event_validation_and_shape() {
        let manager = IsolatedManager::new(context("u1", "c1"));
        assert!(matches!(
            manager.emit_critical_event("   ", json!({})).await,
            Err(IsolationError::Validation(_))
        ));

        let (conn, mut rx) = channel_connection("c1", "u1");
        manager.add_connection(conn).await.unwrap();
        let result = manager
            .emit_critical_event("agent_failed", json!({"reason": "boom"}))
            .await
            .unwrap();
        assert!(result.is_delivered());

        let event = rx.recv().await.unwrap();
        assert_eq!(event["type"], "agent_failed");
        assert_eq!(event["critical"], true);
        assert_eq!(event["data"]["reason"], "boom");
        assert_eq!(event["user_context"]["user_id"], "u1");
        assert!(event["timestamp"].is_string());
    }

    #[tokio::test]
    async fn test_cleanup_is_terminal_and_idempotent() {
        let manager = IsolatedManager::new(context("u1", "c1"));
        let (conn, _rx) = channel_connection("c1", "u1");
        manager.add_connection(conn).await.unwrap();
        manager.send_to_user(json!({"type": "x"})).await;

        manager.cleanup_all_connections().await;
        manager.cleanup_all_connections().await;

        assert!(!manager.is_active());
        assert_eq!(manager.connection_count().await, 0);
        assert!(manager.recovery_queue().await.is_empty());

        let stats = manager.get_manager_stats().await;
        assert!(stats.metrics.cleanup_scheduled);
        assert!(!stats.is_active);

        // Messages to an inactive manager are dropped, not queued
        let result = manager.send_to_user(json!({"type": "late"})).await;
        assert!(!result.queued);
        assert!(manager.recovery_queue().await.is_empty());
    }
}
