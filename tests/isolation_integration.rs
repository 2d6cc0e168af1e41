//! End-to-end tests for the isolation subsystem
//!
//! These drive the factory, isolated managers and lifecycle managers together
//! through the public API, using in-process channel transports in place of
//! real sockets.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc;

use ws_isolation::config::IsolationConfig;
use ws_isolation::error::IsolationError;
use ws_isolation::isolation::{
    ChannelTransport, Connection, FailureReason, IsolatedManager, LifecycleManager,
    ManagerFactory, UserExecutionContext,
};

fn factory_with_limit(max_managers_per_user: usize) -> Arc<ManagerFactory> {
    Arc::new(ManagerFactory::new(IsolationConfig {
        max_managers_per_user,
        ..Default::default()
    }))
}

fn context(user_id: &str, connection_id: &str) -> UserExecutionContext {
    UserExecutionContext::new(user_id, "thread-1", "run-1")
        .unwrap()
        .with_websocket_connection_id(connection_id)
        .unwrap()
}

fn connection(connection_id: &str, user_id: &str) -> (Connection, mpsc::Receiver<Value>) {
    let (transport, rx) = ChannelTransport::channel(32);
    (Connection::new(connection_id, user_id, Arc::new(transport)), rx)
}

// =============================================================================
// Factory behaviour
// =============================================================================

mod factory_tests {
    use super::*;

    #[tokio::test]
    async fn test_create_manager_is_idempotent() {
        let factory = factory_with_limit(3);

        let a = factory.create_manager(context("u1", "c1")).await.unwrap();
        let b = factory.create_manager(context("u1", "c1")).await.unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(factory.get_factory_stats().await.metrics.managers_created, 1);
    }

    #[tokio::test]
    async fn test_fourth_manager_hits_limit() {
        let factory = factory_with_limit(3);
        for i in 0..3 {
            factory
                .create_manager(context("u1", &format!("c{}", i)))
                .await
                .unwrap();
        }

        let err = factory
            .create_manager(context("u1", "c3"))
            .await
            .unwrap_err();

        assert!(matches!(err, IsolationError::ResourceLimit { .. }));
        let stats = factory.get_factory_stats().await;
        assert_eq!(stats.metrics.resource_limit_hits, 1);
        assert_eq!(stats.user_distribution.get("u1"), Some(&3));
        assert_eq!(stats.config.max_managers_per_user, 3);
    }

    #[tokio::test]
    async fn test_cleanup_yields_new_instance() {
        let factory = factory_with_limit(3);
        let ctx = context("u1", "c1");
        let key = ctx.isolation_key();
        let first = factory.create_manager(ctx.clone()).await.unwrap();

        assert!(factory.cleanup_manager(&key).await);
        assert!(factory.get_manager(&key).await.is_none());

        let second = factory.create_manager(ctx).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(second.is_active());
    }

    #[tokio::test]
    async fn test_unknown_key_lookups_never_fail() {
        let factory = factory_with_limit(3);
        let key = "nobody:nothing".into();

        assert!(factory.get_manager(&key).await.is_none());
        assert!(!factory.cleanup_manager(&key).await);
    }

    #[tokio::test]
    async fn test_stats_do_not_mutate() {
        let factory = factory_with_limit(3);
        factory.create_manager(context("u1", "c1")).await.unwrap();

        let before = factory.get_factory_stats().await;
        let after = factory.get_factory_stats().await;

        assert_eq!(before.active_managers, after.active_managers);
        assert_eq!(
            before.metrics.managers_created,
            after.metrics.managers_created
        );
        assert!(after.oldest_manager_age_seconds.is_some());
    }

    #[tokio::test]
    async fn test_violations_roll_up_to_factory() {
        let factory = factory_with_limit(3);
        let manager = factory
            .create_manager(context("victim", "c1"))
            .await
            .unwrap();
        let (conn, _rx) = connection("c1", "attacker");

        assert!(manager.add_connection(conn).await.is_err());

        let stats = factory.get_factory_stats().await;
        assert_eq!(stats.metrics.security_violations_detected, 1);
    }

    #[tokio::test]
    async fn test_concurrent_users_stay_within_limits() {
        let factory = factory_with_limit(2);

        let handles: Vec<_> = (0..30)
            .map(|i| {
                let factory = factory.clone();
                tokio::spawn(async move {
                    let user = format!("user-{}", i % 3);
                    factory
                        .create_manager(context(&user, &format!("c{}", i)))
                        .await
                })
            })
            .collect();

        for handle in handles {
            let _ = handle.await.unwrap();
        }

        for user in ["user-0", "user-1", "user-2"] {
            assert_eq!(factory.get_user_manager_count(user).await, 2);
        }
        assert_eq!(
            factory.get_factory_stats().await.metrics.resource_limit_hits,
            24
        );
    }
}

// =============================================================================
// Manager behaviour
// =============================================================================

mod manager_tests {
    use super::*;

    #[tokio::test]
    async fn test_add_send_and_stats() {
        let factory = factory_with_limit(3);
        let manager = factory.create_manager(context("u1", "c1")).await.unwrap();
        let (conn, mut rx) = connection("c1", "u1");

        manager.add_connection(conn).await.unwrap();
        let result = manager.send_to_user(json!({"type": "x"})).await;

        assert!(result.is_delivered());
        assert_eq!(rx.recv().await.unwrap(), json!({"type": "x"}));
        assert_eq!(manager.get_manager_stats().await.connections.total, 1);
    }

    #[tokio::test]
    async fn test_attacker_connection_rejected() {
        let factory = factory_with_limit(3);
        let manager = factory
            .create_manager(context("victim", "c1"))
            .await
            .unwrap();
        let (conn, _rx) = connection("c-evil", "attacker");

        let err = manager.add_connection(conn).await.unwrap_err();

        assert!(matches!(err, IsolationError::IsolationViolation { .. }));
        assert_eq!(manager.get_manager_stats().await.connections.total, 0);
        assert!(manager.get_connection("c-evil").await.is_none());
    }

    #[tokio::test]
    async fn test_add_remove_round_trip() {
        let manager = IsolatedManager::new(context("u1", "scope"));
        let mut receivers = Vec::new();
        let ids: Vec<String> = (0..5).map(|i| format!("conn-{}", i)).collect();

        for id in &ids {
            let (conn, rx) = connection(id, "u1");
            receivers.push(rx);
            manager.add_connection(conn).await.unwrap();
        }
        let expected: HashSet<String> = ids.iter().cloned().collect();
        assert_eq!(manager.get_user_connections().await, expected);

        for id in &ids {
            manager.remove_connection(id).await;
        }

        assert!(manager.get_user_connections().await.is_empty());
    }

    #[tokio::test]
    async fn test_send_with_no_connections_is_queued() {
        let factory = factory_with_limit(3);
        let manager = factory.create_manager(context("u1", "c1")).await.unwrap();

        let result = manager.send_to_user(json!({"type": "x"})).await;

        assert!(result.queued);
        let queue = manager.recovery_queue().await;
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].failure_reason, FailureReason::NoConnections);
        assert_eq!(queue[0].failure_reason.as_str(), "no_connections");
    }

    #[tokio::test]
    async fn test_cleanup_all_connections_twice() {
        let factory = factory_with_limit(3);
        let manager = factory.create_manager(context("u1", "c1")).await.unwrap();
        let (conn, _rx) = connection("c1", "u1");
        manager.add_connection(conn).await.unwrap();

        manager.cleanup_all_connections().await;
        let first = manager.get_manager_stats().await;
        manager.cleanup_all_connections().await;
        let second = manager.get_manager_stats().await;

        assert_eq!(first.connections.total, 0);
        assert_eq!(second.connections.total, 0);
        assert!(!first.is_active && !second.is_active);
    }
}

// =============================================================================
// Lifecycle behaviour
// =============================================================================

mod lifecycle_tests {
    use super::*;

    #[tokio::test]
    async fn test_register_health_and_force_cleanup() {
        let factory = factory_with_limit(3);
        let manager = factory.create_manager(context("u1", "c1")).await.unwrap();
        let lifecycle = LifecycleManager::new(manager.clone());

        let (conn, _rx) = connection("c1", "u1");
        lifecycle.register_connection(&conn).unwrap();
        manager.add_connection(conn).await.unwrap();

        assert!(lifecycle.health_check_connection("c1").await);
        assert_eq!(lifecycle.auto_cleanup_expired(Duration::from_secs(60)).await, 0);

        assert_eq!(lifecycle.force_cleanup_all().await, 1);
        assert!(manager.get_connection("c1").await.is_none());
        assert!(!lifecycle.is_active());
    }

    #[tokio::test]
    async fn test_expired_connection_removed_from_manager() {
        let manager = Arc::new(IsolatedManager::new(context("u1", "c1")));
        let lifecycle = LifecycleManager::new(manager.clone());
        let (conn, _rx) = connection("c1", "u1");
        lifecycle.register_connection(&conn).unwrap();
        manager.add_connection(conn).await.unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        let removed = lifecycle
            .auto_cleanup_expired(Duration::from_millis(5))
            .await;

        assert_eq!(removed, 1);
        assert!(lifecycle.tracked_connections().is_empty());
        assert!(manager.get_user_connections().await.is_empty());
    }

    #[tokio::test]
    async fn test_foreign_registration_counts_as_violation() {
        let factory = factory_with_limit(3);
        let manager = factory
            .create_manager(context("victim", "c1"))
            .await
            .unwrap();
        let lifecycle = LifecycleManager::new(manager.clone());
        let (conn, _rx) = connection("c1", "attacker");

        assert!(lifecycle.register_connection(&conn).is_err());

        let stats = factory.get_factory_stats().await;
        assert_eq!(stats.metrics.security_violations_detected, 1);
        assert_eq!(manager.metrics().snapshot().security_violations, 1);
    }

    #[tokio::test]
    async fn test_foreign_registration_blocked() {
        let manager = Arc::new(IsolatedManager::new(context("victim", "c1")));
        let lifecycle = LifecycleManager::new(manager);
        let (conn, _rx) = connection("c1", "attacker");

        assert!(lifecycle.register_connection(&conn).is_err());
        assert!(lifecycle.tracked_connections().is_empty());
    }
}

// =============================================================================
// Shutdown
// =============================================================================

mod shutdown_tests {
    use super::*;

    #[tokio::test]
    async fn test_shutdown_leaves_zero_managers() {
        let factory = factory_with_limit(3);
        factory.start_background_cleanup().await;
        let manager = factory.create_manager(context("u1", "c1")).await.unwrap();
        let (conn, _rx) = connection("c1", "u1");
        manager.add_connection(conn).await.unwrap();

        factory.shutdown().await;
        factory.shutdown().await;

        assert_eq!(factory.active_manager_count().await, 0);
        assert!(!manager.is_active());
        assert_eq!(manager.get_manager_stats().await.connections.total, 0);
    }
}
