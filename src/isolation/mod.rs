//! Per-user connection isolation
//!
//! This module provides:
//! - `ManagerFactory`: registry of isolated managers with per-user limits and expiry
//! - `IsolatedManager`: the connections of one user scope, with owner checks on
//!   every attach and best-effort delivery backed by a recovery queue
//! - `LifecycleManager`: health timestamps and expiry for one manager's connections

mod connection;
mod context;
mod factory;
mod lifecycle;
mod manager;
mod stats;

pub use connection::{ChannelTransport, Connection, Transport, TransportError};
pub use context::{IsolationKey, UserExecutionContext};
pub use factory::{ManagerEntry, ManagerFactory};
pub use lifecycle::{default_expiry, LifecycleManager, DEFAULT_EXPIRY_MINUTES};
pub use manager::{DeliveryResult, IsolatedManager, DEFAULT_RECOVERY_QUEUE_SIZE};
pub use stats::{
    ConnectionSummary, FactoryConfigSnapshot, FactoryMetrics, FactoryMetricsSnapshot,
    FactoryStats, FailureReason, ManagerMetrics, ManagerMetricsSnapshot, ManagerStats,
    RecoveryQueueEntry,
};
