//! Shared-instance accessor for call sites that cannot receive the factory
//! through construction.
//!
//! New code should take an `Arc<ManagerFactory>` from the composition root.
//! This is the only place a process-wide instance exists.

use std::sync::{Arc, Mutex};

use lazy_static::lazy_static;

use crate::error::{IsolationError, IsolationResult};
use crate::isolation::{IsolatedManager, ManagerFactory, UserExecutionContext};

lazy_static! {
    static ref SHARED_FACTORY: Mutex<Option<Arc<ManagerFactory>>> = Mutex::new(None);
}

/// Register the factory legacy call sites should use, returning the previous one
pub fn install_shared_factory(factory: Arc<ManagerFactory>) -> Option<Arc<ManagerFactory>> {
    let mut shared = SHARED_FACTORY
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    shared.replace(factory)
}

pub fn shared_factory() -> Option<Arc<ManagerFactory>> {
    SHARED_FACTORY
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .clone()
}

pub fn clear_shared_factory() -> Option<Arc<ManagerFactory>> {
    SHARED_FACTORY
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .take()
}

/// Legacy entry point: create (or reuse) a manager through the shared factory
pub async fn create_websocket_manager(
    user_context: UserExecutionContext,
) -> IsolationResult<Arc<IsolatedManager>> {
    let factory = shared_factory().ok_or(IsolationError::FactoryNotInstalled)?;
    factory.create_manager(user_context).await
}
