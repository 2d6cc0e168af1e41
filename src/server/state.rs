use std::sync::Arc;
use std::time::Instant;

use crate::isolation::ManagerFactory;

#[derive(Clone)]
pub struct AppState {
    pub factory: Arc<ManagerFactory>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(factory: Arc<ManagerFactory>) -> Self {
        Self {
            factory,
            started_at: Instant::now(),
        }
    }
}
