//! Call identifier generation.

use crate::config::UidStrategy;
use crate::protocol::CallId;
use std::sync::atomic::{AtomicU64, Ordering};

/// Produces call identifiers for one client.
#[derive(Debug)]
pub struct UidGenerator {
    strategy: UidStrategy,
    next_id: AtomicU64,
}

impl UidGenerator {
    pub fn new(strategy: UidStrategy) -> Self {
        Self {
            strategy,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn strategy(&self) -> UidStrategy {
        self.strategy
    }

    pub fn next(&self) -> CallId {
        match self.strategy {
            UidStrategy::Counter => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                CallId::new(format!("{:x}", id))
            }
            UidStrategy::Random => CallId::new(uuid::Uuid::new_v4().simple().to_string()),
        }
    }
}

impl Default for UidGenerator {
    fn default() -> Self {
        Self::new(UidStrategy::default())
    }
}
