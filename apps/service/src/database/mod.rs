/// State persistence
///
/// Liveness states are written to libSQL periodically and read back at
/// startup, so a restart does not forget which devices are down.
pub mod migrations;
pub mod repository;

pub use repository::{LibsqlStateStore, StateStore};

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Result;
use pingwatch::{DeviceId, LivenessTracker};
use tracing::debug;

/// Initialize database with schema
pub async fn initialize_database(conn: &libsql::Connection) -> Result<()> {
    migrations::run_migrations(conn).await
}

/// Mirrors the tracker into a [`StateStore`]
pub struct StatePersister {
    store: Arc<dyn StateStore>,
    saved: HashSet<DeviceId>,
}

impl StatePersister {
    /// `saved` seeds the set of devices already present in the store
    pub fn new(store: Arc<dyn StateStore>, saved: impl IntoIterator<Item = DeviceId>) -> Self {
        Self { store, saved: saved.into_iter().collect() }
    }

    /// Save every tracked state and delete rows of devices the tracker dropped
    pub async fn persist(&mut self, tracker: &LivenessTracker) -> Result<usize> {
        let states = tracker.states();
        let current: HashSet<DeviceId> = states.iter().map(|s| s.device_id.clone()).collect();
        let gone: Vec<DeviceId> = self.saved.difference(&current).cloned().collect();

        self.store.save_states(&states).await?;
        if !gone.is_empty() {
            self.store.delete_states(&gone).await?;
        }

        debug!(saved = states.len(), deleted = gone.len(), "Persisted liveness states");
        self.saved = current;
        Ok(states.len())
    }
}
