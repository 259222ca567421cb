//! Process-wide session pool
//!
//! Connections with the same configuration share one backend. The pool
//! counts owners per configuration and drops the backend when the last
//! connection releases it.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, OnceLock};
use uuid::Uuid;

use crate::client::{DatabaseClient, DdlClient};
use crate::config::ConnectionConfig;

/// The pair of clients a connection executes through.
#[derive(Clone)]
pub struct Backend {
    pub database: Arc<dyn DatabaseClient>,
    pub admin: Arc<dyn DdlClient>,
}

type BackendFactory = Box<dyn Fn(&ConnectionConfig) -> Backend + Send + Sync>;

struct PoolEntry {
    backend: Backend,
    owners: HashSet<Uuid>,
}

/// Reference-counted registry of shared backends, keyed by configuration.
pub struct SessionPool {
    factory: BackendFactory,
    entries: Mutex<HashMap<ConnectionConfig, PoolEntry>>,
}

static GLOBAL: OnceLock<Arc<SessionPool>> = OnceLock::new();

impl SessionPool {
    pub fn new(
        factory: impl Fn(&ConnectionConfig) -> Backend + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            factory: Box::new(factory),
            entries: Mutex::new(HashMap::new()),
        })
    }

    /// Install the process-wide pool. The first caller wins; later calls
    /// return the already-installed pool.
    pub fn initialize_global(
        factory: impl Fn(&ConnectionConfig) -> Backend + Send + Sync + 'static,
    ) -> Arc<Self> {
        GLOBAL.get_or_init(|| Self::new(factory)).clone()
    }

    /// The process-wide pool, if one has been installed.
    pub fn global() -> Option<Arc<Self>> {
        GLOBAL.get().cloned()
    }

    /// Register `owner` and return the shared backend for `config`,
    /// creating it on first use.
    pub fn acquire(&self, config: &ConnectionConfig, owner: Uuid) -> Backend {
        let mut entries = self.entries.lock();
        let entry = entries.entry(config.clone()).or_insert_with(|| {
            tracing::debug!(database = config.database(), "creating shared backend");
            PoolEntry {
                backend: (self.factory)(config),
                owners: HashSet::new(),
            }
        });
        entry.owners.insert(owner);
        entry.backend.clone()
    }

    /// Deregister `owner`; the backend is dropped when no owners remain.
    pub fn release(&self, config: &ConnectionConfig, owner: Uuid) {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(config) {
            entry.owners.remove(&owner);
            if entry.owners.is_empty() {
                tracing::debug!(database = config.database(), "dropping shared backend");
                entries.remove(config);
            }
        }
    }

    /// Number of connections currently registered for `config`.
    pub fn owner_count(&self, config: &ConnectionConfig) -> usize {
        self.entries
            .lock()
            .get(config)
            .map(|entry| entry.owners.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockDatabase;

    fn mock_pool() -> Arc<SessionPool> {
        SessionPool::new(|_| {
            let db = Arc::new(MockDatabase::new());
            Backend {
                database: db.clone(),
                admin: db,
            }
        })
    }

    #[test]
    fn test_same_config_shares_backend() {
        let pool = mock_pool();
        let config = ConnectionConfig::new("db1");
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let backend_a = pool.acquire(&config, a);
        let backend_b = pool.acquire(&config, b);
        assert!(Arc::ptr_eq(&backend_a.database, &backend_b.database));
        assert_eq!(pool.owner_count(&config), 2);
    }

    #[test]
    fn test_release_drops_backend_when_last_owner_leaves() {
        let pool = mock_pool();
        let config = ConnectionConfig::new("db1");
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        pool.acquire(&config, a);
        pool.acquire(&config, b);
        pool.release(&config, a);
        assert_eq!(pool.owner_count(&config), 1);
        pool.release(&config, b);
        assert_eq!(pool.owner_count(&config), 0);
    }

    #[test]
    fn test_different_configs_get_different_backends() {
        let pool = mock_pool();
        let owner = Uuid::new_v4();
        let a = pool.acquire(&ConnectionConfig::new("db1"), owner);
        let b = pool.acquire(&ConnectionConfig::new("db2"), owner);
        assert!(!Arc::ptr_eq(&a.database, &b.database));
    }
}
