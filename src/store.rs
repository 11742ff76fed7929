use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::Connection;

use crate::alias::AliasStore;
use crate::config::AppConfig;
use crate::db;
use crate::errors::AppResult;
use crate::fail_cache::{BackoffPolicy, FailCacheStore};
use crate::geo_cache::GeoCacheStore;
use crate::manual_queue::ManualQueueStore;

/// The four keyed tables plus the audit log, all on one injected connection.
#[derive(Clone)]
pub struct Store {
    db: Arc<Mutex<Connection>>,
    geo: GeoCacheStore,
    aliases: AliasStore,
    fail_cache: FailCacheStore,
    manual_queue: ManualQueueStore,
}

impl Store {
    pub fn new(db: Arc<Mutex<Connection>>, config: &AppConfig) -> Self {
        Self {
            geo: GeoCacheStore::new(db.clone()),
            aliases: AliasStore::new(db.clone()),
            fail_cache: FailCacheStore::new(db.clone(), BackoffPolicy::from_config(config)),
            manual_queue: ManualQueueStore::new(db.clone()),
            db,
        }
    }

    pub fn in_memory(config: &AppConfig) -> AppResult<Self> {
        let connection = db::open_in_memory()?;
        Ok(Self::new(Arc::new(Mutex::new(connection)), config))
    }

    pub fn geo(&self) -> &GeoCacheStore {
        &self.geo
    }

    pub fn aliases(&self) -> &AliasStore {
        &self.aliases
    }

    pub fn fail_cache(&self) -> &FailCacheStore {
        &self.fail_cache
    }

    pub fn manual_queue(&self) -> &ManualQueueStore {
        &self.manual_queue
    }

    pub fn connection(&self) -> Arc<Mutex<Connection>> {
        Arc::clone(&self.db)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo_cache::GeoSource;

    #[test]
    fn stores_share_one_connection() {
        let store = Store::in_memory(&AppConfig::default()).unwrap();
        store
            .geo()
            .upsert("Altmarkt 1, Dresden", 51.05, 13.74, GeoSource::Geocoder, None, None)
            .unwrap();
        store
            .aliases()
            .set_alias("Altmarkt 1 Dresden", "Altmarkt 1, Dresden", Some("test"))
            .unwrap();

        let conn = store.connection();
        let count: i64 = conn
            .lock()
            .query_row("SELECT COUNT(*) FROM geo_alias", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn fail_cache_uses_configured_backoff() {
        let config = AppConfig {
            fail_cache_base_minutes: 5,
            fail_cache_max_minutes: 15,
            ..AppConfig::default()
        };
        let store = Store::in_memory(&config).unwrap();
        let policy = store.fail_cache().policy();
        assert_eq!(policy.window(1), chrono::Duration::minutes(5));
        assert_eq!(policy.window(3), chrono::Duration::minutes(15));
    }
}
