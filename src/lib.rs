pub mod alias;
pub mod config;
pub mod db;
pub mod errors;
pub mod fail_cache;
pub mod geo_cache;
pub mod geocoder;
pub mod health;
pub mod manual_queue;
pub mod normalize;
pub mod resolver;
pub mod store;
pub mod synonyms;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use crate::alias::{AliasMapping, AliasStats, AliasStore, AuditEntry};
pub use crate::config::{AppConfig, PublicAppConfig};
pub use crate::errors::{AppError, AppResult};
pub use crate::fail_cache::{BackoffPolicy, FailCacheEntry, FailCacheStats, FailCacheStore, FailFilter};
pub use crate::geo_cache::{GeoCacheEntry, GeoCacheStore, GeoSource, Precision};
pub use crate::geocoder::{GeocodeCandidate, Geocoder, GeocoderService};
pub use crate::health::EngineHealth;
pub use crate::manual_queue::{ManualQueueEntry, ManualQueueStats, ManualQueueStore, QueueStatus};
pub use crate::normalize::{fuzzy_normalize, strict_normalize, variants_of};
pub use crate::resolver::{
    EscalationReason, ResolutionOutcome, ResolutionTier, ResolvedLocation, Resolver,
};
pub use crate::store::Store;
pub use crate::synonyms::SynonymTable;

use crate::db::{bootstrap, DatabaseContext};

/// Database, stores and resolver wired from one [`AppConfig`].
pub struct GeocodeEngine {
    store: Store,
    resolver: Resolver,
    db_path: PathBuf,
    config: AppConfig,
}

impl GeocodeEngine {
    pub fn initialize<P: AsRef<Path>>(data_dir: P, config: AppConfig) -> AppResult<Self> {
        let geocoder = GeocoderService::from_config(&config);
        Self::with_geocoder(data_dir, config, geocoder)
    }

    /// Same as [`GeocodeEngine::initialize`] with a caller-supplied geocoder front.
    pub fn with_geocoder<P: AsRef<Path>>(
        data_dir: P,
        config: AppConfig,
        geocoder: GeocoderService,
    ) -> AppResult<Self> {
        init_tracing();
        let DatabaseContext { connection, path } =
            bootstrap(data_dir, &config.database_file_name)?;
        let store = Store::new(Arc::new(Mutex::new(connection)), &config);
        let synonyms = match config.synonyms_file.as_ref() {
            Some(file) => SynonymTable::from_json_file(file)?,
            None => SynonymTable::builtin(),
        };
        let resolver = Resolver::new(&store, synonyms, geocoder, &config);
        info!(
            target: "database_bootstrap",
            path = %path.display(),
            version = env!("CARGO_PKG_VERSION"),
            "geocode engine initialized"
        );

        Ok(Self {
            store,
            resolver,
            db_path: path,
            config,
        })
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn resolver(&self) -> &Resolver {
        &self.resolver
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub async fn resolve(
        &self,
        raw_address: &str,
        company_name: Option<&str>,
    ) -> AppResult<ResolutionOutcome> {
        self.resolver.resolve(raw_address, company_name).await
    }

    pub fn bulk_get<I, S>(&self, keys: I) -> AppResult<HashMap<String, GeoCacheEntry>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.store.geo().bulk_get(keys)
    }

    pub fn bulk_get_by_fuzzy<I, S>(&self, keys: I) -> AppResult<HashMap<String, Vec<GeoCacheEntry>>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.store.geo().bulk_get_by_fuzzy(keys)
    }

    pub fn health(&self) -> AppResult<EngineHealth> {
        Ok(EngineHealth::new(
            self.db_path.to_string_lossy().to_string(),
            self.store.geo().count()?,
            self.store.aliases().stats()?,
            self.store.fail_cache().stats()?,
            self.store.manual_queue().stats()?,
            self.resolver.synonyms().len(),
            self.resolver.geocoder().rate_limit_qps(),
            self.config.public_profile(),
        ))
    }
}

pub fn init_tracing() {
    static INIT: OnceCell<()> = OnceCell::new();
    let _ = INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,geocode_cache=debug"));
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init();
    });
}
