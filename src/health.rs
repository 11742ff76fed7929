use serde::Serialize;

use crate::alias::AliasStats;
use crate::config::PublicAppConfig;
use crate::fail_cache::FailCacheStats;
use crate::manual_queue::ManualQueueStats;

#[derive(Debug, Serialize)]
pub struct EngineHealth {
    pub db_path: String,
    pub geo_cache_entries: usize,
    pub aliases: AliasStats,
    pub fail_cache: FailCacheStats,
    pub manual_queue: ManualQueueStats,
    pub synonym_triggers: usize,
    pub geocoder_qps: u32,
    pub config: PublicAppConfig,
}

impl EngineHealth {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db_path: String,
        geo_cache_entries: usize,
        aliases: AliasStats,
        fail_cache: FailCacheStats,
        manual_queue: ManualQueueStats,
        synonym_triggers: usize,
        geocoder_qps: u32,
        config: PublicAppConfig,
    ) -> Self {
        Self {
            db_path,
            geo_cache_entries,
            aliases,
            fail_cache,
            manual_queue,
            synonym_triggers,
            geocoder_qps,
            config,
        }
    }

    pub fn open_escalations(&self) -> usize {
        self.manual_queue.open
    }
}
