use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::alias::AliasStore;
use crate::config::AppConfig;
use crate::errors::AppResult;
use crate::fail_cache::FailCacheStore;
use crate::geo_cache::{
    precision_for_note, validate_coordinates, GeoCacheEntry, GeoCacheStore, GeoSource,
    Precision,
};
use crate::geocoder::GeocoderService;
use crate::manual_queue::ManualQueueStore;
use crate::normalize::{strict_normalize, variants_of};
use crate::store::Store;
use crate::synonyms::SynonymTable;

pub const REASON_TEMP_ERROR: &str = "temp_error";

/// Which lookup tier produced a hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionTier {
    Synonym,
    Cache,
    Alias,
    Geocoder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationReason {
    GeocodeMiss,
    InvalidCoordinates,
    EmptyAddress,
}

impl EscalationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EscalationReason::GeocodeMiss => "geocode_miss",
            EscalationReason::InvalidCoordinates => "invalid_coordinates",
            EscalationReason::EmptyAddress => "empty_address",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedLocation {
    /// Strict key of the entry that answered.
    pub key: String,
    pub lat: f64,
    pub lon: f64,
    pub source: GeoSource,
    pub precision: Option<Precision>,
    pub region_ok: Option<bool>,
    pub via: ResolutionTier,
}

impl ResolvedLocation {
    fn from_cache(entry: GeoCacheEntry, via: ResolutionTier) -> Self {
        Self {
            key: entry.address_norm,
            lat: entry.lat,
            lon: entry.lon,
            source: GeoSource::Cache,
            precision: entry.precision,
            region_ok: entry.region_ok,
            via,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ResolutionOutcome {
    Hit(ResolvedLocation),
    /// A recent failure is still cached; retry after `until`.
    Deferred {
        reason: String,
        until: DateTime<Utc>,
    },
    /// Durably handed to the manual queue.
    Escalated { reason: EscalationReason },
}

impl ResolutionOutcome {
    pub fn location(&self) -> Option<&ResolvedLocation> {
        match self {
            ResolutionOutcome::Hit(location) => Some(location),
            _ => None,
        }
    }

    pub fn is_hit(&self) -> bool {
        self.location().is_some()
    }
}

/// Runs the lookup tiers in order and routes failures to the fail cache and the manual queue.
#[derive(Clone)]
pub struct Resolver {
    synonyms: Arc<SynonymTable>,
    geo: GeoCacheStore,
    aliases: AliasStore,
    fail_cache: FailCacheStore,
    manual_queue: ManualQueueStore,
    geocoder: GeocoderService,
    service_regions: Vec<String>,
    fail_cache_on_miss: bool,
    manual_queue_dedup: bool,
}

impl Resolver {
    pub fn new(
        store: &Store,
        synonyms: SynonymTable,
        geocoder: GeocoderService,
        config: &AppConfig,
    ) -> Self {
        Self {
            synonyms: Arc::new(synonyms),
            geo: store.geo().clone(),
            aliases: store.aliases().clone(),
            fail_cache: store.fail_cache().clone(),
            manual_queue: store.manual_queue().clone(),
            geocoder,
            service_regions: config.service_regions.clone(),
            fail_cache_on_miss: config.fail_cache_on_miss,
            manual_queue_dedup: config.manual_queue_dedup,
        }
    }

    pub fn synonyms(&self) -> &SynonymTable {
        &self.synonyms
    }

    pub fn geocoder(&self) -> &GeocoderService {
        &self.geocoder
    }

    /// Geocode misses and bad coordinates come back as outcomes. Only storage
    /// failures are errors.
    pub async fn resolve(
        &self,
        raw_address: &str,
        company_name: Option<&str>,
    ) -> AppResult<ResolutionOutcome> {
        if let Some(target) = self.synonyms.lookup(raw_address, company_name) {
            debug!(target: "resolver", resolved = %target.resolved_address, "synonym hit");
            return Ok(ResolutionOutcome::Hit(ResolvedLocation {
                key: strict_normalize(&target.resolved_address),
                lat: target.lat,
                lon: target.lon,
                source: GeoSource::Synonym,
                precision: None,
                region_ok: Some(true),
                via: ResolutionTier::Synonym,
            }));
        }

        let primary = strict_normalize(raw_address);
        if primary.is_empty() {
            return Ok(ResolutionOutcome::Escalated {
                reason: EscalationReason::EmptyAddress,
            });
        }

        for key in variants_of(raw_address, company_name) {
            if let Some(entry) = self.geo.get(&key)? {
                self.geo.touch(&entry.address_norm)?;
                debug!(target: "resolver", key = %entry.address_norm, "geo cache hit");
                return Ok(ResolutionOutcome::Hit(ResolvedLocation::from_cache(
                    entry,
                    ResolutionTier::Cache,
                )));
            }
        }

        if let Some(mapping) = self.aliases.lookup(&primary)? {
            if let Some(entry) = self.geo.get(&mapping.canonical_norm)? {
                self.geo.touch(&entry.address_norm)?;
                debug!(
                    target: "resolver",
                    key = %primary,
                    canonical = %entry.address_norm,
                    "resolved through alias"
                );
                return Ok(ResolutionOutcome::Hit(ResolvedLocation::from_cache(
                    entry,
                    ResolutionTier::Alias,
                )));
            }
            warn!(
                target: "resolver",
                key = %primary,
                canonical = %mapping.canonical_norm,
                "alias points at a missing geo cache entry"
            );
        }

        if let Some(entry) = self.fail_cache.active_entry(&primary)? {
            debug!(
                target: "resolver",
                key = %primary,
                reason = %entry.reason,
                until = %entry.until,
                "skipping geocoder for recently failed address"
            );
            return Ok(ResolutionOutcome::Deferred {
                reason: entry.reason,
                until: entry.until,
            });
        }

        let candidates = match self.geocoder.lookup(&primary).await {
            Ok(candidates) => candidates,
            Err(err) => {
                warn!(target: "resolver", ?err, key = %primary, "geocoder unavailable");
                let entry = self.fail_cache.record_failure(&primary, REASON_TEMP_ERROR)?;
                return Ok(ResolutionOutcome::Deferred {
                    reason: entry.reason,
                    until: entry.until,
                });
            }
        };

        let Some((candidate, (lat, lon))) = candidates
            .iter()
            .find_map(|c| c.coordinates().map(|coords| (c, coords)))
        else {
            return self.escalate(raw_address, EscalationReason::GeocodeMiss);
        };
        if validate_coordinates(lat, lon).is_err() {
            return self.escalate(raw_address, EscalationReason::InvalidCoordinates);
        }

        let precision = precision_for_note(candidate.note.as_deref());
        let region_ok = candidate.region.as_deref().map(|region| self.region_ok(region));
        let entry = self.persist(raw_address, lat, lon, GeoSource::Geocoder, precision, region_ok)?;
        info!(
            target: "resolver",
            key = %entry.address_norm,
            precision = precision.map(|p| p.as_str()).unwrap_or("none"),
            region_ok = ?region_ok,
            "geocoded and cached"
        );
        Ok(ResolutionOutcome::Hit(ResolvedLocation {
            key: entry.address_norm,
            lat: entry.lat,
            lon: entry.lon,
            source: entry.source,
            precision: entry.precision,
            region_ok: entry.region_ok,
            via: ResolutionTier::Geocoder,
        }))
    }

    /// Write path for a successful resolution. Clears the negative cache and any
    /// open queue rows for the key.
    pub fn persist(
        &self,
        raw_address: &str,
        lat: f64,
        lon: f64,
        source: GeoSource,
        precision: Option<Precision>,
        region_ok: Option<bool>,
    ) -> AppResult<GeoCacheEntry> {
        let entry = self
            .geo
            .upsert(raw_address, lat, lon, source, precision, region_ok)?;
        self.fail_cache.clear([entry.address_norm.as_str()])?;
        self.manual_queue.close(&entry.address_norm)?;
        Ok(entry)
    }

    /// Operator-supplied coordinates for a queued address.
    pub fn apply_manual(&self, raw_address: &str, lat: f64, lon: f64) -> AppResult<GeoCacheEntry> {
        let entry = self.persist(raw_address, lat, lon, GeoSource::Manual, None, None)?;
        info!(target: "resolver", key = %entry.address_norm, "manual coordinates applied");
        Ok(entry)
    }

    pub fn region_ok(&self, region: &str) -> bool {
        let region = region.trim().to_lowercase();
        self.service_regions
            .iter()
            .any(|allowed| allowed.trim().to_lowercase() == region)
    }

    fn escalate(
        &self,
        raw_address: &str,
        reason: EscalationReason,
    ) -> AppResult<ResolutionOutcome> {
        self.manual_queue
            .add_open(raw_address, reason.as_str(), None, self.manual_queue_dedup)?;
        if self.fail_cache_on_miss {
            self.fail_cache.record_failure(raw_address, reason.as_str())?;
        }
        info!(
            target: "resolver",
            key = %strict_normalize(raw_address),
            reason = reason.as_str(),
            "address escalated to manual queue"
        );
        Ok(ResolutionOutcome::Escalated { reason })
    }
}
