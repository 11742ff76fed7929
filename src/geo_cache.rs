use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSqlOutput, ValueRef};
use rusqlite::{params_from_iter, Connection, OptionalExtension, ToSql};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::db::{self, placeholders, MAX_BIND_PARAMS};
use crate::errors::{AppError, AppResult};
use crate::normalize::{fuzzy_normalize, strict_normalize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GeoSource {
    Synonym,
    Geocoder,
    Manual,
    Cache,
}

impl GeoSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            GeoSource::Synonym => "synonym",
            GeoSource::Geocoder => "geocoder",
            GeoSource::Manual => "manual",
            GeoSource::Cache => "cache",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "synonym" => Some(GeoSource::Synonym),
            // "geocoded" is the column default of older schemas.
            "geocoder" | "geocoded" => Some(GeoSource::Geocoder),
            "manual" => Some(GeoSource::Manual),
            "cache" => Some(GeoSource::Cache),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Precision {
    Full,
    ZipCentroid,
    None,
}

impl Precision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Precision::Full => "full",
            Precision::ZipCentroid => "zip_centroid",
            Precision::None => "none",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "full" => Some(Precision::Full),
            "zip_centroid" => Some(Precision::ZipCentroid),
            "none" => Some(Precision::None),
            _ => None,
        }
    }
}

/// Geocoder notes and the precision they imply. Anything not listed is a full match.
const NOTE_PRECISION: &[(&str, Option<Precision>)] = &[
    ("synonym", None),
    ("zip_centroid", Some(Precision::ZipCentroid)),
    ("geocoder", Some(Precision::Full)),
    ("cache", None),
];

/// Precision of a geocoder answer. The source of such an answer is always
/// [`GeoSource::Geocoder`], whatever the note says.
pub fn precision_for_note(note: Option<&str>) -> Option<Precision> {
    let note = note.map(str::trim).unwrap_or("geocoder");
    NOTE_PRECISION
        .iter()
        .find(|(name, _)| *name == note)
        .map_or(Some(Precision::Full), |(_, precision)| *precision)
}

impl ToSql for GeoSource {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for GeoSource {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let text = value.as_str()?;
        GeoSource::parse(text)
            .ok_or_else(|| FromSqlError::Other(format!("unknown geo source: {text}").into()))
    }
}

impl ToSql for Precision {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for Precision {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let text = value.as_str()?;
        Precision::parse(text)
            .ok_or_else(|| FromSqlError::Other(format!("unknown precision: {text}").into()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GeoCacheEntry {
    pub address_norm: String,
    pub lat: f64,
    pub lon: f64,
    pub source: GeoSource,
    pub precision: Option<Precision>,
    pub region_ok: Option<bool>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

pub fn validate_coordinates(lat: f64, lon: f64) -> AppResult<()> {
    let valid = lat.is_finite()
        && lon.is_finite()
        && (-90.0..=90.0).contains(&lat)
        && (-180.0..=180.0).contains(&lon);
    if valid {
        Ok(())
    } else {
        Err(AppError::InvalidCoordinates { lat, lon })
    }
}

const SELECT_COLUMNS: &str =
    "address_norm, lat, lon, source, precision, region_ok, first_seen, last_seen";

/// Authoritative positive cache keyed by the strict address key.
#[derive(Clone)]
pub struct GeoCacheStore {
    db: Arc<Mutex<Connection>>,
}

impl GeoCacheStore {
    pub fn new(db: Arc<Mutex<Connection>>) -> Self {
        Self { db }
    }

    /// Insert-or-update in one statement. `first_seen` survives updates and a
    /// `None` region verdict never erases a stored one.
    pub fn upsert(
        &self,
        key: &str,
        lat: f64,
        lon: f64,
        source: GeoSource,
        precision: Option<Precision>,
        region_ok: Option<bool>,
    ) -> AppResult<GeoCacheEntry> {
        let key = strict_normalize(key);
        if key.is_empty() {
            return Err(AppError::EmptyKey);
        }
        validate_coordinates(lat, lon)?;

        let now = db::now_timestamp();
        let mut conn = self.db.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO geo_cache (address_norm, lat, lon, source, precision, region_ok, first_seen, last_seen)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
            ON CONFLICT(address_norm) DO UPDATE SET
                lat = excluded.lat,
                lon = excluded.lon,
                source = excluded.source,
                precision = excluded.precision,
                region_ok = COALESCE(excluded.region_ok, geo_cache.region_ok),
                last_seen = excluded.last_seen",
            (key.as_str(), lat, lon, source, precision, region_ok, now),
        )?;
        let entry = tx.query_row(
            &format!("SELECT {SELECT_COLUMNS} FROM geo_cache WHERE address_norm = ?1"),
            [key.as_str()],
            parse_entry,
        )?;
        tx.commit()?;

        trace!(
            target: "geo_cache",
            key = %entry.address_norm,
            source = entry.source.as_str(),
            "geo cache entry upserted"
        );
        Ok(entry)
    }

    pub fn get(&self, key: &str) -> AppResult<Option<GeoCacheEntry>> {
        let key = strict_normalize(key);
        if key.is_empty() {
            return Ok(None);
        }
        let conn = self.db.lock();
        conn.query_row(
            &format!("SELECT {SELECT_COLUMNS} FROM geo_cache WHERE address_norm = ?1"),
            [key.as_str()],
            parse_entry,
        )
        .optional()
        .map_err(AppError::from)
    }

    /// Looks up many keys, `MAX_BIND_PARAMS` at a time. The result is keyed by the
    /// strict key, the same form `AliasStore::resolve_aliases` returns as canonical.
    pub fn bulk_get<I, S>(&self, keys: I) -> AppResult<HashMap<String, GeoCacheEntry>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut seen = HashSet::new();
        let keys: Vec<String> = keys
            .into_iter()
            .map(|key| strict_normalize(key.as_ref()))
            .filter(|key| !key.is_empty() && seen.insert(key.clone()))
            .collect();
        if keys.is_empty() {
            return Ok(HashMap::new());
        }

        let conn = self.db.lock();
        let mut out = HashMap::with_capacity(keys.len());
        for chunk in keys.chunks(MAX_BIND_PARAMS) {
            let sql = format!(
                "SELECT {SELECT_COLUMNS} FROM geo_cache WHERE address_norm IN ({})",
                placeholders(chunk.len())
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(chunk.iter()), parse_entry)?;
            for row in rows {
                let entry = row?;
                out.insert(entry.address_norm.clone(), entry);
            }
        }
        debug!(
            target: "geo_cache",
            requested = keys.len(),
            found = out.len(),
            "bulk geo cache lookup"
        );
        Ok(out)
    }

    /// [`GeoCacheStore::bulk_get`] grouped by fuzzy key. Stored spellings that collapse
    /// to the same fuzzy form share one bucket, sorted by strict key.
    pub fn bulk_get_by_fuzzy<I, S>(&self, keys: I) -> AppResult<HashMap<String, Vec<GeoCacheEntry>>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut grouped: HashMap<String, Vec<GeoCacheEntry>> = HashMap::new();
        for (key, entry) in self.bulk_get(keys)? {
            grouped.entry(fuzzy_normalize(&key)).or_default().push(entry);
        }
        for bucket in grouped.values_mut() {
            bucket.sort_by(|a, b| a.address_norm.cmp(&b.address_norm));
        }
        Ok(grouped)
    }

    /// Refreshes `last_seen` for a cache hit. Returns whether the key exists.
    pub fn touch(&self, key: &str) -> AppResult<bool> {
        let key = strict_normalize(key);
        let conn = self.db.lock();
        let updated = conn.execute(
            "UPDATE geo_cache SET last_seen = ?2 WHERE address_norm = ?1",
            (key.as_str(), db::now_timestamp()),
        )?;
        Ok(updated > 0)
    }

    pub fn count(&self) -> AppResult<usize> {
        let conn = self.db.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM geo_cache", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Entries whose fuzzy key equals the fuzzy form of `query`.
    pub fn find_fuzzy(&self, query: &str, limit: usize) -> AppResult<Vec<GeoCacheEntry>> {
        let target = fuzzy_normalize(query);
        if target.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        let conn = self.db.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SELECT_COLUMNS} FROM geo_cache ORDER BY address_norm"
        ))?;
        let mut rows = stmt.query([])?;
        let mut matches = Vec::new();
        while let Some(row) = rows.next()? {
            let key: String = row.get(0)?;
            if fuzzy_normalize(&key) == target {
                matches.push(parse_entry(row)?);
                if matches.len() == limit {
                    break;
                }
            }
        }
        Ok(matches)
    }
}

fn parse_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<GeoCacheEntry> {
    Ok(GeoCacheEntry {
        address_norm: row.get(0)?,
        lat: row.get(1)?,
        lon: row.get(2)?,
        source: row.get(3)?,
        precision: row.get(4)?,
        region_ok: row.get(5)?,
        first_seen: row.get(6)?,
        last_seen: row.get(7)?,
    })
}
