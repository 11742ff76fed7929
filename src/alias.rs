use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params_from_iter, Connection, OptionalExtension, Transaction};
use serde::Serialize;
use tracing::{debug, info};

use crate::db::{self, placeholders, MAX_BIND_PARAMS};
use crate::errors::{AppError, AppResult};
use crate::geo_cache::{GeoCacheEntry, GeoCacheStore};
use crate::normalize::strict_normalize;

const ACTION_SET: &str = "alias_set";
const ACTION_REMOVE: &str = "alias_remove";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AliasMapping {
    pub address_norm: String,
    pub canonical_norm: String,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditEntry {
    pub id: i64,
    pub action: String,
    pub query: String,
    pub canonical: Option<String>,
    pub actor: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AliasStats {
    pub alias_count: usize,
    pub audit_count: usize,
}

/// Curator-confirmed redirects from a variant key to a key already in the geo cache.
#[derive(Clone)]
pub struct AliasStore {
    db: Arc<Mutex<Connection>>,
    geo: GeoCacheStore,
}

impl AliasStore {
    pub fn new(db: Arc<Mutex<Connection>>) -> Self {
        let geo = GeoCacheStore::new(db.clone());
        Self { db, geo }
    }

    pub fn set_alias(
        &self,
        query: &str,
        canonical: &str,
        actor: Option<&str>,
    ) -> AppResult<AliasMapping> {
        let query_key = strict_normalize(query);
        let canonical_key = strict_normalize(canonical);
        if query_key.is_empty() || canonical_key.is_empty() {
            return Err(AppError::AliasInvalid(
                "query and canonical must not be empty".into(),
            ));
        }
        if query_key == canonical_key {
            return Err(AppError::AliasInvalid(format!(
                "{query_key} already normalizes to {canonical_key}"
            )));
        }

        let now = db::now_timestamp();
        let mut conn = self.db.lock();
        let tx = conn.transaction()?;
        let canonical_exists: Option<i64> = tx
            .query_row(
                "SELECT 1 FROM geo_cache WHERE address_norm = ?1",
                [canonical_key.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        if canonical_exists.is_none() {
            return Err(AppError::AliasInvalid(format!(
                "canonical {canonical_key} is not in the geo cache"
            )));
        }

        tx.execute(
            "INSERT INTO geo_alias (address_norm, canonical_norm, created_by, created_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(address_norm) DO UPDATE SET
                canonical_norm = excluded.canonical_norm,
                created_by = excluded.created_by,
                created_at = excluded.created_at",
            (query_key.as_str(), canonical_key.as_str(), actor, now),
        )?;
        append_audit(&tx, ACTION_SET, &query_key, Some(&canonical_key), actor, now)?;
        tx.commit()?;

        info!(
            target: "alias_store",
            query = %query_key,
            canonical = %canonical_key,
            actor = actor.unwrap_or("-"),
            "alias set"
        );
        Ok(AliasMapping {
            address_norm: query_key,
            canonical_norm: canonical_key,
            created_by: actor.map(str::to_string),
            created_at: now,
        })
    }

    /// Deletes the mapping if present. The removal is audited either way.
    pub fn remove_alias(&self, query: &str, actor: Option<&str>) -> AppResult<bool> {
        let query_key = strict_normalize(query);
        if query_key.is_empty() {
            return Err(AppError::AliasInvalid("query must not be empty".into()));
        }

        let now = db::now_timestamp();
        let mut conn = self.db.lock();
        let tx = conn.transaction()?;
        let previous: Option<String> = tx
            .query_row(
                "SELECT canonical_norm FROM geo_alias WHERE address_norm = ?1",
                [query_key.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        let removed = tx.execute(
            "DELETE FROM geo_alias WHERE address_norm = ?1",
            [query_key.as_str()],
        )?;
        append_audit(
            &tx,
            ACTION_REMOVE,
            &query_key,
            previous.as_deref(),
            actor,
            now,
        )?;
        tx.commit()?;

        debug!(
            target: "alias_store",
            query = %query_key,
            removed = removed > 0,
            "alias removed"
        );
        Ok(removed > 0)
    }

    pub fn lookup(&self, query: &str) -> AppResult<Option<AliasMapping>> {
        let query_key = strict_normalize(query);
        if query_key.is_empty() {
            return Ok(None);
        }
        let conn = self.db.lock();
        conn.query_row(
            "SELECT address_norm, canonical_norm, created_by, created_at
            FROM geo_alias WHERE address_norm = ?1",
            [query_key.as_str()],
            parse_mapping,
        )
        .optional()
        .map_err(AppError::from)
    }

    /// Maps each key that has an alias to its canonical key, keyed by strict key.
    pub fn resolve_aliases<I, S>(&self, keys: I) -> AppResult<HashMap<String, String>>
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

        let conn = self.db.lock();
        let mut out = HashMap::new();
        for chunk in keys.chunks(MAX_BIND_PARAMS) {
            let sql = format!(
                "SELECT address_norm, canonical_norm FROM geo_alias WHERE address_norm IN ({})",
                placeholders(chunk.len())
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(chunk.iter()), |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
            for row in rows {
                let (query, canonical) = row?;
                out.insert(query, canonical);
            }
        }
        Ok(out)
    }

    /// Cached entries a curator could alias `query` to.
    pub fn suggest(&self, query: &str, limit: usize) -> AppResult<Vec<GeoCacheEntry>> {
        let query_key = strict_normalize(query);
        let mut suggestions = self.geo.find_fuzzy(&query_key, limit.saturating_add(1))?;
        suggestions.retain(|entry| entry.address_norm != query_key);
        suggestions.truncate(limit);
        Ok(suggestions)
    }

    pub fn recent_audit(&self, limit: usize) -> AppResult<Vec<AuditEntry>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(
            "SELECT id, action, query, canonical, actor, created_at
            FROM geo_audit ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map([limit as i64], |row| {
                Ok(AuditEntry {
                    id: row.get(0)?,
                    action: row.get(1)?,
                    query: row.get(2)?,
                    canonical: row.get(3)?,
                    actor: row.get(4)?,
                    created_at: row.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn stats(&self) -> AppResult<AliasStats> {
        let conn = self.db.lock();
        let alias_count: i64 =
            conn.query_row("SELECT COUNT(*) FROM geo_alias", [], |row| row.get(0))?;
        let audit_count: i64 =
            conn.query_row("SELECT COUNT(*) FROM geo_audit", [], |row| row.get(0))?;
        Ok(AliasStats {
            alias_count: alias_count as usize,
            audit_count: audit_count as usize,
        })
    }
}

fn append_audit(
    tx: &Transaction<'_>,
    action: &str,
    query: &str,
    canonical: Option<&str>,
    actor: Option<&str>,
    at: DateTime<Utc>,
) -> AppResult<()> {
    tx.execute(
        "INSERT INTO geo_audit (action, query, canonical, actor, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5)",
        (action, query, canonical, actor, at),
    )?;
    Ok(())
}

fn parse_mapping(row: &rusqlite::Row<'_>) -> rusqlite::Result<AliasMapping> {
    Ok(AliasMapping {
        address_norm: row.get(0)?,
        canonical_norm: row.get(1)?,
        created_by: row.get(2)?,
        created_at: row.get(3)?,
    })
}
