use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use rusqlite::{params_from_iter, Connection, OptionalExtension, TransactionBehavior};
use serde::Serialize;
use tracing::{debug, info};

use crate::config::{clamp_fail_cache_minutes, AppConfig};
use crate::db::{self, placeholders, MAX_BIND_PARAMS};
use crate::errors::{AppError, AppResult};
use crate::normalize::strict_normalize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailCacheEntry {
    pub address_norm: String,
    pub reason: String,
    pub until: DateTime<Utc>,
    pub attempts: u32,
    pub updated_at: DateTime<Utc>,
}

impl FailCacheEntry {
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        now < self.until
    }
}

#[derive(Debug, Clone, Default)]
pub struct FailFilter {
    pub active_only: bool,
    pub reason: Option<String>,
    /// Substring of the stored key.
    pub query: Option<String>,
    pub limit: Option<usize>,
}

impl FailFilter {
    pub fn active() -> Self {
        Self {
            active_only: true,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailCacheStats {
    pub total: usize,
    pub active: usize,
    pub by_reason: BTreeMap<String, usize>,
}

/// Retry window growth: `base * 2^(attempts - 1)`, never above `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
}

impl BackoffPolicy {
    pub fn from_config(config: &AppConfig) -> Self {
        let (base_minutes, max_minutes) =
            clamp_fail_cache_minutes(config.fail_cache_base_minutes, config.fail_cache_max_minutes);
        Self {
            base: Duration::minutes(base_minutes as i64),
            max: Duration::minutes(max_minutes as i64),
        }
    }

    pub fn window(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(30);
        let factor = 1_i32 << exponent;
        self.base
            .checked_mul(factor)
            .map(|window| window.min(self.max))
            .unwrap_or(self.max)
    }

    /// `now + window(attempts)`, saturating at the latest representable instant.
    pub fn expiry_after(&self, now: DateTime<Utc>, attempts: u32) -> DateTime<Utc> {
        now.checked_add_signed(self.window(attempts))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

/// Negative cache. Expiry is evaluated at read time against a bound `now`.
#[derive(Clone)]
pub struct FailCacheStore {
    db: Arc<Mutex<Connection>>,
    policy: BackoffPolicy,
}

impl FailCacheStore {
    pub fn new(db: Arc<Mutex<Connection>>, policy: BackoffPolicy) -> Self {
        Self { db, policy }
    }

    pub fn policy(&self) -> BackoffPolicy {
        self.policy
    }

    /// Upserts an entry with an explicit expiry. Each call extends the attempt streak.
    pub fn mark_failed(
        &self,
        key: &str,
        reason: &str,
        until: DateTime<Utc>,
    ) -> AppResult<FailCacheEntry> {
        let key = strict_normalize(key);
        if key.is_empty() {
            return Err(AppError::EmptyKey);
        }
        let now = db::now_timestamp();
        let mut conn = self.db.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO geo_fail (address_norm, reason, until, attempts, updated_at)
            VALUES (?1, ?2, ?3, 1, ?4)
            ON CONFLICT(address_norm) DO UPDATE SET
                reason = excluded.reason,
                until = excluded.until,
                attempts = geo_fail.attempts + 1,
                updated_at = excluded.updated_at",
            (key.as_str(), reason, until, now),
        )?;
        let entry = tx.query_row(
            "SELECT address_norm, reason, until, attempts, updated_at
            FROM geo_fail WHERE address_norm = ?1",
            [key.as_str()],
            parse_entry,
        )?;
        tx.commit()?;

        debug!(
            target: "fail_cache",
            key = %entry.address_norm,
            reason,
            until = %entry.until,
            attempts = entry.attempts,
            "address marked as failed"
        );
        Ok(entry)
    }

    /// Records a failure and derives `until` from the attempt streak.
    pub fn record_failure(&self, key: &str, reason: &str) -> AppResult<FailCacheEntry> {
        let key = strict_normalize(key);
        if key.is_empty() {
            return Err(AppError::EmptyKey);
        }
        let now = db::now_timestamp();
        let mut conn = self.db.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let previous: Option<u32> = tx
            .query_row(
                "SELECT attempts FROM geo_fail WHERE address_norm = ?1",
                [key.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        let attempts = previous.unwrap_or(0).saturating_add(1);
        let until = self.policy.expiry_after(now, attempts);
        tx.execute(
            "INSERT INTO geo_fail (address_norm, reason, until, attempts, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(address_norm) DO UPDATE SET
                reason = excluded.reason,
                until = excluded.until,
                attempts = excluded.attempts,
                updated_at = excluded.updated_at",
            (key.as_str(), reason, until, attempts, now),
        )?;
        tx.commit()?;

        info!(
            target: "fail_cache",
            key = %key,
            reason,
            attempts,
            until = %until,
            "geocode failure cached"
        );
        Ok(FailCacheEntry {
            address_norm: key,
            reason: reason.to_string(),
            until,
            attempts,
            updated_at: now,
        })
    }

    pub fn get(&self, key: &str) -> AppResult<Option<FailCacheEntry>> {
        let key = strict_normalize(key);
        if key.is_empty() {
            return Ok(None);
        }
        let conn = self.db.lock();
        conn.query_row(
            "SELECT address_norm, reason, until, attempts, updated_at
            FROM geo_fail WHERE address_norm = ?1",
            [key.as_str()],
            parse_entry,
        )
        .optional()
        .map_err(AppError::from)
    }

    pub fn active_entry(&self, key: &str) -> AppResult<Option<FailCacheEntry>> {
        let now = db::now_timestamp();
        Ok(self.get(key)?.filter(|entry| entry.is_active_at(now)))
    }

    pub fn is_active(&self, key: &str) -> AppResult<bool> {
        Ok(self.active_entry(key)?.is_some())
    }

    /// Newest first.
    pub fn list_active(&self, filter: &FailFilter) -> AppResult<Vec<FailCacheEntry>> {
        let mut sql = String::from(
            "SELECT address_norm, reason, until, attempts, updated_at FROM geo_fail WHERE 1 = 1",
        );
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        if filter.active_only {
            params.push(Box::new(db::now_timestamp()));
            sql.push_str(&format!(" AND until > ?{}", params.len()));
        }
        if let Some(reason) = filter.reason.as_deref().map(str::trim).filter(|r| !r.is_empty()) {
            params.push(Box::new(reason.to_string()));
            sql.push_str(&format!(" AND reason = ?{}", params.len()));
        }
        if let Some(query) = filter.query.as_deref().map(str::trim).filter(|q| !q.is_empty()) {
            params.push(Box::new(format!("%{}%", escape_like(query))));
            sql.push_str(&format!(
                " AND address_norm LIKE ?{} ESCAPE '\\'",
                params.len()
            ));
        }
        sql.push_str(" ORDER BY updated_at DESC, address_norm ASC");
        if let Some(limit) = filter.limit {
            params.push(Box::new(limit as i64));
            sql.push_str(&format!(" LIMIT ?{}", params.len()));
        }

        let conn = self.db.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(params.iter()), parse_entry)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Deletes the given keys and returns how many rows went away.
    pub fn clear<I, S>(&self, keys: I) -> AppResult<usize>
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
            return Ok(0);
        }

        let mut conn = self.db.lock();
        let tx = conn.transaction()?;
        let mut removed = 0;
        for chunk in keys.chunks(MAX_BIND_PARAMS) {
            let sql = format!(
                "DELETE FROM geo_fail WHERE address_norm IN ({})",
                placeholders(chunk.len())
            );
            removed += tx.execute(&sql, params_from_iter(chunk.iter()))?;
        }
        tx.commit()?;
        if removed > 0 {
            debug!(target: "fail_cache", removed, "fail cache entries cleared");
        }
        Ok(removed)
    }

    pub fn clear_all(&self) -> AppResult<usize> {
        let conn = self.db.lock();
        let removed = conn.execute("DELETE FROM geo_fail", [])?;
        info!(target: "fail_cache", removed, "fail cache emptied");
        Ok(removed)
    }

    /// Drops expired rows. Their attempt streaks are forgotten with them.
    pub fn purge_expired(&self) -> AppResult<usize> {
        let conn = self.db.lock();
        let removed = conn.execute(
            "DELETE FROM geo_fail WHERE until <= ?1",
            [db::now_timestamp()],
        )?;
        Ok(removed)
    }

    pub fn stats(&self) -> AppResult<FailCacheStats> {
        let now = db::now_timestamp();
        let conn = self.db.lock();
        let (total, active): (i64, i64) = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(CASE WHEN until > ?1 THEN 1 ELSE 0 END), 0) FROM geo_fail",
            [now],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        let mut stmt = conn.prepare("SELECT reason, COUNT(*) FROM geo_fail GROUP BY reason")?;
        let by_reason = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as usize))
            })?
            .collect::<Result<BTreeMap<_, _>, _>>()?;
        Ok(FailCacheStats {
            total: total as usize,
            active: active as usize,
            by_reason,
        })
    }
}

fn escape_like(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

fn parse_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<FailCacheEntry> {
    Ok(FailCacheEntry {
        address_norm: row.get(0)?,
        reason: row.get(1)?,
        until: row.get(2)?,
        attempts: row.get(3)?,
        updated_at: row.get(4)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MAX_FAIL_CACHE_MINUTES;
    use crate::db::open_in_memory;

    fn store() -> FailCacheStore {
        FailCacheStore::new(
            Arc::new(Mutex::new(open_in_memory().unwrap())),
            BackoffPolicy::default(),
        )
    }

    #[test]
    fn active_depends_on_expiry() {
        let store = store();
        let now = Utc::now();
        store
            .mark_failed("Nirgendwo 1", "geocode_miss", now + Duration::hours(1))
            .unwrap();
        store
            .mark_failed("Nirgendwo 2", "geocode_miss", now - Duration::hours(1))
            .unwrap();

        assert!(store.is_active("Nirgendwo 1").unwrap());
        assert!(!store.is_active("Nirgendwo 2").unwrap());
        assert!(!store.is_active("Unbekannt").unwrap());
        assert!(store.get("Nirgendwo 2").unwrap().is_some());

        let active = store.list_active(&FailFilter::active()).unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].address_norm, "Nirgendwo 1");
        assert_eq!(store.list_active(&FailFilter::default()).unwrap().len(), 2);
    }

    #[test]
    fn mark_failed_upserts_and_counts_attempts() {
        let store = store();
        let until = Utc::now() + Duration::minutes(5);
        store.mark_failed("Nirgendwo 1", "temp_error", until).unwrap();
        let entry = store
            .mark_failed("Nirgendwo 1", "geocode_miss", until)
            .unwrap();
        assert_eq!(entry.attempts, 2);
        assert_eq!(entry.reason, "geocode_miss");
        assert_eq!(store.stats().unwrap().total, 1);
    }

    #[test]
    fn filters_by_reason_and_substring() {
        let store = store();
        let until = Utc::now() + Duration::hours(1);
        store.mark_failed("Am Hang 5, Pirna", "geocode_miss", until).unwrap();
        store.mark_failed("Am Hang 7, Heidenau", "temp_error", until).unwrap();
        store.mark_failed("100%_Weg 1", "geocode_miss", until).unwrap();

        let filter = FailFilter {
            reason: Some("geocode_miss".into()),
            ..FailFilter::active()
        };
        assert_eq!(store.list_active(&filter).unwrap().len(), 2);

        let filter = FailFilter {
            query: Some("Am Hang".into()),
            ..FailFilter::default()
        };
        assert_eq!(store.list_active(&filter).unwrap().len(), 2);

        let filter = FailFilter {
            query: Some("%_".into()),
            ..FailFilter::default()
        };
        let hits = store.list_active(&filter).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].address_norm, "100%_Weg 1");

        let filter = FailFilter {
            limit: Some(1),
            ..FailFilter::default()
        };
        assert_eq!(store.list_active(&filter).unwrap().len(), 1);
    }

    #[test]
    fn clear_removes_in_bulk() {
        let store = store();
        let until = Utc::now() + Duration::hours(1);
        let keys: Vec<String> = (0..(MAX_BIND_PARAMS + 10))
            .map(|i| format!("Leer {i}"))
            .collect();
        for key in &keys {
            store.mark_failed(key, "geocode_miss", until).unwrap();
        }

        let mut to_clear = keys.clone();
        to_clear.push("Leer 0".into());
        to_clear.push("Gibt es nicht".into());
        assert_eq!(store.clear(&to_clear).unwrap(), keys.len());
        assert_eq!(store.stats().unwrap().total, 0);
        assert_eq!(store.clear(Vec::<String>::new()).unwrap(), 0);
    }

    #[test]
    fn backoff_grows_exponentially_and_caps() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.window(1), Duration::minutes(10));
        assert_eq!(policy.window(2), Duration::minutes(20));
        assert_eq!(policy.window(4), Duration::minutes(80));
        assert_eq!(policy.window(9), Duration::hours(24));
        assert_eq!(policy.window(200), Duration::hours(24));
    }

    #[test]
    fn absurd_configured_minutes_are_clamped() {
        let config = AppConfig {
            fail_cache_base_minutes: u64::MAX,
            fail_cache_max_minutes: u64::MAX,
            ..AppConfig::default()
        };
        let policy = BackoffPolicy::from_config(&config);
        let year = Duration::minutes(MAX_FAIL_CACHE_MINUTES as i64);
        assert_eq!(policy.base, year);
        assert_eq!(policy.window(1), year);
        assert_eq!(policy.window(u32::MAX), year);

        let now = Utc::now();
        assert_eq!(policy.expiry_after(now, 40), now + year);
        assert_eq!(
            policy.expiry_after(DateTime::<Utc>::MAX_UTC - Duration::days(1), 3),
            DateTime::<Utc>::MAX_UTC
        );
    }

    #[test]
    fn record_failure_tracks_streak_until_cleared() {
        let store = store();
        let first = store.record_failure("Nirgendwo 1", "geocode_miss").unwrap();
        assert_eq!(first.attempts, 1);
        let second = store.record_failure("Nirgendwo 1", "geocode_miss").unwrap();
        assert_eq!(second.attempts, 2);
        assert!(second.until - second.updated_at >= Duration::minutes(20));
        assert!(store.is_active("Nirgendwo 1").unwrap());

        store.clear(["Nirgendwo 1"]).unwrap();
        let fresh = store.record_failure("Nirgendwo 1", "geocode_miss").unwrap();
        assert_eq!(fresh.attempts, 1);
    }

    #[test]
    fn purges_expired_and_reports_stats() {
        let store = store();
        let now = Utc::now();
        store.mark_failed("Alt", "geocode_miss", now - Duration::minutes(1)).unwrap();
        store.mark_failed("Neu", "temp_error", now + Duration::minutes(30)).unwrap();

        let stats = store.stats().unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.active, 1);
        assert_eq!(stats.by_reason.get("temp_error"), Some(&1));

        assert_eq!(store.purge_expired().unwrap(), 1);
        assert!(store.get("Alt").unwrap().is_none());
        assert_eq!(store.clear_all().unwrap(), 1);
    }
}
