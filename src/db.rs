use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OpenFlags};
use tracing::info;

use crate::errors::{AppError, AppResult};

/// Upper bound of bound parameters per bulk statement. SQLite builds older than
/// 3.32 cap host parameters at 999.
pub const MAX_BIND_PARAMS: usize = 500;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub struct DatabaseContext {
    pub connection: Connection,
    pub path: PathBuf,
}

pub fn bootstrap<P: AsRef<Path>>(data_dir: P, database_file: &str) -> AppResult<DatabaseContext> {
    let data_dir = data_dir.as_ref();
    if database_file.trim().is_empty() {
        return Err(AppError::Config("database file name is empty".into()));
    }
    std::fs::create_dir_all(data_dir)?;
    let db_path = data_dir.join(database_file);

    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE;
    let connection = Connection::open_with_flags(&db_path, flags)?;
    configure(&connection)?;
    run_migrations(&connection)?;
    info!(
        target: "database_bootstrap",
        path = %db_path.display(),
        "geocode cache database ready"
    );

    Ok(DatabaseContext {
        connection,
        path: db_path,
    })
}

pub fn open_in_memory() -> AppResult<Connection> {
    let connection = Connection::open_in_memory()?;
    configure(&connection)?;
    run_migrations(&connection)?;
    Ok(connection)
}

fn configure(connection: &Connection) -> AppResult<()> {
    connection.busy_timeout(BUSY_TIMEOUT)?;
    connection.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        "#,
    )?;
    Ok(())
}

fn run_migrations(connection: &Connection) -> AppResult<()> {
    connection.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS geo_cache (
            address_norm TEXT PRIMARY KEY,
            lat REAL NOT NULL,
            lon REAL NOT NULL
        );

        CREATE TABLE IF NOT EXISTS geo_alias (
            address_norm TEXT PRIMARY KEY,
            canonical_norm TEXT NOT NULL,
            created_by TEXT,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS geo_audit (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            action TEXT NOT NULL,
            query TEXT NOT NULL,
            canonical TEXT,
            actor TEXT,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS geo_fail (
            address_norm TEXT PRIMARY KEY,
            reason TEXT NOT NULL,
            until TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS manual_queue (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            address_norm TEXT NOT NULL,
            raw_address TEXT NOT NULL,
            reason TEXT NOT NULL,
            note TEXT,
            status TEXT NOT NULL DEFAULT 'open' CHECK (status IN ('open', 'closed')),
            created_at TEXT NOT NULL,
            closed_at TEXT
        );

        CREATE TRIGGER IF NOT EXISTS geo_audit_no_update
        BEFORE UPDATE ON geo_audit
        BEGIN
            SELECT RAISE(ABORT, 'geo_audit is append-only');
        END;

        CREATE TRIGGER IF NOT EXISTS geo_audit_no_delete
        BEFORE DELETE ON geo_audit
        BEGIN
            SELECT RAISE(ABORT, 'geo_audit is append-only');
        END;
        "#,
    )?;

    // Older caches only carried (address_norm, lat, lon).
    ensure_column(
        connection,
        "geo_cache",
        "source TEXT NOT NULL DEFAULT 'geocoder'",
    )?;
    ensure_column(connection, "geo_cache", "precision TEXT")?;
    ensure_column(connection, "geo_cache", "region_ok INTEGER")?;
    ensure_column(connection, "geo_cache", "first_seen TEXT")?;
    ensure_column(connection, "geo_cache", "last_seen TEXT")?;
    ensure_column(connection, "geo_fail", "attempts INTEGER NOT NULL DEFAULT 1")?;
    // Older queues predate curator notes and the open/closed lifecycle.
    ensure_column(connection, "manual_queue", "note TEXT")?;
    ensure_column(connection, "manual_queue", "status TEXT NOT NULL DEFAULT 'open'")?;
    ensure_column(connection, "manual_queue", "closed_at TEXT")?;

    let now = Utc::now();
    connection.execute(
        "UPDATE geo_cache SET first_seen = ?1 WHERE first_seen IS NULL",
        [now],
    )?;
    connection.execute(
        "UPDATE geo_cache SET last_seen = first_seen WHERE last_seen IS NULL",
        [],
    )?;
    connection.execute_batch(
        r#"
        UPDATE geo_cache SET source = 'geocoder' WHERE source IS NULL OR source = 'geocoded';
        UPDATE manual_queue SET status = 'open' WHERE status IS NULL;
        UPDATE manual_queue SET raw_address = address_norm WHERE raw_address IS NULL;
        UPDATE manual_queue SET reason = 'unspecified' WHERE reason IS NULL;
        "#,
    )?;

    connection.execute_batch(
        r#"
        CREATE INDEX IF NOT EXISTS idx_geo_alias_canonical ON geo_alias(canonical_norm);
        CREATE INDEX IF NOT EXISTS idx_geo_fail_until ON geo_fail(until);
        CREATE INDEX IF NOT EXISTS idx_manual_queue_address ON manual_queue(address_norm);
        CREATE INDEX IF NOT EXISTS idx_manual_queue_status_created ON manual_queue(status, created_at);
        "#,
    )?;
    Ok(())
}

fn ensure_column(connection: &Connection, table: &str, definition: &str) -> AppResult<()> {
    let column_name = definition
        .split_whitespace()
        .next()
        .ok_or_else(|| AppError::Config(format!("invalid column definition: {definition}")))?;
    if column_exists(connection, table, column_name)? {
        return Ok(());
    }
    let sql = format!("ALTER TABLE {table} ADD COLUMN {definition}");
    connection.execute(&sql, [])?;
    Ok(())
}

pub(crate) fn column_exists(connection: &Connection, table: &str, column: &str) -> AppResult<bool> {
    let pragma = format!("PRAGMA table_info({table})");
    let mut stmt = connection.prepare(&pragma)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

/// `?1, ?2, …, ?n` for an `IN (…)` list.
pub(crate) fn placeholders(count: usize) -> String {
    (1..=count)
        .map(|idx| format!("?{idx}"))
        .collect::<Vec<_>>()
        .join(", ")
}

pub fn now_timestamp() -> DateTime<Utc> {
    Utc::now()
}
