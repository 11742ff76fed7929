use std::path::PathBuf;
use std::{env, io};

use secrecy::SecretString;
use serde::Serialize;
use tracing::debug;

const DEFAULT_DATABASE_FILE: &str = "geocache.db";
const DEFAULT_GEOCODER_BASE: &str = "https://nominatim.openstreetmap.org/search";
const DEFAULT_MAPBOX_BASE: &str = "https://api.mapbox.com";
const DEFAULT_FAIL_CACHE_BASE_MINUTES: u64 = 10;
const DEFAULT_FAIL_CACHE_MAX_MINUTES: u64 = 24 * 60;
/// Longest fail-cache window accepted from the environment: one year.
pub const MAX_FAIL_CACHE_MINUTES: u64 = 365 * 24 * 60;
const DEFAULT_GEOCODER_BACKOFF_BASE_MS: u64 = 500;
const DEFAULT_GEOCODER_BACKOFF_MAX_MS: u64 = 8_000;
const DEFAULT_SERVICE_REGIONS: &[&str] = &["Sachsen", "Thüringen", "Sachsen-Anhalt"];

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database_file_name: String,
    pub geocoder_base_url: String,
    pub geocoder_contact: Option<String>,
    pub geocoder_country_codes: Option<String>,
    pub geocoder_rate_limit_qps: u32,
    pub geocoder_timeout_secs: u64,
    pub geocoder_max_attempts: u32,
    pub geocoder_backoff_base_ms: u64,
    pub geocoder_backoff_max_ms: u64,
    pub mapbox_token: Option<SecretString>,
    pub mapbox_base_url: String,
    pub fail_cache_base_minutes: u64,
    pub fail_cache_max_minutes: u64,
    pub fail_cache_on_miss: bool,
    pub manual_queue_dedup: bool,
    pub service_regions: Vec<String>,
    pub synonyms_file: Option<PathBuf>,
}

#[derive(Clone, Debug, Serialize)]
pub struct PublicAppConfig {
    pub database_file_name: String,
    pub geocoder_base_url: String,
    pub geocoder_rate_limit_qps: u32,
    pub geocoder_timeout_secs: u64,
    pub geocoder_max_attempts: u32,
    pub geocoder_backoff_base_ms: u64,
    pub geocoder_backoff_max_ms: u64,
    pub has_mapbox_token: bool,
    pub fail_cache_base_minutes: u64,
    pub fail_cache_max_minutes: u64,
    pub fail_cache_on_miss: bool,
    pub manual_queue_dedup: bool,
    pub service_regions: Vec<String>,
    pub synonyms_file: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_file_name: DEFAULT_DATABASE_FILE.to_string(),
            geocoder_base_url: DEFAULT_GEOCODER_BASE.to_string(),
            geocoder_contact: None,
            geocoder_country_codes: Some("de".to_string()),
            geocoder_rate_limit_qps: 1,
            geocoder_timeout_secs: 20,
            geocoder_max_attempts: 3,
            geocoder_backoff_base_ms: DEFAULT_GEOCODER_BACKOFF_BASE_MS,
            geocoder_backoff_max_ms: DEFAULT_GEOCODER_BACKOFF_MAX_MS,
            mapbox_token: None,
            mapbox_base_url: DEFAULT_MAPBOX_BASE.to_string(),
            fail_cache_base_minutes: DEFAULT_FAIL_CACHE_BASE_MINUTES,
            fail_cache_max_minutes: DEFAULT_FAIL_CACHE_MAX_MINUTES,
            fail_cache_on_miss: true,
            manual_queue_dedup: true,
            service_regions: DEFAULT_SERVICE_REGIONS
                .iter()
                .map(|region| region.to_string())
                .collect(),
            synonyms_file: None,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        load_dotenv_if_applicable();
        let defaults = Self::default();
        let (fail_cache_base_minutes, fail_cache_max_minutes) = clamp_fail_cache_minutes(
            parse_u64("FAIL_CACHE_BASE_MINUTES", defaults.fail_cache_base_minutes),
            parse_u64("FAIL_CACHE_MAX_MINUTES", defaults.fail_cache_max_minutes),
        );
        let backoff_base_ms = parse_u64(
            "GEOCODER_BACKOFF_BASE_MS",
            defaults.geocoder_backoff_base_ms,
        )
        .clamp(1, 60_000);
        Self {
            database_file_name: env::var("GEOCACHE_DATABASE_FILE")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .unwrap_or(defaults.database_file_name),
            geocoder_base_url: env::var("GEOCODER_BASE")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .unwrap_or(defaults.geocoder_base_url),
            geocoder_contact: parse_optional("GEOCODER_CONTACT"),
            geocoder_country_codes: parse_optional("GEOCODER_COUNTRY_CODES")
                .or(defaults.geocoder_country_codes),
            geocoder_rate_limit_qps: parse_u32("GEOCODER_RPS", defaults.geocoder_rate_limit_qps)
                .max(1),
            geocoder_timeout_secs: parse_u64("GEOCODER_TIMEOUT_S", defaults.geocoder_timeout_secs),
            geocoder_max_attempts: parse_u32(
                "GEOCODER_MAX_ATTEMPTS",
                defaults.geocoder_max_attempts,
            )
            .max(1),
            geocoder_backoff_base_ms: backoff_base_ms,
            geocoder_backoff_max_ms: parse_u64(
                "GEOCODER_BACKOFF_MAX_MS",
                defaults.geocoder_backoff_max_ms,
            )
            .clamp(backoff_base_ms, 10 * 60_000),
            mapbox_token: parse_optional("MAPBOX_ACCESS_TOKEN").map(SecretString::from),
            mapbox_base_url: env::var("MAPBOX_BASE")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .unwrap_or(defaults.mapbox_base_url),
            fail_cache_base_minutes,
            fail_cache_max_minutes,
            fail_cache_on_miss: parse_bool("FAIL_CACHE_ON_MISS", defaults.fail_cache_on_miss),
            manual_queue_dedup: parse_bool("MANUAL_QUEUE_DEDUP", defaults.manual_queue_dedup),
            service_regions: parse_optional("GEOCACHE_SERVICE_REGIONS")
                .map(|v| parse_list(&v))
                .unwrap_or(defaults.service_regions),
            synonyms_file: parse_optional("GEOCACHE_SYNONYMS_FILE").map(PathBuf::from),
        }
    }

    pub fn public_profile(&self) -> PublicAppConfig {
        PublicAppConfig {
            database_file_name: self.database_file_name.clone(),
            geocoder_base_url: self.geocoder_base_url.clone(),
            geocoder_rate_limit_qps: self.geocoder_rate_limit_qps,
            geocoder_timeout_secs: self.geocoder_timeout_secs,
            geocoder_max_attempts: self.geocoder_max_attempts,
            geocoder_backoff_base_ms: self.geocoder_backoff_base_ms,
            geocoder_backoff_max_ms: self.geocoder_backoff_max_ms,
            has_mapbox_token: self.mapbox_token.is_some(),
            fail_cache_base_minutes: self.fail_cache_base_minutes,
            fail_cache_max_minutes: self.fail_cache_max_minutes,
            fail_cache_on_miss: self.fail_cache_on_miss,
            manual_queue_dedup: self.manual_queue_dedup,
            service_regions: self.service_regions.clone(),
            synonyms_file: self
                .synonyms_file
                .as_ref()
                .map(|path| path.to_string_lossy().to_string()),
        }
    }
}

/// Keeps the fail-cache base in `1..=MAX_FAIL_CACHE_MINUTES` and the cap between
/// the base and the same ceiling.
pub fn clamp_fail_cache_minutes(base: u64, max: u64) -> (u64, u64) {
    let base = base.clamp(1, MAX_FAIL_CACHE_MINUTES);
    (base, max.clamp(base, MAX_FAIL_CACHE_MINUTES))
}

fn load_dotenv_if_applicable() {
    if !should_load_dotenv() {
        debug!("skipping .env load outside dev mode");
        return;
    }

    if let Err(err) = dotenvy::dotenv() {
        match &err {
            dotenvy::Error::Io(io_err) if io_err.kind() == io::ErrorKind::NotFound => {}
            _ => debug!(?err, "unable to load .env file"),
        }
    }
}

fn should_load_dotenv() -> bool {
    cfg!(debug_assertions) || parse_bool("ALLOW_DOTENV", false)
}

fn parse_optional(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|item| item.trim().to_string())
        .filter(|item| !item.is_empty())
        .collect()
}

fn parse_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(default)
}

fn parse_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn parse_u32(key: &str, default: u32) -> u32 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u32>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_public_profile_without_secrets() {
        env::set_var("MAPBOX_ACCESS_TOKEN", "secret");
        env::set_var("GEOCACHE_DATABASE_FILE", "custom.db");
        env::set_var("MANUAL_QUEUE_DEDUP", "false");
        env::set_var("GEOCODER_RPS", "0");
        env::set_var("GEOCACHE_SERVICE_REGIONS", "Sachsen, Brandenburg ,");

        let config = AppConfig::from_env();
        let public = config.public_profile();

        assert_eq!(public.database_file_name, "custom.db");
        assert!(!public.manual_queue_dedup);
        assert!(public.has_mapbox_token);
        assert!(config.mapbox_token.is_some());
        assert_eq!(public.geocoder_rate_limit_qps, 1);
        assert_eq!(public.service_regions, vec!["Sachsen", "Brandenburg"]);
        assert_eq!(
            public.fail_cache_base_minutes,
            DEFAULT_FAIL_CACHE_BASE_MINUTES
        );

        let serialized = serde_json::to_string(&public).unwrap();
        assert!(!serialized.contains("secret"));
    }

    #[test]
    fn defaults_cover_saxony_region() {
        let config = AppConfig::default();
        assert!(config.service_regions.iter().any(|r| r == "Sachsen"));
        assert!(config.fail_cache_on_miss);
        assert_eq!(config.geocoder_max_attempts, 3);
        assert!(config.geocoder_backoff_base_ms <= config.geocoder_backoff_max_ms);
    }

    #[test]
    fn clamps_fail_cache_minutes() {
        assert_eq!(
            clamp_fail_cache_minutes(u64::MAX, u64::MAX),
            (MAX_FAIL_CACHE_MINUTES, MAX_FAIL_CACHE_MINUTES)
        );
        assert_eq!(clamp_fail_cache_minutes(0, 0), (1, 1));
        assert_eq!(clamp_fail_cache_minutes(30, 5), (30, 30));
        assert_eq!(clamp_fail_cache_minutes(10, 1440), (10, 1440));
    }
}
