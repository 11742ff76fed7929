use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::errors::{AppError, AppResult};
use crate::geo_cache::validate_coordinates;
use crate::normalize::strict_normalize;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynonymTarget {
    pub resolved_address: String,
    pub lat: f64,
    pub lon: f64,
}

#[derive(Debug, Deserialize)]
struct SynonymRecord {
    triggers: Vec<String>,
    resolved_address: String,
    lat: f64,
    lon: f64,
}

/// Internal locations that never go through the cache or a geocoder.
#[derive(Debug, Clone, Default)]
pub struct SynonymTable {
    entries: HashMap<String, SynonymTarget>,
}

impl SynonymTable {
    pub fn builtin() -> Self {
        let mut table = Self::default();
        table.insert(
            &["Jochen - PF", "PF JOCHEN"],
            SynonymTarget {
                resolved_address: "Pf-Depot Jochen, Dresden".into(),
                lat: 51.0500,
                lon: 13.7373,
            },
        );
        table.insert(
            &["Sven - PF", "PF SVEN"],
            SynonymTarget {
                resolved_address: "Pf-Depot Sven, Dresden".into(),
                lat: 51.0600,
                lon: 13.7300,
            },
        );
        table
    }

    /// Loads `[{triggers, resolved_address, lat, lon}]`. Replaces the built-in entries.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let path = path.as_ref();
        let payload = std::fs::read_to_string(path)?;
        let records: Vec<SynonymRecord> = serde_json::from_str(&payload)?;

        let mut table = Self::default();
        for record in records {
            validate_coordinates(record.lat, record.lon)?;
            if record.triggers.iter().all(|t| strict_normalize(t).is_empty()) {
                return Err(AppError::Config(format!(
                    "synonym for {} has no usable trigger",
                    record.resolved_address
                )));
            }
            let triggers: Vec<&str> = record.triggers.iter().map(String::as_str).collect();
            table.insert(
                &triggers,
                SynonymTarget {
                    resolved_address: record.resolved_address,
                    lat: record.lat,
                    lon: record.lon,
                },
            );
        }
        info!(
            target: "resolver",
            path = %path.display(),
            triggers = table.len(),
            "loaded synonym table"
        );
        Ok(table)
    }

    fn insert(&mut self, triggers: &[&str], target: SynonymTarget) {
        for trigger in triggers {
            let key = strict_normalize(trigger);
            if !key.is_empty() {
                self.entries.insert(key, target.clone());
            }
        }
    }

    /// Exact trigger match on the address key, then on the company key.
    pub fn lookup(&self, raw_address: &str, company_name: Option<&str>) -> Option<&SynonymTarget> {
        let address_key = strict_normalize(raw_address);
        self.entries.get(&address_key).or_else(|| {
            company_name
                .map(strict_normalize)
                .and_then(|key| self.entries.get(&key))
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
