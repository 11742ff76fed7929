//! Address keys.
//!
//! [`strict_normalize`] is the only function allowed to produce storage keys.
//! [`fuzzy_normalize`] is a tolerant comparison form for alias curation and
//! [`variants_of`] widens one lookup into a handful of candidate strict keys.

use once_cell::sync::Lazy;
use regex::Regex;
use unicode_normalization::UnicodeNormalization;

static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("whitespace pattern"));

static ORTSTEIL_SUFFIX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\s*(?:[,/]\s*|\(\s*)?\b(?:OT|Ortsteil)\s+[^,()/]+\)?\s*$")
        .expect("ortsteil pattern")
});

/// Applied in order after lower-casing.
static ABBREVIATIONS: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    [
        (r"str\.", "straße"),
        (r"strasse\b", "straße"),
        (r"all?e?\.", "allee"),
        (r"pl\.", "platz"),
        (r"weg\.", "weg"),
        (r"chaussee\.", "chaussee"),
    ]
    .into_iter()
    .map(|(pattern, replacement)| (Regex::new(pattern).expect("abbreviation pattern"), replacement))
    .collect()
});

/// Classic UTF-8-read-as-Latin-1 sequences plus lossy `??` renderings.
const MOJIBAKE_FIXES: &[(&str, &str)] = &[
    ("Ã¤", "ä"),
    ("Ã¶", "ö"),
    ("Ã¼", "ü"),
    ("ÃŸ", "ß"),
    ("Ã„", "Ä"),
    ("Ã–", "Ö"),
    ("Ãœ", "Ü"),
    ("Ã©", "é"),
    ("Stra??e", "Straße"),
    ("stra??e", "straße"),
];

const MAX_VARIANTS: usize = 4;

pub fn strict_normalize(raw: &str) -> String {
    let composed: String = raw.nfc().collect();
    WHITESPACE.replace_all(&composed, " ").trim().to_string()
}

pub fn fuzzy_normalize(raw: &str) -> String {
    let mut value = strict_normalize(raw).to_lowercase();
    for (pattern, replacement) in ABBREVIATIONS.iter() {
        value = pattern.replace_all(&value, *replacement).into_owned();
    }
    WHITESPACE.replace_all(&value, " ").trim().to_string()
}

/// One way of deriving an alternative lookup form from an address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariantRule {
    Plain,
    CompanyPrefixed,
    StripOrtsteil,
    RepairMojibake,
}

pub const VARIANT_RULES: [VariantRule; 4] = [
    VariantRule::Plain,
    VariantRule::CompanyPrefixed,
    VariantRule::StripOrtsteil,
    VariantRule::RepairMojibake,
];

impl VariantRule {
    pub fn as_str(&self) -> &'static str {
        match self {
            VariantRule::Plain => "plain",
            VariantRule::CompanyPrefixed => "company_prefixed",
            VariantRule::StripOrtsteil => "strip_ortsteil",
            VariantRule::RepairMojibake => "repair_mojibake",
        }
    }

    /// Returns the strict key this rule derives, or `None` when the rule does not apply.
    pub fn apply(&self, address: &str, company_name: Option<&str>) -> Option<String> {
        let address = strict_normalize(address);
        let derived = match self {
            VariantRule::Plain => Some(address),
            VariantRule::CompanyPrefixed => company_name
                .map(strict_normalize)
                .filter(|company| !company.is_empty() && !address.is_empty())
                .map(|company| format!("{company}, {address}")),
            VariantRule::StripOrtsteil => {
                let stripped = ORTSTEIL_SUFFIX.replace(&address, "");
                let stripped = stripped.trim_end_matches([',', ' ', '/']);
                (stripped != address).then(|| stripped.to_string())
            }
            VariantRule::RepairMojibake => {
                let repaired = repair_mojibake(&address);
                (repaired != address).then_some(repaired)
            }
        };
        derived
            .map(|value| strict_normalize(&value))
            .filter(|value| !value.is_empty())
    }
}

pub fn repair_mojibake(value: &str) -> String {
    let mut repaired = value.to_string();
    for (bad, good) in MOJIBAKE_FIXES {
        if repaired.contains(bad) {
            repaired = repaired.replace(bad, good);
        }
    }
    repaired
}

/// Candidate strict keys for one lookup, primary key first, without duplicates.
pub fn variants_of(address: &str, company_name: Option<&str>) -> Vec<String> {
    let mut keys: Vec<String> = Vec::with_capacity(MAX_VARIANTS);
    for rule in VARIANT_RULES {
        if let Some(key) = rule.apply(address, company_name) {
            if !keys.contains(&key) {
                keys.push(key);
            }
        }
        if keys.len() == MAX_VARIANTS {
            break;
        }
    }
    keys
}
