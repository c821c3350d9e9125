//! Source name canonicalization
//!
//! Device and app names in exports drift over time ("Jane’s iPhone 13 Pro",
//! "iPhone", "Apple Watch Series 7 (de-DE)"). They are reduced to a small
//! vocabulary by an ordered rule table; anything unmatched becomes
//! `ThirdParty:<cleaned name>`.

use crate::error::{AmbiguityKind, RecordError};
use hdx_common::{HdxError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};

pub const THIRD_PARTY_PREFIX: &str = "ThirdParty:";

/// `pattern` is matched case-insensitively as a substring
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRule {
    pub pattern: String,
    pub canonical: String,
}

impl SourceRule {
    pub fn new(pattern: impl Into<String>, canonical: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            canonical: canonical.into(),
        }
    }

    /// Built-in rules, highest priority first
    pub fn defaults() -> Vec<SourceRule> {
        vec![
            SourceRule::new("iphone", "iPhone"),
            SourceRule::new("watch", "Apple Watch"),
            SourceRule::new("ipad", "iPad"),
            SourceRule::new("airpods", "AirPods"),
        ]
    }
}

/// Trailing tokens removed before matching, applied until nothing changes
const SUFFIX_PATTERNS: [&str; 5] = [
    // locale variants: "en_US", "(de-DE)", "[fr_FR]"
    r"(?i)[\s_-]*[(\[]?\b[a-z]{2}[_-][a-z]{2}\b[)\]]?$",
    r"(?i)\s*\(\d+(st|nd|rd|th)\s+generation\)$",
    r"(?i)\s+series\s+\d+$",
    r"(?i)\s+\d+\s?mm$",
    r"(?i)\s+(pro|max|mini|plus|ultra|se|\d+)$",
];

#[derive(Debug, Clone)]
struct CompiledRule {
    pattern: String,
    canonical: String,
    canonical_lower: String,
}

/// Deterministic, idempotent source mapping
#[derive(Debug, Clone)]
pub struct SourceNormalizer {
    rules: Vec<CompiledRule>,
    suffixes: Vec<Regex>,
}

impl SourceNormalizer {
    pub fn new(rules: Vec<SourceRule>) -> Result<Self> {
        let suffixes = SUFFIX_PATTERNS
            .iter()
            .map(|p| Regex::new(p).map_err(|e| HdxError::config(e.to_string())))
            .collect::<Result<Vec<_>>>()?;

        let rules = rules
            .into_iter()
            .map(|rule| {
                let pattern = collapse_whitespace(&fold_typography(&rule.pattern)).to_lowercase();
                if pattern.is_empty() {
                    return Err(HdxError::config(format!(
                        "Source rule for '{}' has an empty pattern",
                        rule.canonical
                    )));
                }
                let canonical = collapse_whitespace(&fold_typography(&rule.canonical));
                if canonical.is_empty() || canonical.starts_with(THIRD_PARTY_PREFIX) {
                    return Err(HdxError::config(format!(
                        "Source rule '{}' has an invalid canonical name '{}'",
                        rule.pattern, rule.canonical
                    )));
                }
                Ok(CompiledRule {
                    pattern,
                    canonical_lower: canonical.to_lowercase(),
                    canonical,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { rules, suffixes })
    }

    pub fn with_default_rules() -> Result<Self> {
        Self::new(SourceRule::defaults())
    }

    /// Map a raw source name to its canonical form
    pub fn normalize(&self, raw: &str) -> std::result::Result<String, RecordError> {
        let folded = fold_typography(raw);
        let name = match folded.trim_start().strip_prefix(THIRD_PARTY_PREFIX) {
            Some(rest) => rest,
            None => folded.as_str(),
        };

        // Rules see the full name, model tokens included
        let name = collapse_whitespace(name);
        if name.is_empty() {
            return Err(empty_source(raw));
        }
        let lower = name.to_lowercase();
        if let Some(rule) = self.canonical_match(&lower) {
            return Ok(rule.canonical.clone());
        }
        if let Some(rule) = self.rules.iter().find(|r| lower.contains(&r.pattern)) {
            return Ok(rule.canonical.clone());
        }

        let cleaned = self.clean(&name);
        if cleaned.is_empty() {
            return Err(empty_source(raw));
        }
        // "Polar 2" under a "Polar" rule must not become ThirdParty:Polar
        if let Some(rule) = self.canonical_match(&cleaned.to_lowercase()) {
            return Ok(rule.canonical.clone());
        }

        Ok(format!("{THIRD_PARTY_PREFIX}{cleaned}"))
    }

    fn canonical_match(&self, lower: &str) -> Option<&CompiledRule> {
        self.rules.iter().find(|r| r.canonical_lower == lower)
    }

    fn clean(&self, name: &str) -> String {
        let mut current = collapse_whitespace(name);
        loop {
            let mut next = current.clone();
            for suffix in &self.suffixes {
                next = suffix.replace(&next, "").into_owned();
            }
            let next = collapse_whitespace(&next);
            if next == current {
                return current;
            }
            current = next;
        }
    }
}

fn empty_source(raw: &str) -> RecordError {
    RecordError::ambiguity(
        AmbiguityKind::Source,
        format!("source {raw:?} is empty after cleanup"),
    )
}

fn fold_typography(raw: &str) -> String {
    raw.chars()
        .map(|c| match c {
            '\u{2018}' | '\u{2019}' | '\u{02BC}' => '\'',
            '\u{00A0}' | '\u{2007}' | '\u{202F}' => ' ',
            other => other,
        })
        .collect()
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}
