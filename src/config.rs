//! Operator settings and label selector matching
//!
//! Everything here is fixed at startup; there is no hot reload. The selector
//! type doubles as the parser for the `use-wildcard-tls-ignore` ConfigMap key.

use std::collections::BTreeMap;
use std::str::FromStr;

use crate::error::Error;
use crate::{DEFAULT_INGRESS_CLASS, DEFAULT_MAX_SLOTS};

/// Startup-time operator settings
#[derive(Debug, Clone)]
pub struct Settings {
    /// Ingress class this controller consumes
    pub ingress_class: String,
    /// Label selector origin ingresses must match (empty selects all)
    pub ingress_selector: Selector,
    /// Label selector config maps must match (empty selects all)
    pub config_map_selector: Selector,
    /// Slot budget per merged ingress
    pub max_slots: i64,
    /// Annotation keys that exclude an ingress from processing
    pub ingress_watch_ignore: Vec<String>,
    /// Annotation keys that exclude a config map from processing
    pub config_map_watch_ignore: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            ingress_class: DEFAULT_INGRESS_CLASS.to_string(),
            ingress_selector: Selector::default(),
            config_map_selector: Selector::default(),
            max_slots: DEFAULT_MAX_SLOTS,
            ingress_watch_ignore: Vec::new(),
            config_map_watch_ignore: Vec::new(),
        }
    }
}

/// Equality-based label selector, parsed from `key=value,key2=value2`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selector {
    terms: Vec<(String, String)>,
}

impl Selector {
    /// Parse a comma-separated list of `key=value` terms. Whitespace around
    /// terms and keys/values is trimmed; empty input yields the empty
    /// selector.
    pub fn parse(input: &str) -> Result<Self, Error> {
        let mut terms = Vec::new();
        for term in input.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            match term.split_once('=') {
                Some((key, value)) if !key.trim().is_empty() => {
                    terms.push((key.trim().to_string(), value.trim().to_string()));
                }
                _ => {
                    return Err(Error::Selector {
                        selector: input.to_string(),
                        reason: format!("expected key=value, got {term:?}"),
                    });
                }
            }
        }
        Ok(Self { terms })
    }

    /// True when every term is present in `labels`. The empty selector
    /// matches everything.
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.terms
            .iter()
            .all(|(key, value)| labels.get(key) == Some(value))
    }

    /// True when the selector has no terms
    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }
}

impl FromStr for Selector {
    type Err = Error;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        Selector::parse(input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn empty_selector_matches_everything() {
        let selector = Selector::parse("").unwrap();
        assert!(selector.is_empty());
        assert!(selector.matches(&labels(&[])));
        assert!(selector.matches(&labels(&[("a", "b")])));
    }

    #[test]
    fn single_term_requires_exact_value() {
        let selector = Selector::parse("team=edge").unwrap();
        assert!(selector.matches(&labels(&[("team", "edge"), ("extra", "x")])));
        assert!(!selector.matches(&labels(&[("team", "core")])));
        assert!(!selector.matches(&labels(&[])));
    }

    #[test]
    fn multiple_terms_are_conjunctive() {
        let selector = Selector::parse("team=edge, tier=web").unwrap();
        assert!(selector.matches(&labels(&[("team", "edge"), ("tier", "web")])));
        assert!(!selector.matches(&labels(&[("team", "edge")])));
    }

    #[test]
    fn malformed_terms_are_rejected() {
        assert!(Selector::parse("no-equals-sign").is_err());
        assert!(Selector::parse("=value").is_err());
        assert!(Selector::parse("ok=fine,broken").is_err());
    }

    #[test]
    fn default_settings_match_shipped_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.ingress_class, "merge");
        assert_eq!(settings.max_slots, 45);
        assert!(settings.ingress_selector.is_empty());
        assert!(settings.ingress_watch_ignore.is_empty());
    }
}
