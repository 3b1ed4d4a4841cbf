//! Run configuration, loaded from a single JSON file.
//!
//! Every field has a default so a partial file is valid. Exclusion ids are
//! canonicalized on load with the same rules as ingested ids; an exclusion
//! that does not match the ingested form would silently never fire.

use crate::{
    error::{R360Error, R360Result},
    ids::{canonical_id, RawValue},
    types::Mode,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileMode {
    /// Reconcile against the prior run's current table.
    #[default]
    Historical,
    /// Ignore the prior current table and mint fresh keys.
    Fresh,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AddressMatch {
    /// Hub on the primary-address id.
    #[default]
    Id,
    /// Hub on the normalized concatenated address text.
    Text,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ModeConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub reconcile: ReconcileMode,
    #[serde(default)]
    pub excluded_addresses: BTreeSet<String>,
    #[serde(default)]
    pub excluded_parties: BTreeSet<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { attempts: 3, base_backoff_ms: 500 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct R360Config {
    pub modes: BTreeMap<Mode, ModeConfig>,
    pub ownership_role_codes: Vec<String>,
    pub primary_address_codes: Vec<String>,
    /// Empty means every account in the master is active.
    pub active_status_codes: Vec<String>,
    pub address_match: AddressMatch,
    pub retry: RetryPolicy,
    pub output_dir: Option<String>,
}

impl Default for R360Config {
    fn default() -> Self {
        let mut modes = BTreeMap::new();
        modes.insert(Mode::Portfolio, ModeConfig { enabled: true, ..ModeConfig::default() });
        modes.insert(Mode::Address, ModeConfig::default());
        modes.insert(Mode::Ownership, ModeConfig::default());
        Self {
            modes,
            ownership_role_codes: vec![
                "OWN".into(),       // owner
                "GUAR".into(),      // guarantor
                "LNCO".into(),      // loan co-signer
                "Tax Owner".into(),
            ],
            primary_address_codes: vec!["PRI".into()],
            active_status_codes: Vec::new(),
            address_match: AddressMatch::Id,
            retry: RetryPolicy::default(),
            output_dir: None,
        }
    }
}

impl R360Config {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Cannot read {path}: {e}"))?;
        let config = Self::from_json(&content)?;
        Ok(config)
    }

    pub fn from_json(content: &str) -> R360Result<Self> {
        let mut config: R360Config = serde_json::from_str(content)?;
        config.normalize()?;
        Ok(config)
    }

    /// Canonicalize exclusion ids and check the config is usable.
    pub fn normalize(&mut self) -> R360Result<()> {
        for mode in Mode::ALL {
            self.modes.entry(mode).or_default();
        }
        for (mode, mc) in self.modes.iter_mut() {
            let set = format!("config.modes.{mode}");
            mc.excluded_addresses = mc
                .excluded_addresses
                .iter()
                .map(|a| canonical_id(&set, "excluded_addresses", &RawValue::Text(a.clone())))
                .filter_map(Result::transpose)
                .collect::<R360Result<_>>()?;
            mc.excluded_parties = mc
                .excluded_parties
                .iter()
                .map(|p| canonical_party(&set, p))
                .collect::<R360Result<_>>()?;
        }
        if self.ownership_role_codes.is_empty() && self.enabled_modes().iter().any(|m| m.uses_ownership()) {
            return Err(R360Error::Config(
                "ownership_role_codes is empty but an ownership-based mode is enabled".into(),
            ));
        }
        if self.primary_address_codes.is_empty() && self.enabled_modes().iter().any(|m| m.uses_address()) {
            return Err(R360Error::Config(
                "primary_address_codes is empty but an address-based mode is enabled".into(),
            ));
        }
        Ok(())
    }

    pub fn mode(&self, mode: Mode) -> ModeConfig {
        self.modes.get(&mode).cloned().unwrap_or_default()
    }

    /// Enabled modes in fixed order: portfolio, address, ownership.
    pub fn enabled_modes(&self) -> Vec<Mode> {
        Mode::ALL
            .into_iter()
            .filter(|m| self.modes.get(m).is_some_and(|mc| mc.enabled))
            .collect()
    }

    /// Convenience for tests and embedding: only `modes` enabled.
    pub fn with_modes(modes: &[Mode]) -> Self {
        let mut config = Self::default();
        for (mode, mc) in config.modes.iter_mut() {
            mc.enabled = modes.contains(mode);
        }
        config
    }
}

/// Party exclusions keep their `P`/`O` prefix; the number part is canonicalized.
fn canonical_party(set: &str, raw: &str) -> R360Result<String> {
    let t = raw.trim();
    let (prefix, rest) = match t.chars().next() {
        Some(c @ ('P' | 'O')) => (c, &t[1..]),
        _ => {
            return Err(R360Error::Config(format!(
                "{set}: excluded party '{raw}' must start with P (person) or O (organization)"
            )))
        }
    };
    let id = canonical_id(set, "excluded_parties", &RawValue::Text(rest.to_string()))?
        .ok_or_else(|| R360Error::Config(format!("{set}: excluded party '{raw}' has no number")))?;
    Ok(format!("{prefix}{id}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_enables_portfolio_only() {
        let config = R360Config::default();
        assert_eq!(config.enabled_modes(), vec![Mode::Portfolio]);
    }

    #[test]
    fn partial_file_fills_defaults_and_canonicalizes_exclusions() {
        let json = r#"{
            "modes": {
                "address": { "enabled": true, "excluded_addresses": ["00042", " 7 "] },
                "ownership": { "enabled": true, "excluded_parties": ["O0500", "P12"] }
            }
        }"#;
        let config = R360Config::from_json(json).unwrap();
        assert_eq!(config.enabled_modes(), vec![Mode::Address, Mode::Ownership]);
        let addr = config.mode(Mode::Address);
        assert!(addr.excluded_addresses.contains("42"));
        assert!(addr.excluded_addresses.contains("7"));
        let own = config.mode(Mode::Ownership);
        assert!(own.excluded_parties.contains("O500"));
        assert!(own.excluded_parties.contains("P12"));
        assert_eq!(config.retry, RetryPolicy::default());
        assert_eq!(config.ownership_role_codes.len(), 4);
    }

    #[test]
    fn partial_retry_policy_keeps_the_other_default() {
        let config = R360Config::from_json(r#"{ "retry": { "attempts": 5 } }"#).unwrap();
        assert_eq!(config.retry, RetryPolicy { attempts: 5, base_backoff_ms: 500 });
    }

    #[test]
    fn unprefixed_party_exclusion_is_rejected() {
        let json = r#"{ "modes": { "portfolio": { "enabled": true, "excluded_parties": ["500"] } } }"#;
        let err = R360Config::from_json(json).unwrap_err();
        assert!(matches!(err, R360Error::Config(_)));
    }

    #[test]
    fn shipped_sample_config_parses() {
        let config = R360Config::from_json(include_str!("../../data/r360.json")).unwrap();
        assert_eq!(config.enabled_modes(), Mode::ALL.to_vec());
        assert!(config.mode(Mode::Ownership).excluded_parties.contains("O501"));
        assert_eq!(config.output_dir.as_deref(), Some("output"));
    }
}
