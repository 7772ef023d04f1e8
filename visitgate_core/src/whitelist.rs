//! Address whitelist for trusted crawler operators
//!
//! Rules are either exact addresses or dotted-quad patterns where each octet
//! is a literal or `*` (e.g. `66.249.*.*`). Rules are grouped by operator so
//! log lines can say who a whitelisted address belongs to.

use crate::address::{normalize_address, parse_ip};
use once_cell::sync::Lazy;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Curated crawler ranges shipped with the binary
static BUILTIN_RANGES: Lazy<Vec<(&'static str, Vec<&'static str>)>> = Lazy::new(|| {
    vec![
        ("google", vec!["66.249.*.*", "64.233.*.*", "72.14.*.*"]),
        ("bing", vec!["157.55.39.*", "207.46.13.*", "40.77.167.*"]),
        ("yandex", vec!["5.255.253.*", "77.88.5.*"]),
    ]
});

#[derive(Debug, thiserror::Error)]
pub enum WhitelistError {
    #[error("Failed to read whitelist file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse whitelist file: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid whitelist rule '{rule}' for operator '{operator}'")]
    InvalidRule { operator: String, rule: String },
}

/// One octet of a dotted-quad pattern
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OctetPattern {
    Any,
    Exact(u8),
}

/// A single whitelist rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddressRule {
    /// Normalised literal address (IPv4 or IPv6)
    Exact(String),
    /// Dotted-quad pattern with optional wildcards
    Pattern([OctetPattern; 4]),
}

impl AddressRule {
    /// Parse a rule. Anything containing `*` must be a 4-octet pattern,
    /// everything else must be a literal IP address.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();

        if raw.contains('*') {
            let parts: Vec<&str> = raw.split('.').collect();
            if parts.len() != 4 {
                return None;
            }

            let mut octets = [OctetPattern::Any; 4];
            for (slot, part) in octets.iter_mut().zip(parts) {
                *slot = match part {
                    "*" => OctetPattern::Any,
                    literal => OctetPattern::Exact(parse_octet(literal)?),
                };
            }
            return Some(AddressRule::Pattern(octets));
        }

        parse_ip(raw)?;
        Some(AddressRule::Exact(normalize_address(raw)))
    }

    /// Check a normalised address against this rule
    ///
    /// Addresses that are not four decimal octets never match a pattern.
    pub fn matches(&self, address: &str) -> bool {
        match self {
            AddressRule::Exact(expected) => expected == address,
            AddressRule::Pattern(octets) => {
                let parts: Vec<&str> = address.split('.').collect();
                if parts.len() != 4 {
                    return false;
                }

                octets.iter().zip(parts).all(|(pattern, part)| match pattern {
                    OctetPattern::Any => parse_octet(part).is_some(),
                    OctetPattern::Exact(want) => parse_octet(part) == Some(*want),
                })
            }
        }
    }
}

/// Decimal digits only; `u8::from_str` alone would also take a leading `+`
fn parse_octet(part: &str) -> Option<u8> {
    if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    part.parse().ok()
}

/// Rules belonging to one crawler operator
#[derive(Debug, Clone)]
pub struct OperatorRules {
    pub operator: String,
    pub rules: Vec<AddressRule>,
}

/// On-disk whitelist format
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WhitelistFile {
    /// Extra crawler user-agent tokens
    #[serde(default)]
    pub agent_tokens: Vec<String>,

    /// Operator name -> list of exact addresses or patterns
    #[serde(default)]
    pub operators: BTreeMap<String, Vec<String>>,
}

/// Immutable set of whitelist rules, built once at startup
#[derive(Debug, Clone, Default)]
pub struct WhitelistRules {
    groups: Vec<OperatorRules>,
    agent_tokens: Vec<String>,
}

impl WhitelistRules {
    /// Nothing whitelisted
    pub fn empty() -> Self {
        Self::default()
    }

    /// Only the curated crawler ranges
    pub fn builtin() -> Self {
        let groups = BUILTIN_RANGES
            .iter()
            .map(|(operator, patterns)| OperatorRules {
                operator: operator.to_string(),
                rules: patterns.iter().filter_map(|p| AddressRule::parse(p)).collect(),
            })
            .collect();

        Self {
            groups,
            agent_tokens: Vec::new(),
        }
    }

    /// Add an operator group from raw rule strings
    pub fn add_operator(&mut self, operator: &str, raw_rules: &[String]) -> Result<(), WhitelistError> {
        let rules = raw_rules
            .iter()
            .map(|raw| {
                AddressRule::parse(raw).ok_or_else(|| WhitelistError::InvalidRule {
                    operator: operator.to_string(),
                    rule: raw.clone(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        match self.groups.iter_mut().find(|g| g.operator == operator) {
            Some(group) => group.rules.extend(rules),
            None => self.groups.push(OperatorRules {
                operator: operator.to_string(),
                rules,
            }),
        }
        Ok(())
    }

    /// Merge a parsed whitelist file into these rules
    pub fn extend_from_file(&mut self, file: WhitelistFile) -> Result<(), WhitelistError> {
        for (operator, rules) in &file.operators {
            self.add_operator(operator, rules)?;
        }

        self.agent_tokens.extend(
            file.agent_tokens
                .into_iter()
                .map(|t| t.trim().to_lowercase())
                .filter(|t| !t.is_empty()),
        );
        Ok(())
    }

    /// Build the full rule set: curated ranges, the optional YAML file, and
    /// operator-supplied literal addresses
    pub fn try_load(path: Option<&Path>, literal_addresses: &[String]) -> Result<Self, WhitelistError> {
        let mut rules = Self::builtin();

        if let Some(path) = path {
            let content = std::fs::read_to_string(path).map_err(|source| WhitelistError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            let file: WhitelistFile = serde_yaml::from_str(&content)?;
            rules.extend_from_file(file)?;
        }

        let literals: Vec<String> = literal_addresses
            .iter()
            .map(|a| a.trim().to_string())
            .filter(|a| !a.is_empty())
            .collect();
        if !literals.is_empty() {
            rules.add_operator("operator", &literals)?;
        }

        Ok(rules)
    }

    /// Like [`WhitelistRules::try_load`], but a broken source yields an empty
    /// rule set so only the user-agent check can grant trust
    pub fn load_or_empty(path: Option<&Path>, literal_addresses: &[String]) -> Self {
        match Self::try_load(path, literal_addresses) {
            Ok(rules) => {
                tracing::info!(
                    "Loaded whitelist: {} operators, {} rules, {} extra agent tokens",
                    rules.groups.len(),
                    rules.rule_count(),
                    rules.agent_tokens.len()
                );
                rules
            }
            Err(e) => {
                tracing::error!("Whitelist unavailable, trusting no addresses: {}", e);
                Self::empty()
            }
        }
    }

    /// Find the operator whose rules match a normalised address
    pub fn find_operator(&self, address: &str) -> Option<&str> {
        self.groups
            .iter()
            .find(|g| g.rules.iter().any(|r| r.matches(address)))
            .map(|g| g.operator.as_str())
    }

    /// Extra crawler tokens supplied by the whitelist file
    pub fn agent_tokens(&self) -> &[String] {
        &self.agent_tokens
    }

    pub fn rule_count(&self) -> usize {
        self.groups.iter().map(|g| g.rules.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.rule_count() == 0
    }
}
