//! Rate limit rules and the rule catalog.
//!
//! Rules are flat records scoped to a domain. Within a domain, declaration
//! order is match priority: the first rule whose descriptors are all
//! satisfied governs the request, even if a later rule is more specific.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

use super::descriptor::Descriptor;
use crate::error::{Result, TollgateError};

/// Time unit for rate limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    Second,
    Minute,
    Hour,
    Day,
}

impl TimeUnit {
    /// Length of this unit in seconds.
    pub fn seconds(&self) -> u64 {
        match self {
            TimeUnit::Second => 1,
            TimeUnit::Minute => 60,
            TimeUnit::Hour => 3600,
            TimeUnit::Day => 86400,
        }
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.seconds())
    }
}

impl FromStr for TimeUnit {
    type Err = TollgateError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "second" => Ok(TimeUnit::Second),
            "minute" => Ok(TimeUnit::Minute),
            "hour" => Ok(TimeUnit::Hour),
            "day" => Ok(TimeUnit::Day),
            _ => Err(TollgateError::UnconfiguredTimeUnit(s.to_string())),
        }
    }
}

/// A rate budget: `requests_per_unit` requests per `unit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    pub unit: TimeUnit,
    pub requests_per_unit: u64,
}

impl RateLimit {
    pub fn new(unit: TimeUnit, requests_per_unit: u64) -> Result<Self> {
        if requests_per_unit == 0 {
            return Err(TollgateError::InvalidArgument(
                "requests_per_unit must be positive".to_string(),
            ));
        }
        Ok(Self {
            unit,
            requests_per_unit,
        })
    }
}

/// A validated, domain-scoped rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Rule {
    pub domain: String,
    pub descriptors: Vec<Descriptor>,
    pub rate_limit: RateLimit,
}

impl Rule {
    pub fn new(domain: impl Into<String>, descriptors: Vec<Descriptor>, rate_limit: RateLimit) -> Self {
        Self {
            domain: domain.into(),
            descriptors,
            rate_limit,
        }
    }

    /// Whether every predicate of this rule is satisfied by the request.
    ///
    /// A rule without descriptors matches every request in its domain.
    pub fn matches(&self, request: &[Descriptor]) -> bool {
        self.descriptors
            .iter()
            .all(|predicate| request.iter().any(|observed| predicate.matches(observed)))
    }
}

/// A rule record as it appears in YAML/JSON, before validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleDefinition {
    pub domain: String,
    #[serde(default)]
    pub descriptors: Vec<Descriptor>,
    pub rate_limit: RateLimitDefinition,
}

/// Unvalidated rate limit; `unit` is kept as text so unknown units can be
/// reported as [`TollgateError::UnconfiguredTimeUnit`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitDefinition {
    pub unit: String,
    pub requests_per_unit: u64,
}

impl TryFrom<RuleDefinition> for Rule {
    type Error = TollgateError;

    fn try_from(def: RuleDefinition) -> Result<Self> {
        let unit: TimeUnit = def.rate_limit.unit.parse()?;
        let rate_limit = RateLimit::new(unit, def.rate_limit.requests_per_unit).map_err(|e| {
            TollgateError::InvalidArgument(format!("rule in domain '{}': {}", def.domain, e))
        })?;
        Ok(Rule::new(def.domain, def.descriptors, rate_limit))
    }
}

#[derive(Deserialize)]
struct RuleFile {
    rules: Vec<RuleDefinition>,
}

/// An immutable, ordered collection of rules.
#[derive(Debug, Clone, Default)]
pub struct RuleCatalog {
    rules: Vec<Rule>,
    /// Rule indices per domain, in declaration order
    by_domain: HashMap<String, Vec<usize>>,
}

impl RuleCatalog {
    /// Build a catalog from already validated rules.
    pub fn new(rules: Vec<Rule>) -> Self {
        let mut by_domain: HashMap<String, Vec<usize>> = HashMap::new();
        for (idx, rule) in rules.iter().enumerate() {
            by_domain.entry(rule.domain.clone()).or_default().push(idx);
        }
        Self { rules, by_domain }
    }

    /// Validate rule records and build a catalog.
    pub fn from_definitions(definitions: Vec<RuleDefinition>) -> Result<Self> {
        let rules = definitions
            .into_iter()
            .map(Rule::try_from)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(rules))
    }

    /// Load a catalog from a file. `.yml`/`.yaml` files are read as YAML,
    /// anything else as JSON.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit rules");

        let contents = std::fs::read_to_string(path)?;
        let catalog = match path.extension().and_then(|e| e.to_str()) {
            Some("yml") | Some("yaml") => Self::from_yaml(&contents)?,
            _ => Self::from_json(&contents)?,
        };

        info!(rules = catalog.len(), path = %path.display(), "Loaded rate limit rules");
        Ok(catalog)
    }

    /// Load a catalog from YAML: either a bare list of rules or a mapping
    /// with a `rules` list.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let parse_error =
            |e: serde_yaml::Error| TollgateError::Config(format!("Failed to parse rate limit rules: {}", e));

        // Pick the shape from the top-level node so errors point at the real cause
        let document: serde_yaml::Value = serde_yaml::from_str(yaml).map_err(parse_error)?;
        let definitions = if document.is_sequence() {
            serde_yaml::from_str::<Vec<RuleDefinition>>(yaml).map_err(parse_error)?
        } else {
            serde_yaml::from_str::<RuleFile>(yaml)
                .map_err(parse_error)?
                .rules
        };
        Self::from_definitions(definitions)
    }

    /// Load a catalog from a JSON array of rules.
    pub fn from_json(json: &str) -> Result<Self> {
        let definitions: Vec<RuleDefinition> = serde_json::from_str(json)
            .map_err(|e| TollgateError::Config(format!("Failed to parse rate limit rules: {}", e)))?;
        Self::from_definitions(definitions)
    }

    /// Rules used when no rule file is configured.
    pub fn builtin() -> Self {
        let rule = |domain: &str, key: &str, value: &str, unit, requests_per_unit| {
            Rule::new(
                domain,
                vec![Descriptor::new(key, value)],
                RateLimit {
                    unit,
                    requests_per_unit,
                },
            )
        };

        Self::new(vec![
            rule("api", "path", "*", TimeUnit::Minute, 100),
            rule("auth", "auth_type", "login", TimeUnit::Minute, 5),
            rule("messaging", "message_type", "marketing", TimeUnit::Day, 5),
        ])
    }

    /// Find the first rule in `domain` whose descriptors all match.
    pub fn find_matching_rule(&self, domain: &str, request: &[Descriptor]) -> Option<&Rule> {
        self.by_domain
            .get(domain)?
            .iter()
            .map(|&idx| &self.rules[idx])
            .find(|rule| rule.matches(request))
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Whether any rule is declared for `domain`.
    pub fn has_domain(&self, domain: &str) -> bool {
        self.by_domain.contains_key(domain)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
