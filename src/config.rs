//! Configuration management for Tollgate.
//!
//! Settings are layered with the `config` crate: built-in defaults, then an
//! optional file (YAML, TOML or JSON, picked by extension), then
//! `TOLLGATE__`-prefixed environment variables, e.g.
//! `TOLLGATE__ADMISSION__MINIMUM_BURST_FLOOR=20`.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::Result;
use crate::ratelimit::DomainPriority;

/// Main configuration for the Tollgate service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TollgateConfig {
    /// Admission settings
    #[serde(default)]
    pub admission: AdmissionSettings,

    /// Path to the rate limit rules file. The built-in rules are used when unset.
    #[serde(default)]
    pub rules_path: Option<String>,
}

/// Settings for the admission service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionSettings {
    /// Domains consulted in order when resolving a request's rule
    #[serde(default)]
    pub domain_priority: DomainPriority,

    /// Lower bound for bucket capacity, so very restrictive rules still
    /// allow a small burst
    #[serde(default = "default_minimum_burst_floor")]
    pub minimum_burst_floor: u64,

    /// Refill sub-1-per-second rules at their exact configured rate instead
    /// of rounding up to one token per second
    #[serde(default)]
    pub precise_refill: bool,

    /// Bucket registry bounds
    #[serde(default)]
    pub registry: RegistrySettings,
}

impl Default for AdmissionSettings {
    fn default() -> Self {
        Self {
            domain_priority: DomainPriority::default(),
            minimum_burst_floor: default_minimum_burst_floor(),
            precise_refill: false,
            registry: RegistrySettings::default(),
        }
    }
}

fn default_minimum_burst_floor() -> u64 {
    10
}

/// Bounds on the number and lifetime of per-key buckets.
///
/// Both bounds are off by default, in which case buckets live until cleared.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrySettings {
    /// Maximum number of live buckets; the least recently used bucket is
    /// evicted to make room for a new key
    #[serde(default)]
    pub max_buckets: Option<usize>,

    /// Buckets untouched for longer than this are removed by idle sweeps
    #[serde(default)]
    pub idle_ttl_secs: Option<u64>,
}

impl RegistrySettings {
    pub fn idle_ttl(&self) -> Option<Duration> {
        self.idle_ttl_secs.map(Duration::from_secs)
    }
}

impl TollgateConfig {
    /// Load configuration from an optional file plus the environment.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path));
        }

        let config = builder
            .add_source(
                config::Environment::with_prefix("TOLLGATE")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()?;
        Ok(config)
    }

    /// Load configuration from a file path.
    pub fn from_file(path: &str) -> Result<Self> {
        Self::load(Some(path))
    }
}
