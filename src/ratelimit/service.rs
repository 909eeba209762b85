//! Admission service: rule resolution, bucket lookup and the final decision.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{trace, warn};

use super::bucket::BucketStatus;
use super::clock::{self, Clock};
use super::descriptor::{BucketKey, Descriptor};
use super::matcher::{DomainPriority, RuleMatcher};
use super::registry::{BucketLimits, BucketRegistry};
use super::rules::RuleCatalog;
use crate::config::AdmissionSettings;
use crate::error::{Result, TollgateError};

/// Outcome of one admission check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AdmissionResult {
    /// Whether the request may proceed
    pub allowed: bool,
    /// Configured requests per unit of the governing rule
    pub limit: u64,
    /// Tokens left in the bucket after this check
    pub remaining: u64,
    /// Time until the next token, set only on rejection
    pub retry_after: Option<Duration>,
    /// Domain of the governing rule; empty when no rule applied
    pub domain: String,
    /// Bucket consulted; `None` when no rule applied
    pub key: Option<BucketKey>,
}

impl AdmissionResult {
    /// Result for a request no rule applies to.
    pub fn unlimited() -> Self {
        Self {
            allowed: true,
            limit: 0,
            remaining: 0,
            retry_after: None,
            domain: String::new(),
            key: None,
        }
    }

    /// Whether the request passed without any rule applying.
    pub fn is_unlimited(&self) -> bool {
        self.key.is_none()
    }

    /// Retry hint in whole seconds, rounded up and never below one.
    pub fn retry_after_secs(&self) -> Option<u64> {
        self.retry_after.map(|d| {
            let secs = d.as_secs() + u64::from(d.subsec_nanos() > 0);
            secs.max(1)
        })
    }
}

/// Snapshot of decision counters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AdmissionStats {
    pub total: u64,
    pub allowed: u64,
    pub rejected: u64,
    /// Requests no rule applied to (counted as allowed too)
    pub unlimited: u64,
    pub active_buckets: usize,
}

impl AdmissionStats {
    pub fn allow_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.allowed as f64 / self.total as f64
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    total: AtomicU64,
    allowed: AtomicU64,
    rejected: AtomicU64,
    unlimited: AtomicU64,
}

/// Decides whether requests are admitted under the configured rules.
///
/// This struct is thread-safe and can be shared across request handlers.
#[derive(Debug)]
pub struct AdmissionService {
    matcher: RuleMatcher,
    registry: BucketRegistry,
    settings: AdmissionSettings,
    counters: Counters,
}

impl AdmissionService {
    pub fn new(catalog: Arc<RuleCatalog>, settings: AdmissionSettings) -> Self {
        Self::with_clock(catalog, settings, clock::monotonic())
    }

    /// Create a service whose buckets are driven by `clock`.
    pub fn with_clock(
        catalog: Arc<RuleCatalog>,
        settings: AdmissionSettings,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let registry = BucketRegistry::with_settings(settings.registry.clone(), clock);
        Self {
            matcher: RuleMatcher::new(catalog),
            registry,
            settings,
            counters: Counters::default(),
        }
    }

    /// Check a request using the configured domain priority.
    pub fn check(&self, descriptors: &[Descriptor]) -> Result<AdmissionResult> {
        self.evaluate_hits(&self.settings.domain_priority, descriptors, 1)
    }

    /// Check a request, consuming one token from its bucket if admitted.
    pub fn evaluate(
        &self,
        priority: &DomainPriority,
        descriptors: &[Descriptor],
    ) -> Result<AdmissionResult> {
        self.evaluate_hits(priority, descriptors, 1)
    }

    /// Check a request that costs `hits` tokens.
    ///
    /// `hits` must be positive; a zero cost is rejected before any rule
    /// lookup, so an invalid call never creates or evicts a bucket.
    pub fn evaluate_hits(
        &self,
        priority: &DomainPriority,
        descriptors: &[Descriptor],
        hits: u64,
    ) -> Result<AdmissionResult> {
        if hits == 0 {
            return Err(TollgateError::InvalidArgument(
                "hits must be positive".to_string(),
            ));
        }

        let Some(rule) = self.matcher.resolve(priority, descriptors) else {
            trace!(descriptors = descriptors.len(), "No rate limit rule matched");
            self.counters.total.fetch_add(1, Ordering::Relaxed);
            self.counters.allowed.fetch_add(1, Ordering::Relaxed);
            self.counters.unlimited.fetch_add(1, Ordering::Relaxed);
            return Ok(AdmissionResult::unlimited());
        };

        let key = BucketKey::derive(&rule.domain, descriptors);
        let limits = BucketLimits::from_rule(
            rule,
            self.settings.minimum_burst_floor,
            self.settings.precise_refill,
        );
        let bucket = self.registry.get_or_create(&key, &limits)?;

        trace!(key = %key, hits = hits, "Checking rate limit");

        let (allowed, status) = bucket.try_consume_with_status(hits)?;

        self.counters.total.fetch_add(1, Ordering::Relaxed);
        let retry_after = if allowed {
            self.counters.allowed.fetch_add(1, Ordering::Relaxed);
            None
        } else {
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            warn!(
                key = %key,
                domain = %rule.domain,
                remaining = status.current_tokens,
                retry_after = ?status.time_to_next_token,
                "Rate limit exceeded"
            );
            Some(status.time_to_next_token)
        };

        Ok(AdmissionResult {
            allowed,
            limit: rule.rate_limit.requests_per_unit,
            remaining: status.current_tokens,
            retry_after,
            domain: rule.domain.clone(),
            key: Some(key),
        })
    }

    /// Reset the bucket for `key`.
    pub fn clear(&self, key: &BucketKey) -> bool {
        self.registry.clear(key)
    }

    /// Status of the bucket for `key`, if one exists.
    pub fn status(&self, key: &BucketKey) -> Option<BucketStatus> {
        self.registry.status(key)
    }

    /// Remove idle buckets according to the registry TTL.
    pub fn sweep_idle(&self) -> usize {
        self.registry.sweep_idle()
    }

    pub fn stats(&self) -> AdmissionStats {
        AdmissionStats {
            total: self.counters.total.load(Ordering::Relaxed),
            allowed: self.counters.allowed.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            unlimited: self.counters.unlimited.load(Ordering::Relaxed),
            active_buckets: self.registry.len(),
        }
    }

    pub fn registry(&self) -> &BucketRegistry {
        &self.registry
    }

    pub fn settings(&self) -> &AdmissionSettings {
        &self.settings
    }
}
