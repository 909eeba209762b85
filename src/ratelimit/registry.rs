//! Registry of per-key token buckets.
//!
//! The registry maps each [`BucketKey`] to exactly one [`TokenBucket`],
//! created lazily on first use. Creation goes through DashMap's entry API so
//! concurrent first requests for the same key build the bucket once and all
//! receive the same instance.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

use super::bucket::{BucketStatus, TokenBucket};
use super::clock::{self, Clock};
use super::descriptor::BucketKey;
use super::rules::Rule;
use crate::config::RegistrySettings;
use crate::error::Result;

const NANOS_PER_SECOND: u64 = 1_000_000_000;

/// How fast a bucket refills.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Refill {
    /// Whole tokens per second
    PerSecond(u64),
    /// One token per interval
    Interval(Duration),
}

/// Capacity and refill rate for a new bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketLimits {
    pub capacity: u64,
    pub refill: Refill,
}

impl BucketLimits {
    pub fn per_second(capacity: u64, refill_rate_per_second: u64) -> Self {
        Self {
            capacity,
            refill: Refill::PerSecond(refill_rate_per_second),
        }
    }

    /// Derive bucket limits from a matched rule.
    ///
    /// Capacity is at least `minimum_burst_floor`. The refill rate is
    /// `requests_per_unit / unit_seconds` rounded down and clamped to at
    /// least one token per second, unless `precise_refill` is set, in which
    /// case rules slower than one token per second refill one token every
    /// `unit_seconds / requests_per_unit`.
    pub fn from_rule(rule: &Rule, minimum_burst_floor: u64, precise_refill: bool) -> Self {
        let requests = rule.rate_limit.requests_per_unit;
        let unit_seconds = rule.rate_limit.unit.seconds();
        let capacity = requests.max(minimum_burst_floor);
        let per_second = requests / unit_seconds;

        let refill = if precise_refill && per_second == 0 {
            let nanos = u128::from(unit_seconds) * u128::from(NANOS_PER_SECOND) / u128::from(requests);
            Refill::Interval(Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX)))
        } else {
            Refill::PerSecond(per_second.max(1))
        };

        Self { capacity, refill }
    }

    fn build(&self, clock: Arc<dyn Clock>) -> Result<TokenBucket> {
        match self.refill {
            Refill::PerSecond(rate) => TokenBucket::with_clock(self.capacity, rate, clock),
            Refill::Interval(per_token) => {
                TokenBucket::with_refill_interval(self.capacity, per_token, clock)
            }
        }
    }
}

#[derive(Debug)]
struct Slot {
    bucket: Arc<TokenBucket>,
    /// Nanoseconds since the registry epoch
    last_access: AtomicU64,
}

impl Slot {
    fn touch(&self, tick: u64) {
        self.last_access.fetch_max(tick, Ordering::Relaxed);
    }

    fn last_access(&self) -> u64 {
        self.last_access.load(Ordering::Relaxed)
    }
}

/// Owner of all live token buckets.
///
/// The registry is constructed with the admission service and dropped with
/// it; there is no process-wide state.
#[derive(Debug)]
pub struct BucketRegistry {
    buckets: DashMap<BucketKey, Slot>,
    settings: RegistrySettings,
    clock: Arc<dyn Clock>,
    epoch: Instant,
}

impl BucketRegistry {
    /// Create an unbounded registry.
    pub fn new() -> Self {
        Self::with_settings(RegistrySettings::default(), clock::monotonic())
    }

    pub fn with_settings(settings: RegistrySettings, clock: Arc<dyn Clock>) -> Self {
        let epoch = clock.now();
        Self {
            buckets: DashMap::new(),
            settings,
            clock,
            epoch,
        }
    }

    /// Return the bucket for `key`, creating it with `limits` if absent.
    ///
    /// `limits` only applies on creation; an existing bucket keeps the
    /// limits it was built with.
    pub fn get_or_create(&self, key: &BucketKey, limits: &BucketLimits) -> Result<Arc<TokenBucket>> {
        let tick = self.tick();

        if let Some(slot) = self.buckets.get(key) {
            slot.touch(tick);
            return Ok(Arc::clone(&slot.bucket));
        }

        self.make_room();

        let slot = match self.buckets.entry(key.clone()) {
            Entry::Occupied(occupied) => occupied.into_ref(),
            Entry::Vacant(vacant) => {
                let bucket = Arc::new(limits.build(Arc::clone(&self.clock))?);
                debug!(
                    key = %key,
                    capacity = bucket.capacity(),
                    refill_interval = ?bucket.refill_interval(),
                    "Creating token bucket"
                );
                vacant.insert(Slot {
                    bucket,
                    last_access: AtomicU64::new(tick),
                })
            }
        };

        slot.touch(tick);
        Ok(Arc::clone(&slot.bucket))
    }

    /// Look up an existing bucket without creating one.
    pub fn get(&self, key: &BucketKey) -> Option<Arc<TokenBucket>> {
        self.buckets.get(key).map(|slot| Arc::clone(&slot.bucket))
    }

    /// Status of the bucket for `key`, if one exists.
    pub fn status(&self, key: &BucketKey) -> Option<BucketStatus> {
        self.get(key).map(|bucket| bucket.status())
    }

    /// Remove the bucket for `key`. The next request for the key starts
    /// with a fresh, full bucket.
    pub fn clear(&self, key: &BucketKey) -> bool {
        let removed = self.buckets.remove(key).is_some();
        if removed {
            debug!(key = %key, "Cleared token bucket");
        }
        removed
    }

    /// Remove every bucket.
    pub fn clear_all(&self) {
        self.buckets.clear();
    }

    /// Remove buckets idle for longer than the configured TTL.
    ///
    /// Returns the number of buckets removed; always zero without a TTL.
    pub fn sweep_idle(&self) -> usize {
        let Some(ttl) = self.settings.idle_ttl() else {
            return 0;
        };
        let ttl = u64::try_from(ttl.as_nanos()).unwrap_or(u64::MAX);
        let now = self.tick();

        let mut removed = 0;
        self.buckets.retain(|_, slot| {
            let keep = now.saturating_sub(slot.last_access()) <= ttl;
            if !keep {
                removed += 1;
            }
            keep
        });

        if removed > 0 {
            debug!(removed, remaining = self.buckets.len(), "Swept idle token buckets");
        }
        removed
    }

    /// Number of live buckets.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    pub fn settings(&self) -> &RegistrySettings {
        &self.settings
    }

    fn tick(&self) -> u64 {
        let since = self.clock.now().saturating_duration_since(self.epoch);
        u64::try_from(since.as_nanos()).unwrap_or(u64::MAX)
    }

    /// Evict least recently used buckets until a new key fits.
    ///
    /// Finding the victim scans every entry, so each new key costs O(n) once
    /// the registry is full. The bound is approximate under concurrent
    /// inserts of distinct keys.
    fn make_room(&self) {
        let Some(max) = self.settings.max_buckets.filter(|&max| max > 0) else {
            return;
        };

        while self.buckets.len() >= max {
            let victim = self
                .buckets
                .iter()
                .min_by_key(|entry| entry.value().last_access())
                .map(|entry| entry.key().clone());

            let Some(victim) = victim else { break };
            if self.buckets.remove(&victim).is_some() {
                debug!(key = %victim, "Evicted least recently used token bucket");
            }
        }
    }
}

impl Default for BucketRegistry {
    fn default() -> Self {
        Self::new()
    }
}
