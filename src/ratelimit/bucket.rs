//! Token bucket implementation.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;

use super::clock::{self, Clock};
use crate::error::{Result, TollgateError};

const NANOS_PER_SECOND: u64 = 1_000_000_000;

/// Point-in-time view of a bucket, for monitoring.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BucketStatus {
    pub current_tokens: u64,
    pub capacity: u64,
    pub refill_rate_per_second: u64,
    pub refill_interval: Duration,
    pub time_to_next_token: Duration,
}

#[derive(Debug)]
struct BucketState {
    tokens: u64,
    last_refill: Instant,
}

/// A token bucket for one rate-limited key.
///
/// Tokens are added one at a time on a fixed per-token interval. Refill
/// advances `last_refill` by exactly the time that was converted into tokens,
/// so any sub-token remainder carries over to the next refill instead of
/// being dropped. Every operation refills first and all of them serialize on
/// a single mutex.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: u64,
    refill_rate_per_second: u64,
    nanos_per_token: u64,
    state: Mutex<BucketState>,
    clock: Arc<dyn Clock>,
}

impl TokenBucket {
    /// Create a full bucket refilling `refill_rate_per_second` tokens per second.
    pub fn new(capacity: u64, refill_rate_per_second: u64) -> Result<Self> {
        Self::with_clock(capacity, refill_rate_per_second, clock::monotonic())
    }

    /// Create a full bucket driven by the given clock.
    pub fn with_clock(
        capacity: u64,
        refill_rate_per_second: u64,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        if refill_rate_per_second == 0 {
            return Err(TollgateError::InvalidArgument(
                "refill rate must be positive".to_string(),
            ));
        }
        if refill_rate_per_second > NANOS_PER_SECOND {
            return Err(TollgateError::InvalidArgument(format!(
                "refill rate {} exceeds one token per nanosecond",
                refill_rate_per_second
            )));
        }
        let interval = Duration::from_nanos(NANOS_PER_SECOND / refill_rate_per_second);
        Self::build(capacity, interval, Some(refill_rate_per_second), clock)
    }

    /// Create a full bucket that adds one token every `per_token`.
    ///
    /// Unlike [`TokenBucket::with_clock`] this can express refill rates
    /// slower than one token per second.
    pub fn with_refill_interval(
        capacity: u64,
        per_token: Duration,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        Self::build(capacity, per_token, None, clock)
    }

    /// `rate` is the configured tokens per second; interval-built buckets
    /// report the whole tokens their interval yields per second.
    fn build(
        capacity: u64,
        per_token: Duration,
        rate: Option<u64>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        if capacity == 0 {
            return Err(TollgateError::InvalidArgument(
                "capacity must be positive".to_string(),
            ));
        }
        let nanos_per_token = u64::try_from(per_token.as_nanos()).map_err(|_| {
            TollgateError::InvalidArgument(format!("refill interval {:?} is too long", per_token))
        })?;
        if nanos_per_token == 0 {
            return Err(TollgateError::InvalidArgument(
                "refill interval must be at least one nanosecond".to_string(),
            ));
        }

        let now = clock.now();
        Ok(Self {
            capacity,
            refill_rate_per_second: rate.unwrap_or(NANOS_PER_SECOND / nanos_per_token),
            nanos_per_token,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: now,
            }),
            clock,
        })
    }

    /// Try to take `tokens` from the bucket.
    ///
    /// Returns `true` and deducts the tokens if enough are available,
    /// otherwise returns `false` and leaves the bucket untouched.
    pub fn try_consume(&self, tokens: u64) -> Result<bool> {
        self.try_consume_with_status(tokens).map(|(allowed, _)| allowed)
    }

    /// Like [`TokenBucket::try_consume`], also returning the bucket status
    /// observed right after the attempt, under the same lock.
    pub fn try_consume_with_status(&self, tokens: u64) -> Result<(bool, BucketStatus)> {
        if tokens == 0 {
            return Err(TollgateError::InvalidArgument(
                "token count must be positive".to_string(),
            ));
        }

        let mut state = self.state.lock();
        let now = self.refill(&mut state);

        let allowed = state.tokens >= tokens;
        if allowed {
            state.tokens -= tokens;
        }
        Ok((allowed, self.snapshot(&state, now)))
    }

    /// Try to take a single token.
    pub fn try_consume_one(&self) -> bool {
        let mut state = self.state.lock();
        self.refill(&mut state);

        if state.tokens > 0 {
            state.tokens -= 1;
            true
        } else {
            false
        }
    }

    /// Refill, then return the number of available tokens.
    pub fn current_tokens(&self) -> u64 {
        let mut state = self.state.lock();
        self.refill(&mut state);
        state.tokens
    }

    /// Refill, then return how long until the next token is added.
    ///
    /// Zero while tokens are available.
    pub fn time_to_next_token(&self) -> Duration {
        let mut state = self.state.lock();
        let now = self.refill(&mut state);
        self.time_to_next(&state, now)
    }

    /// Snapshot of the bucket under a single lock acquisition.
    pub fn status(&self) -> BucketStatus {
        let mut state = self.state.lock();
        let now = self.refill(&mut state);
        self.snapshot(&state, now)
    }

    /// Maximum number of tokens the bucket can hold.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Whole tokens added per second. Zero for buckets slower than 1/s.
    pub fn refill_rate_per_second(&self) -> u64 {
        self.refill_rate_per_second
    }

    /// Time between two consecutive token additions.
    pub fn refill_interval(&self) -> Duration {
        Duration::from_nanos(self.nanos_per_token)
    }

    fn refill(&self, state: &mut BucketState) -> Instant {
        let now = self.clock.now();
        let elapsed = elapsed_nanos(state.last_refill, now);
        if elapsed < self.nanos_per_token {
            return now;
        }

        let tokens_to_add = elapsed / self.nanos_per_token;
        // Advance by consumed token-time only; the remainder stays pending.
        state.last_refill += Duration::from_nanos(tokens_to_add * self.nanos_per_token);
        state.tokens = self.capacity.min(state.tokens.saturating_add(tokens_to_add));
        now
    }

    fn snapshot(&self, state: &BucketState, now: Instant) -> BucketStatus {
        BucketStatus {
            current_tokens: state.tokens,
            capacity: self.capacity,
            refill_rate_per_second: self.refill_rate_per_second,
            refill_interval: self.refill_interval(),
            time_to_next_token: self.time_to_next(state, now),
        }
    }

    fn time_to_next(&self, state: &BucketState, now: Instant) -> Duration {
        if state.tokens > 0 {
            return Duration::ZERO;
        }
        let elapsed = elapsed_nanos(state.last_refill, now);
        Duration::from_nanos(self.nanos_per_token.saturating_sub(elapsed))
    }
}

fn elapsed_nanos(since: Instant, now: Instant) -> u64 {
    u64::try_from(now.saturating_duration_since(since).as_nanos()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::ManualClock;

    fn bucket(capacity: u64, rate: u64) -> (TokenBucket, ManualClock) {
        let clock = ManualClock::new();
        let bucket = TokenBucket::with_clock(capacity, rate, Arc::new(clock.clone())).unwrap();
        (bucket, clock)
    }

    fn drain(bucket: &TokenBucket) {
        while bucket.try_consume_one() {}
    }

    #[test]
    fn test_bucket_starts_full() {
        let (bucket, _clock) = bucket(100, 25);
        assert_eq!(bucket.capacity(), 100);
        assert_eq!(bucket.refill_rate_per_second(), 25);
        assert_eq!(bucket.current_tokens(), 100);
    }

    #[test]
    fn test_rejects_invalid_construction() {
        assert!(matches!(
            TokenBucket::new(0, 5),
            Err(TollgateError::InvalidArgument(_))
        ));
        assert!(matches!(
            TokenBucket::new(10, 0),
            Err(TollgateError::InvalidArgument(_))
        ));
        assert!(matches!(
            TokenBucket::with_refill_interval(10, Duration::ZERO, clock::monotonic()),
            Err(TollgateError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_rejects_zero_token_request() {
        let (bucket, _clock) = bucket(10, 5);
        assert!(matches!(
            bucket.try_consume(0),
            Err(TollgateError::InvalidArgument(_))
        ));
        assert_eq!(bucket.current_tokens(), 10);
    }

    #[test]
    fn test_drain_then_reject() {
        let (bucket, _clock) = bucket(10, 2);

        for i in 0..10 {
            assert!(bucket.try_consume_one(), "request {} should pass", i + 1);
        }
        assert!(!bucket.try_consume_one());
        assert_eq!(bucket.current_tokens(), 0);
    }

    #[test]
    fn test_multi_token_consume() {
        let (bucket, _clock) = bucket(10, 5);

        assert!(bucket.try_consume(5).unwrap());
        assert_eq!(bucket.current_tokens(), 5);

        // Insufficient tokens leaves the bucket untouched
        assert!(!bucket.try_consume(6).unwrap());
        assert_eq!(bucket.current_tokens(), 5);
    }

    #[test]
    fn test_refill_after_half_second() {
        let (bucket, clock) = bucket(100, 10);
        assert!(bucket.try_consume(100).unwrap());
        assert_eq!(bucket.current_tokens(), 0);

        clock.advance(Duration::from_millis(500));
        assert_eq!(bucket.current_tokens(), 5);

        clock.advance(Duration::from_millis(500));
        assert_eq!(bucket.current_tokens(), 10);
    }

    #[test]
    fn test_refill_round_trip_k_over_r() {
        for k in [1u64, 3, 7, 20] {
            let (bucket, clock) = bucket(20, 4);
            drain(&bucket);

            clock.advance(Duration::from_nanos(k * NANOS_PER_SECOND / 4));
            assert_eq!(bucket.current_tokens(), k);
        }
    }

    #[test]
    fn test_refill_never_exceeds_capacity() {
        let (bucket, clock) = bucket(5, 10);
        assert!(bucket.try_consume(3).unwrap());

        clock.advance(Duration::from_secs(60));
        assert_eq!(bucket.current_tokens(), 5);
    }

    #[test]
    fn test_sub_token_remainder_carries_over() {
        let (bucket, clock) = bucket(10, 10);
        drain(&bucket);

        // 150ms is one token plus half a token of credit
        clock.advance(Duration::from_millis(150));
        assert_eq!(bucket.current_tokens(), 1);

        // The pending 50ms completes the second token
        clock.advance(Duration::from_millis(50));
        assert_eq!(bucket.current_tokens(), 2);
    }

    #[test]
    fn test_frequent_polling_does_not_lose_time() {
        let (bucket, clock) = bucket(100, 3);
        drain(&bucket);

        // 3 tokens/s is 333_333_333ns per token; poll every 100ms for 10s
        for _ in 0..100 {
            clock.advance(Duration::from_millis(100));
            bucket.current_tokens();
        }
        assert_eq!(bucket.current_tokens(), 30);
    }

    #[test]
    fn test_time_to_next_token() {
        let (bucket, clock) = bucket(10, 10);
        assert_eq!(bucket.time_to_next_token(), Duration::ZERO);

        drain(&bucket);
        assert_eq!(bucket.time_to_next_token(), Duration::from_millis(100));

        clock.advance(Duration::from_millis(60));
        assert_eq!(bucket.time_to_next_token(), Duration::from_millis(40));

        clock.advance(Duration::from_millis(40));
        assert_eq!(bucket.time_to_next_token(), Duration::ZERO);
    }

    #[test]
    fn test_slow_refill_interval() {
        let clock = ManualClock::new();
        let per_token = Duration::from_secs(86_400 / 5);
        let bucket =
            TokenBucket::with_refill_interval(10, per_token, Arc::new(clock.clone())).unwrap();
        drain(&bucket);

        assert_eq!(bucket.refill_rate_per_second(), 0);
        clock.advance(Duration::from_secs(3600));
        assert_eq!(bucket.current_tokens(), 0);

        clock.advance(per_token);
        assert_eq!(bucket.current_tokens(), 1);
    }

    #[test]
    fn test_reports_configured_rate() {
        let (slow, _clock) = bucket(10, 999_999);
        assert_eq!(slow.refill_rate_per_second(), 999_999);
        assert_eq!(slow.refill_interval(), Duration::from_nanos(1000));

        let (fast, _clock) = bucket(10, 600_000_000);
        assert_eq!(fast.status().refill_rate_per_second, 600_000_000);
        assert_eq!(fast.refill_interval(), Duration::from_nanos(1));
    }

    #[test]
    fn test_status_snapshot() {
        let (bucket, _clock) = bucket(4, 2);
        drain(&bucket);

        let status = bucket.status();
        assert_eq!(status.current_tokens, 0);
        assert_eq!(status.capacity, 4);
        assert_eq!(status.refill_rate_per_second, 2);
        assert_eq!(status.refill_interval, Duration::from_millis(500));
        assert_eq!(status.time_to_next_token, Duration::from_millis(500));
    }

    #[test]
    fn test_concurrent_consumers_stay_in_bounds() {
        let bucket = Arc::new(TokenBucket::new(100, 50).unwrap());
        let mut handles = vec![];

        for _ in 0..8 {
            let bucket = Arc::clone(&bucket);
            handles.push(std::thread::spawn(move || {
                let mut allowed = 0u64;
                for _ in 0..200 {
                    if bucket.try_consume_one() {
                        allowed += 1;
                    }
                    let tokens = bucket.current_tokens();
                    assert!(tokens <= 100);
                }
                allowed
            }));
        }

        let allowed: u64 = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert!(allowed >= 100);
        assert!(bucket.current_tokens() <= bucket.capacity());
    }

    #[test]
    fn test_concurrent_drain_is_exact_without_refill() {
        let clock = ManualClock::new();
        let bucket = Arc::new(TokenBucket::with_clock(1000, 1, Arc::new(clock)).unwrap());
        let mut handles = vec![];

        for _ in 0..10 {
            let bucket = Arc::clone(&bucket);
            handles.push(std::thread::spawn(move || {
                (0..150).filter(|_| bucket.try_consume_one()).count()
            }));
        }

        let allowed: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(allowed, 1000);
        assert_eq!(bucket.current_tokens(), 0);
    }
}
