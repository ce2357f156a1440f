//! Bounded re-attempts with exponential backoff for backend exchanges

use std::time::{Duration, SystemTime};

/// Retry policy for a failed exchange
///
/// Controls how many times a retryable exchange is replayed and how long to
/// wait between attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of re-attempts after the first try
    pub max_retries: u32,
    /// Base delay between attempts (doubles each attempt)
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    /// Policy that never re-attempts
    #[must_use]
    pub const fn disabled() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Whether attempt number `attempt` (zero-based re-attempt) is allowed
    #[must_use]
    pub const fn allows(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }
}

/// Parse an HTTP `Retry-After` header given in seconds
///
/// HTTP-date values are not supported and yield `None`.
#[must_use]
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

/// Largest extra wait added on top of the backoff, as a share of it
const JITTER_SPREAD: f64 = 0.25;

/// Wait before re-attempt number `attempt`
///
/// A server `Retry-After` hint wins when present. Without one the wait
/// doubles from `base_delay` on every attempt and gains a small clock-derived
/// spread so that several endpoints do not replay in lockstep. Either way the
/// result never exceeds `max_delay`.
#[must_use]
pub fn delay_for_attempt(
    policy: &RetryPolicy,
    attempt: u32,
    retry_after: Option<Duration>,
) -> Duration {
    let RetryPolicy {
        base_delay,
        max_delay,
        ..
    } = *policy;

    if let Some(hint) = retry_after {
        return hint.min(max_delay);
    }

    let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
    let backoff = base_delay.saturating_mul(factor).min(max_delay);
    let spread = backoff.mul_f64(JITTER_SPREAD * clock_fraction());

    backoff.saturating_add(spread).min(max_delay)
}

/// Value in `[0, 1)` taken from the subsecond clock
fn clock_fraction() -> f64 {
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    f64::from(nanos % 1000) / 1000.0
}
