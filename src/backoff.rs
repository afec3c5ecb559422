use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use rand::RngExt;

const DEFAULT_MIN_BACKOFF: Duration = Duration::from_secs(1);
const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Maps the number of attempts already made to the wait before the next one.
///
/// `attempt` is 1-based: the engine passes `1` after the first failed attempt.
pub trait BackoffStrategy: Debug + Send + Sync {
    fn wait_duration(&self, attempt: usize) -> Duration;
}

/// Exponential backoff from 1s up to 30s with jitter.
pub fn default_backoff() -> Arc<dyn BackoffStrategy> {
    Arc::new(ExponentialBackoff::new(DEFAULT_MIN_BACKOFF, DEFAULT_MAX_BACKOFF).jitter(true))
}

/// Waits the same delay before every retry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NoBackoff {
    delay: Duration,
}

impl NoBackoff {
    pub const fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl BackoffStrategy for NoBackoff {
    fn wait_duration(&self, _attempt: usize) -> Duration {
        self.delay
    }
}

/// `min + interval * (attempt - 1)`, clamped to `[min, max]`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LinearBackoff {
    min: Duration,
    max: Duration,
    interval: Duration,
    jitter: bool,
}

impl LinearBackoff {
    pub fn new(interval: Duration, min: Duration, max: Duration) -> Self {
        Self {
            min,
            max: max.max(min),
            interval,
            jitter: false,
        }
    }

    pub const fn jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }
}

impl BackoffStrategy for LinearBackoff {
    fn wait_duration(&self, attempt: usize) -> Duration {
        let retry_index = attempt.saturating_sub(1);
        let delay = u32::try_from(retry_index)
            .ok()
            .and_then(|index| self.interval.checked_mul(index))
            .and_then(|step| self.min.checked_add(step))
            .unwrap_or(self.max);
        finish_delay(delay, self.jitter, self.min, self.max)
    }
}

/// `min * 2^(attempt - 1)`, clamped to `[min, max]`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExponentialBackoff {
    min: Duration,
    max: Duration,
    jitter: bool,
}

impl ExponentialBackoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max: max.max(min),
            jitter: false,
        }
    }

    pub const fn jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_BACKOFF, DEFAULT_MAX_BACKOFF).jitter(true)
    }
}

impl BackoffStrategy for ExponentialBackoff {
    fn wait_duration(&self, attempt: usize) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let delay_ns = u32::try_from(exponent)
            .ok()
            .and_then(|exponent| 1_u128.checked_shl(exponent))
            .and_then(|multiplier| self.min.as_nanos().checked_mul(multiplier));
        let delay = match delay_ns {
            Some(nanos) if nanos <= self.max.as_nanos() => nanos_to_duration(nanos),
            _ => self.max,
        };
        finish_delay(delay, self.jitter, self.min, self.max)
    }
}

fn nanos_to_duration(nanos: u128) -> Duration {
    const NANOS_PER_SEC: u128 = 1_000_000_000;
    let secs = u64::try_from(nanos / NANOS_PER_SEC).unwrap_or(u64::MAX);
    Duration::new(secs, (nanos % NANOS_PER_SEC) as u32)
}

fn finish_delay(delay: Duration, jitter: bool, min: Duration, max: Duration) -> Duration {
    let delay = if jitter { apply_jitter(delay) } else { delay };
    clamp_delay(delay, min, max)
}

/// Moves `delay` by a uniform amount within a third of its length in either direction.
fn apply_jitter(delay: Duration) -> Duration {
    let delay_ns = delay.as_nanos().min(i64::MAX as u128) as i64;
    let max_jitter = delay_ns / 3;
    if max_jitter <= 0 {
        return delay;
    }

    let mut rng = rand::rng();
    let offset = rng.random_range(-max_jitter..max_jitter);
    let jittered = delay_ns.saturating_add(offset).max(1);
    Duration::from_nanos(jittered as u64)
}

fn clamp_delay(delay: Duration, min: Duration, max: Duration) -> Duration {
    if delay > max {
        return max;
    }
    if delay < min {
        return min;
    }
    delay
}
