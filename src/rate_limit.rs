use std::time::Duration;

use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::{Instant, Interval, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;

use crate::context::{Cancellation, Context};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum RateLimitError {
    #[error("rate limit wait interrupted: {0:?}")]
    Interrupted(Cancellation),
    #[error("rate limiter is closed")]
    Closed,
}

#[derive(Debug)]
pub struct RateLimiter {
    period: Option<Duration>,
    ticker: Mutex<Option<Interval>>,
    shutdown: CancellationToken,
}

impl RateLimiter {
    pub fn new(rate: u32, duration: Duration) -> Self {
        let period = if rate == 0 || duration.is_zero() {
            None
        } else {
            Some((duration / rate).max(Duration::from_nanos(1)))
        };
        Self {
            period,
            ticker: Mutex::new(None),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(0, Duration::ZERO)
    }

    pub fn interval(&self) -> Option<Duration> {
        self.period
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub fn close(&self) {
        self.shutdown.cancel();
    }

    pub async fn limit(&self, cx: &Context) -> Result<(), RateLimitError> {
        let Some(period) = self.period else {
            return Ok(());
        };
        if self.shutdown.is_cancelled() {
            return Err(RateLimitError::Closed);
        }

        tokio::select! {
            biased;
            reason = cx.done() => {
                self.shutdown.cancel();
                tracing::debug!(?reason, "rate limit wait interrupted, limiter closed");
                Err(RateLimitError::Interrupted(reason))
            }
            () = self.shutdown.cancelled() => Err(RateLimitError::Closed),
            () = self.next_slot(period) => Ok(()),
        }
    }

    async fn next_slot(&self, period: Duration) {
        let mut ticker = self.ticker.lock().await;
        let ticker = ticker.get_or_insert_with(|| {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });
        ticker.tick().await;
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::unlimited()
    }
}
