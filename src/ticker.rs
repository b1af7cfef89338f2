//! Periodic ticker with ±10% jitter, so tickers started together drift apart.

use std::time::Duration;

use rand::Rng;
use tokio::time::{sleep_until, Instant};

/// Fraction of the period each tick may move earlier or later.
const JITTER: f64 = 0.1;

pub struct JitterTicker {
    period: Duration,
    next: Instant,
}

impl JitterTicker {
    /// First tick fires one (jittered) period from now.
    pub fn new(period: Duration) -> Self {
        let mut ticker = JitterTicker {
            period,
            next: Instant::now(),
        };
        ticker.next = ticker.next + ticker.jittered();
        ticker
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Waits for the next tick. Cancel safe: dropping the future leaves the
    /// deadline unchanged.
    pub async fn tick(&mut self) -> Instant {
        sleep_until(self.next).await;
        let fired = self.next;
        self.next = Instant::now() + self.jittered();
        fired
    }

    fn jittered(&self) -> Duration {
        jitter(self.period, &mut rand::thread_rng())
    }
}

fn jitter<R: Rng>(period: Duration, rng: &mut R) -> Duration {
    let factor = rng.gen_range((1.0 - JITTER)..=(1.0 + JITTER));
    period.mul_f64(factor)
}
