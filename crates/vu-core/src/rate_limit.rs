//! Per-iteration RPS throttling (`options.rps`, `spec.md` §6).
//!
//! A plain token bucket rather than an external crate: the core already owns
//! a `Mutex`-guarded accrual counter for gas accounting in the teacher's
//! `gas` module, and this follows the identical shape — accrue on a timer,
//! spend on request, block the caller when the bucket is empty.

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::time::sleep;

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// A shared, clock-driven limiter capping the aggregate rate of `spend`
/// calls across every VU sharing it. `None` when `options.rps` is unset,
/// in which case `throttle` is a no-op.
pub struct RpsLimiter {
    rate_per_sec: f64,
    bucket: Mutex<Bucket>,
}

impl RpsLimiter {
    pub fn new(rps: u32) -> Self {
        Self {
            rate_per_sec: rps.max(1) as f64,
            bucket: Mutex::new(Bucket {
                tokens: rps as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    fn refill(&self, bucket: &mut Bucket) {
        let elapsed = bucket.last_refill.elapsed();
        bucket.tokens = (bucket.tokens + elapsed.as_secs_f64() * self.rate_per_sec)
            .min(self.rate_per_sec);
        bucket.last_refill = Instant::now();
    }

    /// Block the caller until one token is available. Checked once at the
    /// top of every iteration's network call, per `spec.md` §6.
    pub async fn throttle(&self) {
        loop {
            let wait = {
                let mut bucket = self.bucket.lock();
                self.refill(&mut bucket);
                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    None
                } else {
                    Some(Duration::from_secs_f64((1.0 - bucket.tokens) / self.rate_per_sec))
                }
            };
            match wait {
                None => return,
                Some(d) => sleep(d).await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn exhausts_then_refills_bucket() {
        let limiter = RpsLimiter::new(1000);
        for _ in 0..5 {
            limiter.throttle().await;
        }
        // Doesn't hang: either tokens were available or the wait was short.
    }
}
