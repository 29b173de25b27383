/*
 * SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
 * SPDX-License-Identifier: Apache-2.0
 */

//! Token bucket rate limiter gating the reconciliation loops.

use tokio::time::Instant;

/// Allows `rate` consumptions per `window` seconds on average, with a
/// burst capacity of `rate`.
#[derive(Debug)]
pub struct TokenBucketRateLimiter {
    rate: f64,
    window: f64,
    allowance: f64,
    last_check: Instant,
}

impl TokenBucketRateLimiter {
    pub fn new(rate: u32, window_secs: u64) -> Self {
        TokenBucketRateLimiter {
            rate: f64::from(rate),
            window: window_secs as f64,
            allowance: f64::from(rate),
            last_check: Instant::now(),
        }
    }

    /// Consume one unit if available. Returns `false` when the caller
    /// should back off until the bucket refills.
    pub fn check(&mut self) -> bool {
        let current = Instant::now();
        let elapsed = current.duration_since(self.last_check).as_secs_f64();
        self.last_check = current;

        self.allowance += elapsed * (self.rate / self.window);
        if self.allowance > self.rate {
            self.allowance = self.rate;
        }
        if self.allowance < 1.0 {
            false
        } else {
            self.allowance -= 1.0;
            true
        }
    }
}
