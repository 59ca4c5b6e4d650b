//! Price source seam
//!
//! The lifecycle engine only needs "the current price"; where it comes from is behind
//! [`PriceSource`].

pub mod http_feed;

pub use http_feed::HttpPriceSource;

use anyhow::Result;
use rand::Rng;
use std::time::Duration;

#[async_trait::async_trait]
pub trait PriceSource: Send + Sync {
    /// Current spot price. Errors only after the source's own retries are exhausted.
    async fn fetch_price(&self) -> Result<f64>;
}

/// Exponential backoff with full jitter: the n-th wait is uniform in
/// `[0, min(max, base * 2^n)]` milliseconds.
#[derive(Debug, Clone)]
pub struct Backoff {
    base_ms: u64,
    max_ms: u64,
    attempt: u32,
}

impl Backoff {
    pub fn new(base_ms: u64, max_ms: u64) -> Self {
        Self {
            base_ms,
            max_ms: max_ms.max(base_ms),
            attempt: 0,
        }
    }

    /// Upper bound for the next wait, before jitter.
    pub fn ceiling_ms(&self) -> u64 {
        let factor = 1u64.checked_shl(self.attempt.min(32)).unwrap_or(u64::MAX);
        self.base_ms.saturating_mul(factor).min(self.max_ms)
    }

    pub fn next_backoff(&mut self) -> Duration {
        let ceiling = self.ceiling_ms();
        self.attempt = self.attempt.saturating_add(1);
        let ms = rand::thread_rng().gen_range(0..=ceiling);
        Duration::from_millis(ms)
    }
}
