//! Bandwidth limiting
//!
//! One `Throttle` per direction is shared by every connection of the node,
//! so `--limit-rate-up/down` caps the aggregate rate.

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use std::num::NonZeroU32;

/// Default upload limit in kB/s
pub const DEFAULT_LIMIT_RATE_UP: u64 = 8192;

/// Default download limit in kB/s
pub const DEFAULT_LIMIT_RATE_DOWN: u64 = 32768;

/// Token bucket over bytes, refilled once per second
pub struct Throttle {
    limiter: Option<DefaultDirectRateLimiter>,
    burst: u32,
}

impl Throttle {
    /// `kb_per_sec == 0` disables the limit
    pub fn new(kb_per_sec: u64) -> Self {
        let bytes = kb_per_sec.saturating_mul(1024).min(u32::MAX as u64) as u32;
        match NonZeroU32::new(bytes) {
            Some(rate) => Self {
                limiter: Some(RateLimiter::direct(Quota::per_second(rate))),
                burst: rate.get(),
            },
            None => Self::unlimited(),
        }
    }

    pub fn unlimited() -> Self {
        Self {
            limiter: None,
            burst: 0,
        }
    }

    pub fn is_limited(&self) -> bool {
        self.limiter.is_some()
    }

    /// Bytes per second, `None` when unlimited
    pub fn rate(&self) -> Option<u32> {
        self.limiter.as_ref().map(|_| self.burst)
    }

    /// Waits until `bytes` may pass. Frames larger than one second of
    /// budget are paid in burst-sized chunks.
    pub async fn consume(&self, bytes: usize) {
        let Some(limiter) = &self.limiter else {
            return;
        };
        let mut remaining = bytes as u64;
        while remaining > 0 {
            let chunk = remaining.min(self.burst as u64) as u32;
            let Some(n) = NonZeroU32::new(chunk) else {
                break;
            };
            if limiter.until_n_ready(n).await.is_err() {
                break;
            }
            remaining -= chunk as u64;
        }
    }
}

impl Default for Throttle {
    fn default() -> Self {
        Self::unlimited()
    }
}

impl std::fmt::Debug for Throttle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.rate() {
            Some(rate) => write!(f, "Throttle({} B/s)", rate),
            None => write!(f, "Throttle(unlimited)"),
        }
    }
}
