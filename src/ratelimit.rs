// src/ratelimit.rs
//! Fixed-window request limiting keyed by client IP.
//!
//! Counters live in a `CounterStore`. Without one the limiter lets
//! everything through.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, warn};

use crate::error::GatewayResult;
use crate::store::{CounterStore, RateWindow};

// Keeps a record alive a little past its window to absorb clock jitter.
const EXPIRY_SLACK_SECS: u64 = 10;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    pub remaining: u32,
    /// Unix seconds at which the current window closes; 0 when unlimited.
    pub reset_at: u64,
}

impl RateDecision {
    pub fn retry_after(&self, now: u64) -> u64 {
        self.reset_at.saturating_sub(now)
    }
}

#[derive(Clone)]
pub struct RateLimiter {
    store: Option<Arc<dyn CounterStore>>,
    max: u32,
    window: u64,
}

impl RateLimiter {
    pub fn new(store: Option<Arc<dyn CounterStore>>, max: u32, window_secs: u64) -> Self {
        Self {
            store,
            max,
            window: window_secs.max(1),
        }
    }

    pub async fn check_and_consume(&self, client_key: &str) -> RateDecision {
        self.check_and_consume_at(client_key, Utc::now().timestamp().max(0) as u64)
            .await
    }

    /// Never fails: an unreachable counter store lets the request through.
    pub async fn check_and_consume_at(&self, client_key: &str, now: u64) -> RateDecision {
        let Some(store) = &self.store else {
            return self.unlimited();
        };
        match self.consume(store.as_ref(), client_key, now).await {
            Ok(decision) => decision,
            Err(e) => {
                warn!(client = %client_key, "rate limit store unavailable: {e}");
                self.unlimited()
            }
        }
    }

    fn unlimited(&self) -> RateDecision {
        RateDecision {
            allowed: true,
            remaining: self.max,
            reset_at: 0,
        }
    }

    async fn consume(
        &self,
        store: &dyn CounterStore,
        client_key: &str,
        now: u64,
    ) -> GatewayResult<RateDecision> {
        let key = format!("ratelimit:{client_key}");
        let window_start = now - (now % self.window);
        let reset_at = window_start + self.window;

        // A record from an earlier window is replaced, never merged.
        let count = match store.load(&key).await? {
            Some(w) if w.window_start == window_start => w.count,
            _ => 0,
        };

        if count >= self.max {
            warn!(client = %client_key, count, "rate limit exceeded");
            return Ok(RateDecision {
                allowed: false,
                remaining: 0,
                reset_at,
            });
        }

        let count = count + 1;
        store
            .save(
                &key,
                RateWindow { window_start, count },
                Duration::from_secs(self.window + EXPIRY_SLACK_SECS),
            )
            .await?;
        debug!(client = %client_key, count, max = self.max, "rate limit ok");

        Ok(RateDecision {
            allowed: true,
            remaining: self.max - count,
            reset_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn limiter() -> RateLimiter {
        RateLimiter::new(Some(Arc::new(MemoryStore::new())), 20, 60)
    }

    #[tokio::test]
    async fn twenty_first_request_in_window_is_rejected() {
        let rl = limiter();
        let base = 1_700_000_040; // window [1_700_000_040, 1_700_000_100)
        for i in 0..20 {
            let d = rl.check_and_consume_at("1.2.3.4", base + i).await;
            assert!(d.allowed);
            assert_eq!(d.remaining, 19 - i as u32);
            assert_eq!(d.reset_at, 1_700_000_100);
        }
        let d = rl.check_and_consume_at("1.2.3.4", base + 30).await;
        assert_eq!(
            d,
            RateDecision {
                allowed: false,
                remaining: 0,
                reset_at: 1_700_000_100
            }
        );
        assert_eq!(d.retry_after(base + 30), 30);

        // Other clients have their own counters.
        assert!(rl.check_and_consume_at("5.6.7.8", base).await.allowed);
    }

    #[tokio::test]
    async fn next_window_resets_count() {
        let rl = limiter();
        let base = 1_700_000_040;
        for i in 0..21 {
            rl.check_and_consume_at("1.2.3.4", base + i).await;
        }
        let d = rl.check_and_consume_at("1.2.3.4", base + 60).await;
        assert!(d.allowed);
        assert_eq!(d.remaining, 19);
        assert_eq!(d.reset_at, 1_700_000_160);
    }

    #[tokio::test]
    async fn rejection_does_not_consume() {
        let store = Arc::new(MemoryStore::new());
        let rl = RateLimiter::new(Some(store.clone()), 1, 60);
        rl.check_and_consume_at("ip", 120).await;
        rl.check_and_consume_at("ip", 121).await;
        let w = store.load("ratelimit:ip").await.unwrap().unwrap();
        assert_eq!(w, RateWindow { window_start: 120, count: 1 });
    }

    #[tokio::test]
    async fn fails_open_without_store() {
        let rl = RateLimiter::new(None, 20, 60);
        for _ in 0..100 {
            assert!(rl.check_and_consume_at("ip", 0).await.allowed);
        }
    }
}
