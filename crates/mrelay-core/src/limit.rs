//! Backpressure ahead of pre-consume: a per-user in-flight request cap and a
//! per-model token bucket. Both reject with `RateLimited` before any quota
//! moves.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use mrelay_adapters::{RelayError, RelayErrorKind};
use tokio::sync::Mutex;

struct Bucket {
    tokens: f64,
    refilled_at: Instant,
}

pub struct RateGuard {
    user_inflight: DashMap<i64, Arc<AtomicU32>>,
    model_buckets: DashMap<String, Arc<Mutex<Bucket>>>,
}

impl Default for RateGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl RateGuard {
    pub fn new() -> Self {
        Self {
            user_inflight: DashMap::new(),
            model_buckets: DashMap::new(),
        }
    }

    /// Acquire both limits or fail. The returned guard releases the user's
    /// in-flight slot on drop, including every early-return path.
    pub async fn acquire(
        &self,
        user_id: i64,
        model: &str,
        user_limit: u32,
        model_rpm: u32,
    ) -> Result<InflightGuard, RelayError> {
        if model_rpm > 0 && !self.take_token(model, model_rpm).await {
            return Err(RelayError::new(
                RelayErrorKind::RateLimited,
                format!("model {model} is rate limited, retry later"),
            ));
        }

        let counter = self
            .user_inflight
            .entry(user_id)
            .or_insert_with(|| Arc::new(AtomicU32::new(0)))
            .clone();
        if user_limit > 0 {
            let current = counter.fetch_add(1, Ordering::SeqCst);
            if current >= user_limit {
                counter.fetch_sub(1, Ordering::SeqCst);
                return Err(RelayError::new(
                    RelayErrorKind::RateLimited,
                    "too many concurrent requests",
                ));
            }
        } else {
            counter.fetch_add(1, Ordering::SeqCst);
        }
        Ok(InflightGuard { counter })
    }

    async fn take_token(&self, model: &str, rpm: u32) -> bool {
        let bucket = self
            .model_buckets
            .entry(model.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(Bucket {
                    tokens: rpm as f64,
                    refilled_at: Instant::now(),
                }))
            })
            .clone();
        let mut bucket = bucket.lock().await;
        let elapsed = bucket.refilled_at.elapsed().as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * rpm as f64 / 60.0).min(rpm as f64);
        bucket.refilled_at = Instant::now();
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

pub struct InflightGuard {
    counter: Arc<AtomicU32>,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn user_concurrency_cap_enforced() {
        let guard = RateGuard::new();
        let first = guard.acquire(1, "m", 2, 0).await.unwrap();
        let _second = guard.acquire(1, "m", 2, 0).await.unwrap();
        assert!(guard.acquire(1, "m", 2, 0).await.is_err());
        drop(first);
        assert!(guard.acquire(1, "m", 2, 0).await.is_ok());
    }

    #[tokio::test]
    async fn model_bucket_rejects_when_empty() {
        let guard = RateGuard::new();
        // rpm=1: one token available, the second call must fail.
        let _ok = guard.acquire(1, "m", 0, 1).await.unwrap();
        assert!(guard.acquire(2, "m", 0, 1).await.is_err());
    }
}
