//! Cache for provider-side derived tokens (Baidu OAuth access tokens,
//! Zhipu JWTs). Entries are keyed by the channel credential; a keyed mutex
//! coalesces concurrent refreshes of the same credential.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::error::RelayResult;

#[derive(Clone)]
struct Entry {
    token: String,
    expires_at: Instant,
}

#[derive(Default)]
pub struct UpstreamTokenCache {
    entries: DashMap<String, Entry>,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl UpstreamTokenCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached token for `key`, refreshing through `refresh` when
    /// missing or expired. Only one refresh per key runs at a time; waiters
    /// re-check the cache after the lock.
    pub async fn get_or_refresh<F, Fut>(&self, key: &str, refresh: F) -> RelayResult<String>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = RelayResult<(String, Duration)>>,
    {
        if let Some(entry) = self.entries.get(key) {
            if entry.expires_at > Instant::now() {
                return Ok(entry.token.clone());
            }
        }

        let lock = self
            .locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        // Someone else may have refreshed while we waited.
        if let Some(entry) = self.entries.get(key) {
            if entry.expires_at > Instant::now() {
                return Ok(entry.token.clone());
            }
        }

        let (token, ttl) = refresh().await?;
        // Renew slightly early so in-flight requests never carry a token
        // that expires mid-call.
        let safety = ttl / 10;
        self.entries.insert(
            key.to_string(),
            Entry {
                token: token.clone(),
                expires_at: Instant::now() + ttl.saturating_sub(safety),
            },
        );
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn refresh_runs_once_for_concurrent_callers() {
        let cache = Arc::new(UpstreamTokenCache::new());
        let refreshes = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let refreshes = refreshes.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_refresh("cred", || async {
                        refreshes.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        Ok(("token".to_string(), Duration::from_secs(60)))
                    })
                    .await
                    .unwrap()
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap(), "token");
        }
        assert_eq!(refreshes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn expired_token_is_refreshed() {
        let cache = UpstreamTokenCache::new();
        let first = cache
            .get_or_refresh("cred", || async {
                Ok(("one".to_string(), Duration::from_millis(1)))
            })
            .await
            .unwrap();
        assert_eq!(first, "one");
        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = cache
            .get_or_refresh("cred", || async {
                Ok(("two".to_string(), Duration::from_secs(60)))
            })
            .await
            .unwrap();
        assert_eq!(second, "two");
    }
}
