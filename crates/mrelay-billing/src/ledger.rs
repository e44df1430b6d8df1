//! Two-phase quota protocol: reserve an upper bound before dispatch,
//! reconcile once usage is known, refund in full on any failure in between.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use mrelay_storage::{LogInsert, Storage, StorageError, TokenRow, UserRow};
use tracing::warn;

pub type LedgerResult<T> = Result<T, LedgerError>;

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("quota exceeded")]
    QuotaExceeded,
    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Clone)]
struct Cached<T> {
    value: T,
    at: Instant,
}

/// Atomic pre-consume / refund / settle across user and token balances,
/// with a short-TTL read cache in front of the durable store.
///
/// Writes invalidate the cached entry, so a request never observes its own
/// stale balance after an update.
pub struct Ledger {
    storage: Arc<dyn Storage>,
    users: DashMap<i64, Cached<UserRow>>,
    tokens: DashMap<String, Cached<TokenRow>>,
    cache_ttl: Duration,
    /// Coalesced channel used-quota increments, flushed on an interval when
    /// batch updates are enabled.
    pending_channel_quota: DashMap<i64, i64>,
    batch_updates: bool,
}

impl Ledger {
    pub fn new(storage: Arc<dyn Storage>, batch_updates: bool) -> Self {
        Self {
            storage,
            users: DashMap::new(),
            tokens: DashMap::new(),
            cache_ttl: Duration::from_secs(30),
            pending_channel_quota: DashMap::new(),
            batch_updates,
        }
    }

    pub async fn get_user(&self, id: i64) -> LedgerResult<Option<UserRow>> {
        if let Some(found) = self.users.get(&id) {
            if found.at.elapsed() < self.cache_ttl {
                return Ok(Some(found.value.clone()));
            }
        }
        let row = self.storage.get_user(id).await?;
        if let Some(row) = &row {
            self.users.insert(
                id,
                Cached {
                    value: row.clone(),
                    at: Instant::now(),
                },
            );
        }
        Ok(row)
    }

    pub async fn get_token(&self, key: &str) -> LedgerResult<Option<TokenRow>> {
        if let Some(found) = self.tokens.get(key) {
            if found.at.elapsed() < self.cache_ttl {
                return Ok(Some(found.value.clone()));
            }
        }
        let row = self.storage.get_token_by_key(key).await?;
        if let Some(row) = &row {
            self.tokens.insert(
                key.to_string(),
                Cached {
                    value: row.clone(),
                    at: Instant::now(),
                },
            );
        }
        Ok(row)
    }

    fn invalidate(&self, user_id: i64, token_key: &str) {
        self.users.remove(&user_id);
        self.tokens.remove(token_key);
    }

    pub async fn pre_consume(&self, token: &TokenRow, amount: i64) -> LedgerResult<()> {
        if amount <= 0 {
            return Ok(());
        }
        let ok = self
            .storage
            .pre_consume(token.user_id, token.id, token.unlimited_quota, amount)
            .await?;
        self.invalidate(token.user_id, &token.key);
        if ok {
            Ok(())
        } else {
            Err(LedgerError::QuotaExceeded)
        }
    }

    /// Full return of a reservation; used on any failure before settle.
    pub async fn refund(&self, token: &TokenRow, amount: i64) -> LedgerResult<()> {
        if amount <= 0 {
            return Ok(());
        }
        self.storage
            .refund(token.user_id, token.id, token.unlimited_quota, amount)
            .await?;
        self.invalidate(token.user_id, &token.key);
        Ok(())
    }

    /// Reconcile a finished request. `delta = actual - pre_consumed`; a
    /// negative delta refunds the surplus, a positive one deducts the overrun
    /// (which may push the user below zero for the in-flight request).
    pub async fn settle(&self, token: &TokenRow, pre_consumed: i64, actual: i64) -> LedgerResult<()> {
        let delta = actual - pre_consumed;
        self.storage
            .commit_usage(token.user_id, token.id, token.unlimited_quota, delta, actual)
            .await?;
        self.invalidate(token.user_id, &token.key);
        Ok(())
    }

    pub async fn record_log(&self, entry: LogInsert) {
        if let Err(err) = self.storage.insert_log(entry).await {
            warn!(event = "log_write_failed", error = %err);
        }
    }

    pub async fn add_channel_used_quota(&self, channel_id: i64, amount: i64) {
        if amount == 0 {
            return;
        }
        if self.batch_updates {
            *self.pending_channel_quota.entry(channel_id).or_insert(0) += amount;
            return;
        }
        if let Err(err) = self.storage.add_channel_used_quota(channel_id, amount).await {
            warn!(event = "channel_quota_update_failed", channel_id, error = %err);
        }
    }

    /// Flush coalesced channel increments; driven by the bootstrap interval
    /// task when `BATCH_UPDATE_ENABLED` is on.
    pub async fn flush_channel_quota(&self) {
        let drained: Vec<(i64, i64)> = self
            .pending_channel_quota
            .iter()
            .map(|entry| (*entry.key(), *entry.value()))
            .collect();
        for (channel_id, amount) in drained {
            self.pending_channel_quota.remove(&channel_id);
            if amount == 0 {
                continue;
            }
            if let Err(err) = self.storage.add_channel_used_quota(channel_id, amount).await {
                warn!(event = "channel_quota_flush_failed", channel_id, error = %err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mrelay_storage::{MemoryStorage, STATUS_ENABLED};

    fn token(user_id: i64, unlimited: bool) -> TokenRow {
        TokenRow {
            id: 7,
            user_id,
            key: "sk-test".into(),
            name: String::new(),
            remain_quota: 500,
            unlimited_quota: unlimited,
            expired_at: -1,
            allowed_models: vec![],
            allowed_groups: vec![],
            specific_channel_id: None,
            status: STATUS_ENABLED,
        }
    }

    fn user(id: i64, quota: i64) -> UserRow {
        UserRow {
            id,
            username: "u".into(),
            group: "default".into(),
            quota,
            used_quota: 0,
            request_count: 0,
            status: STATUS_ENABLED,
            role: 1,
        }
    }

    #[tokio::test]
    async fn pre_consume_then_settle_nets_to_actual() {
        let storage = Arc::new(MemoryStorage::new());
        storage.seed_user(user(1, 1000)).await;
        storage.seed_token(token(1, false)).await;
        let ledger = Ledger::new(storage.clone(), false);
        let t = token(1, false);

        ledger.pre_consume(&t, 100).await.unwrap();
        assert_eq!(storage.user_quota(1).await, Some(900));

        // Actual cost 40: surplus 60 comes back.
        ledger.settle(&t, 100, 40).await.unwrap();
        assert_eq!(storage.user_quota(1).await, Some(960));
    }

    #[tokio::test]
    async fn failed_request_refunds_in_full() {
        let storage = Arc::new(MemoryStorage::new());
        storage.seed_user(user(1, 1000)).await;
        storage.seed_token(token(1, false)).await;
        let ledger = Ledger::new(storage.clone(), false);
        let t = token(1, false);

        ledger.pre_consume(&t, 250).await.unwrap();
        ledger.refund(&t, 250).await.unwrap();
        assert_eq!(storage.user_quota(1).await, Some(1000));
    }

    #[tokio::test]
    async fn insufficient_balance_is_rejected_without_change() {
        let storage = Arc::new(MemoryStorage::new());
        storage.seed_user(user(1, 50)).await;
        storage.seed_token(token(1, false)).await;
        let ledger = Ledger::new(storage.clone(), false);
        let t = token(1, false);

        let err = ledger.pre_consume(&t, 100).await.unwrap_err();
        assert!(matches!(err, LedgerError::QuotaExceeded));
        assert_eq!(storage.user_quota(1).await, Some(50));
    }

    #[tokio::test]
    async fn overrun_settle_can_push_below_zero() {
        let storage = Arc::new(MemoryStorage::new());
        storage.seed_user(user(1, 100)).await;
        storage.seed_token(token(1, true)).await;
        let ledger = Ledger::new(storage.clone(), false);
        let t = token(1, true);

        ledger.pre_consume(&t, 100).await.unwrap();
        ledger.settle(&t, 100, 130).await.unwrap();
        assert_eq!(storage.user_quota(1).await, Some(-30));
    }
}
