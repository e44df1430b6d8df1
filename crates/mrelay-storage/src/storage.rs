use async_trait::async_trait;

use crate::rows::{
    AbilityRow, ChannelRow, ChannelStatus, LogInsert, TaskInsert, TaskPlatform, TaskRow, TokenRow,
    UserRow,
};

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("db error: {0}")]
    Db(#[from] sea_orm::DbErr),
    #[error("serde json error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("row not found: {0}")]
    NotFound(&'static str),
}

/// Durable record access.
///
/// The relay path never queries the database for routing data; channels and
/// abilities are loaded into snapshots by the refresh task. User, token and
/// quota operations do hit the store because they must be transactional.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Entity-first schema sync, run once at bootstrap.
    async fn sync(&self) -> StorageResult<()>;

    // Channels / abilities
    async fn load_channels(&self) -> StorageResult<Vec<ChannelRow>>;
    async fn load_abilities(&self) -> StorageResult<Vec<AbilityRow>>;
    async fn get_channel(&self, id: i64) -> StorageResult<Option<ChannelRow>>;
    /// Replace the channel's derived ability rows in one transaction.
    async fn rebuild_channel_abilities(&self, channel: &ChannelRow) -> StorageResult<()>;
    async fn set_channel_status(
        &self,
        id: i64,
        status: ChannelStatus,
        reason: &str,
    ) -> StorageResult<()>;
    async fn add_channel_used_quota(&self, id: i64, delta: i64) -> StorageResult<()>;

    // Users / tokens
    async fn get_user(&self, id: i64) -> StorageResult<Option<UserRow>>;
    async fn get_token_by_key(&self, key: &str) -> StorageResult<Option<TokenRow>>;
    async fn get_token_by_id(&self, id: i64) -> StorageResult<Option<TokenRow>>;

    // Quota ledger primitives
    /// Atomically reserve `amount` from the user balance and, unless the
    /// token is unlimited, from the token balance. Returns false (and leaves
    /// both untouched) when either side is insufficient.
    async fn pre_consume(
        &self,
        user_id: i64,
        token_id: i64,
        token_unlimited: bool,
        amount: i64,
    ) -> StorageResult<bool>;
    /// Return `amount` to both balances. Unconditional.
    async fn refund(
        &self,
        user_id: i64,
        token_id: i64,
        token_unlimited: bool,
        amount: i64,
    ) -> StorageResult<()>;
    /// Apply the settle delta (positive = extra deduction, negative = refund
    /// of surplus), record `actual` into used_quota and bump request_count.
    async fn commit_usage(
        &self,
        user_id: i64,
        token_id: i64,
        token_unlimited: bool,
        delta: i64,
        actual: i64,
    ) -> StorageResult<()>;

    // Accounting
    async fn insert_log(&self, entry: LogInsert) -> StorageResult<()>;

    // Async tasks
    async fn insert_task(&self, task: TaskInsert) -> StorageResult<i64>;
    async fn update_task(&self, task: &TaskRow) -> StorageResult<()>;
    async fn load_active_tasks(&self) -> StorageResult<Vec<TaskRow>>;
    async fn get_task(
        &self,
        platform: TaskPlatform,
        task_id: &str,
    ) -> StorageResult<Option<TaskRow>>;
    async fn list_user_tasks(
        &self,
        platform: TaskPlatform,
        user_id: i64,
        limit: u64,
    ) -> StorageResult<Vec<TaskRow>>;
}
