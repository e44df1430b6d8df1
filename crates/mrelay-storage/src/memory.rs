//! In-memory `Storage` backend.
//!
//! Serves two purposes: a zero-dependency mode for local development and the
//! substrate the integration tests run the relay pipeline against. The same
//! transactional rules apply as in the SQL backend, guarded by one lock.

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::Mutex;

use crate::rows::{
    AbilityRow, ChannelRow, ChannelStatus, LogInsert, TaskInsert, TaskPlatform, TaskRow,
    TaskStatus, TokenRow, UserRow,
};
use crate::storage::{Storage, StorageResult};

#[derive(Default)]
struct Inner {
    channels: Vec<ChannelRow>,
    abilities: Vec<AbilityRow>,
    users: Vec<UserRow>,
    tokens: Vec<TokenRow>,
    logs: Vec<LogEntry>,
    tasks: Vec<TaskRow>,
    next_task_id: i64,
}

#[derive(Debug, Clone)]
pub struct LogEntry {
    pub entry: LogInsert,
    pub created_at: i64,
}

#[derive(Default)]
pub struct MemoryStorage {
    inner: Mutex<Inner>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn seed_user(&self, user: UserRow) {
        self.inner.lock().await.users.push(user);
    }

    pub async fn seed_token(&self, token: TokenRow) {
        self.inner.lock().await.tokens.push(token);
    }

    pub async fn seed_channel(&self, channel: ChannelRow) {
        let mut inner = self.inner.lock().await;
        if channel.status == ChannelStatus::Enabled {
            for group in &channel.groups {
                for model in &channel.models {
                    inner.abilities.push(AbilityRow {
                        group: group.clone(),
                        model: model.clone(),
                        channel_id: channel.id,
                        enabled: true,
                        priority: channel.priority,
                        weight: channel.weight,
                    });
                }
            }
        }
        inner.channels.push(channel);
    }

    pub async fn user_quota(&self, user_id: i64) -> Option<i64> {
        let inner = self.inner.lock().await;
        inner
            .users
            .iter()
            .find(|user| user.id == user_id)
            .map(|user| user.quota)
    }

    pub async fn logs(&self) -> Vec<LogEntry> {
        self.inner.lock().await.logs.clone()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn sync(&self) -> StorageResult<()> {
        Ok(())
    }

    async fn load_channels(&self) -> StorageResult<Vec<ChannelRow>> {
        Ok(self.inner.lock().await.channels.clone())
    }

    async fn load_abilities(&self) -> StorageResult<Vec<AbilityRow>> {
        Ok(self.inner.lock().await.abilities.clone())
    }

    async fn get_channel(&self, id: i64) -> StorageResult<Option<ChannelRow>> {
        let inner = self.inner.lock().await;
        Ok(inner.channels.iter().find(|row| row.id == id).cloned())
    }

    async fn rebuild_channel_abilities(&self, channel: &ChannelRow) -> StorageResult<()> {
        let mut inner = self.inner.lock().await;
        inner.abilities.retain(|row| row.channel_id != channel.id);
        if channel.status == ChannelStatus::Enabled {
            for group in &channel.groups {
                for model in &channel.models {
                    inner.abilities.push(AbilityRow {
                        group: group.clone(),
                        model: model.clone(),
                        channel_id: channel.id,
                        enabled: true,
                        priority: channel.priority,
                        weight: channel.weight,
                    });
                }
            }
        }
        Ok(())
    }

    async fn set_channel_status(
        &self,
        id: i64,
        status: ChannelStatus,
        _reason: &str,
    ) -> StorageResult<()> {
        let mut inner = self.inner.lock().await;
        if let Some(channel) = inner.channels.iter_mut().find(|row| row.id == id) {
            channel.status = status;
        }
        let enabled = status == ChannelStatus::Enabled;
        for ability in inner
            .abilities
            .iter_mut()
            .filter(|row| row.channel_id == id)
        {
            ability.enabled = enabled;
        }
        Ok(())
    }

    async fn add_channel_used_quota(&self, _id: i64, _delta: i64) -> StorageResult<()> {
        Ok(())
    }

    async fn get_user(&self, id: i64) -> StorageResult<Option<UserRow>> {
        let inner = self.inner.lock().await;
        Ok(inner.users.iter().find(|row| row.id == id).cloned())
    }

    async fn get_token_by_key(&self, key: &str) -> StorageResult<Option<TokenRow>> {
        let inner = self.inner.lock().await;
        Ok(inner.tokens.iter().find(|row| row.key == key).cloned())
    }

    async fn get_token_by_id(&self, id: i64) -> StorageResult<Option<TokenRow>> {
        let inner = self.inner.lock().await;
        Ok(inner.tokens.iter().find(|row| row.id == id).cloned())
    }

    async fn pre_consume(
        &self,
        user_id: i64,
        token_id: i64,
        token_unlimited: bool,
        amount: i64,
    ) -> StorageResult<bool> {
        let mut inner = self.inner.lock().await;
        let Some(user_idx) = inner.users.iter().position(|row| row.id == user_id) else {
            return Ok(false);
        };
        if inner.users[user_idx].quota < amount {
            return Ok(false);
        }
        if !token_unlimited {
            let Some(token_idx) = inner.tokens.iter().position(|row| row.id == token_id) else {
                return Ok(false);
            };
            if inner.tokens[token_idx].remain_quota < amount {
                return Ok(false);
            }
            inner.tokens[token_idx].remain_quota -= amount;
        }
        inner.users[user_idx].quota -= amount;
        Ok(true)
    }

    async fn refund(
        &self,
        user_id: i64,
        token_id: i64,
        token_unlimited: bool,
        amount: i64,
    ) -> StorageResult<()> {
        let mut inner = self.inner.lock().await;
        if let Some(user) = inner.users.iter_mut().find(|row| row.id == user_id) {
            user.quota += amount;
        }
        if !token_unlimited {
            if let Some(token) = inner.tokens.iter_mut().find(|row| row.id == token_id) {
                token.remain_quota += amount;
            }
        }
        Ok(())
    }

    async fn commit_usage(
        &self,
        user_id: i64,
        token_id: i64,
        token_unlimited: bool,
        delta: i64,
        actual: i64,
    ) -> StorageResult<()> {
        let mut inner = self.inner.lock().await;
        if let Some(user) = inner.users.iter_mut().find(|row| row.id == user_id) {
            user.quota -= delta;
            user.used_quota += actual;
            user.request_count += 1;
        }
        if !token_unlimited && delta != 0 {
            if let Some(token) = inner.tokens.iter_mut().find(|row| row.id == token_id) {
                token.remain_quota -= delta;
            }
        }
        Ok(())
    }

    async fn insert_log(&self, entry: LogInsert) -> StorageResult<()> {
        let mut inner = self.inner.lock().await;
        inner.logs.push(LogEntry {
            entry,
            created_at: OffsetDateTime::now_utc().unix_timestamp(),
        });
        Ok(())
    }

    async fn insert_task(&self, task: TaskInsert) -> StorageResult<i64> {
        let mut inner = self.inner.lock().await;
        inner.next_task_id += 1;
        let id = inner.next_task_id;
        let now = OffsetDateTime::now_utc().unix_timestamp();
        inner.tasks.push(TaskRow {
            id,
            task_id: task.task_id,
            platform: task.platform,
            user_id: task.user_id,
            token_id: task.token_id,
            channel_id: task.channel_id,
            action: task.action,
            status: TaskStatus::Submitted,
            progress: String::new(),
            submit_time: now,
            start_time: 0,
            finish_time: 0,
            quota: task.quota,
            fail_reason: String::new(),
            data: task.data,
        });
        Ok(id)
    }

    async fn update_task(&self, task: &TaskRow) -> StorageResult<()> {
        let mut inner = self.inner.lock().await;
        if let Some(row) = inner.tasks.iter_mut().find(|row| row.id == task.id) {
            *row = task.clone();
        }
        Ok(())
    }

    async fn load_active_tasks(&self) -> StorageResult<Vec<TaskRow>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .tasks
            .iter()
            .filter(|row| !row.status.is_terminal())
            .cloned()
            .collect())
    }

    async fn get_task(
        &self,
        platform: TaskPlatform,
        task_id: &str,
    ) -> StorageResult<Option<TaskRow>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .tasks
            .iter()
            .find(|row| row.platform == platform && row.task_id == task_id)
            .cloned())
    }

    async fn list_user_tasks(
        &self,
        platform: TaskPlatform,
        user_id: i64,
        limit: u64,
    ) -> StorageResult<Vec<TaskRow>> {
        let inner = self.inner.lock().await;
        let mut rows: Vec<TaskRow> = inner
            .tasks
            .iter()
            .filter(|row| row.platform == platform && row.user_id == user_id)
            .cloned()
            .collect();
        rows.sort_by_key(|row| std::cmp::Reverse(row.submit_time));
        rows.truncate(limit as usize);
        Ok(rows)
    }
}
