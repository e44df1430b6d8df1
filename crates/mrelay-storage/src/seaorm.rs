use async_trait::async_trait;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ActiveValue, ColumnTrait, ConnectOptions, ConnectionTrait, Database,
    DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, QuerySelect, Schema,
    TransactionTrait,
};
use time::OffsetDateTime;

use crate::entities::{abilities, channels, logs, relay_tasks, tokens, users};
use crate::rows::{
    split_csv, AbilityRow, ChannelRow, ChannelSetting, ChannelStatus, ChannelType, LogInsert,
    StatusCodeMapping, TaskInsert, TaskPlatform, TaskRow, TaskStatus, TokenRow, UserRow,
};
use crate::storage::{Storage, StorageResult};

pub struct SeaOrmStorage {
    db: DatabaseConnection,
}

impl SeaOrmStorage {
    pub async fn connect(dsn: &str) -> StorageResult<Self> {
        let mut options = ConnectOptions::new(dsn.to_string());
        options.sqlx_logging(false);
        let db = Database::connect(options).await?;
        Ok(Self { db })
    }

    pub fn db(&self) -> &DatabaseConnection {
        &self.db
    }

    async fn create_table<E: EntityTrait>(&self, entity: E) -> StorageResult<()> {
        let backend = self.db.get_database_backend();
        let schema = Schema::new(backend);
        let mut stmt = schema.create_table_from_entity(entity);
        stmt.if_not_exists();
        self.db.execute(backend.build(&stmt)).await?;
        Ok(())
    }
}

fn now_unix() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

fn channel_row(model: channels::Model) -> Option<ChannelRow> {
    let kind = ChannelType::from_i32(model.kind)?;
    let model_mapping = model
        .model_mapping
        .as_deref()
        .filter(|raw| !raw.trim().is_empty())
        .and_then(|raw| serde_json::from_str(raw).ok())
        .unwrap_or_default();
    let status_code_mapping = model
        .status_code_mapping
        .as_deref()
        .filter(|raw| !raw.trim().is_empty())
        .and_then(|raw| serde_json::from_str::<StatusCodeMapping>(raw).ok());
    let setting = model
        .setting
        .as_deref()
        .filter(|raw| !raw.trim().is_empty())
        .and_then(|raw| serde_json::from_str::<ChannelSetting>(raw).ok())
        .unwrap_or_default();
    Some(ChannelRow {
        id: model.id,
        kind,
        name: model.name,
        key: model.key,
        base_url: model.base_url,
        models: split_csv(&model.models),
        groups: split_csv(&model.groups),
        model_mapping,
        status_code_mapping,
        priority: model.priority,
        weight: model.weight,
        status: ChannelStatus::from_i32(model.status),
        auto_ban: model.auto_ban,
        setting,
    })
}

fn user_row(model: users::Model) -> UserRow {
    UserRow {
        id: model.id,
        username: model.username,
        group: model.group,
        quota: model.quota,
        used_quota: model.used_quota,
        request_count: model.request_count,
        status: model.status,
        role: model.role,
    }
}

fn token_row(model: tokens::Model) -> TokenRow {
    TokenRow {
        id: model.id,
        user_id: model.user_id,
        key: model.key,
        name: model.name,
        remain_quota: model.remain_quota,
        unlimited_quota: model.unlimited_quota,
        expired_at: model.expired_at,
        allowed_models: split_csv(&model.allowed_models),
        allowed_groups: split_csv(&model.allowed_groups),
        specific_channel_id: (model.specific_channel_id > 0).then_some(model.specific_channel_id),
        status: model.status,
    }
}

fn task_row(model: relay_tasks::Model) -> Option<TaskRow> {
    Some(TaskRow {
        id: model.id,
        task_id: model.task_id,
        platform: TaskPlatform::from_str(&model.platform)?,
        user_id: model.user_id,
        token_id: model.token_id,
        channel_id: model.channel_id,
        action: model.action,
        status: TaskStatus::from_str(&model.status),
        progress: model.progress,
        submit_time: model.submit_time,
        start_time: model.start_time,
        finish_time: model.finish_time,
        quota: model.quota,
        fail_reason: model.fail_reason,
        data: model.data,
    })
}

#[async_trait]
impl Storage for SeaOrmStorage {
    async fn sync(&self) -> StorageResult<()> {
        self.create_table(users::Entity).await?;
        self.create_table(tokens::Entity).await?;
        self.create_table(channels::Entity).await?;
        self.create_table(abilities::Entity).await?;
        self.create_table(logs::Entity).await?;
        self.create_table(relay_tasks::Entity).await?;
        Ok(())
    }

    async fn load_channels(&self) -> StorageResult<Vec<ChannelRow>> {
        let models = channels::Entity::find().all(&self.db).await?;
        Ok(models.into_iter().filter_map(channel_row).collect())
    }

    async fn load_abilities(&self) -> StorageResult<Vec<AbilityRow>> {
        let models = abilities::Entity::find().all(&self.db).await?;
        Ok(models
            .into_iter()
            .map(|model| AbilityRow {
                group: model.group,
                model: model.model,
                channel_id: model.channel_id,
                enabled: model.enabled,
                priority: model.priority,
                weight: model.weight,
            })
            .collect())
    }

    async fn get_channel(&self, id: i64) -> StorageResult<Option<ChannelRow>> {
        let model = channels::Entity::find_by_id(id).one(&self.db).await?;
        Ok(model.and_then(channel_row))
    }

    async fn rebuild_channel_abilities(&self, channel: &ChannelRow) -> StorageResult<()> {
        let txn = self.db.begin().await?;
        abilities::Entity::delete_many()
            .filter(abilities::Column::ChannelId.eq(channel.id))
            .exec(&txn)
            .await?;
        let enabled = channel.status == ChannelStatus::Enabled;
        if enabled {
            let mut rows = Vec::new();
            for group in &channel.groups {
                for model in &channel.models {
                    rows.push(abilities::ActiveModel {
                        group: ActiveValue::Set(group.clone()),
                        model: ActiveValue::Set(model.clone()),
                        channel_id: ActiveValue::Set(channel.id),
                        enabled: ActiveValue::Set(true),
                        priority: ActiveValue::Set(channel.priority),
                        weight: ActiveValue::Set(channel.weight),
                    });
                }
            }
            if !rows.is_empty() {
                abilities::Entity::insert_many(rows).exec(&txn).await?;
            }
        }
        txn.commit().await?;
        Ok(())
    }

    async fn set_channel_status(
        &self,
        id: i64,
        status: ChannelStatus,
        reason: &str,
    ) -> StorageResult<()> {
        let info = serde_json::json!({
            "status_reason": reason,
            "status_time": now_unix(),
        });
        let txn = self.db.begin().await?;
        channels::Entity::update_many()
            .col_expr(channels::Column::Status, Expr::value(status as i32))
            .col_expr(channels::Column::ChannelInfo, Expr::value(info.to_string()))
            .filter(channels::Column::Id.eq(id))
            .exec(&txn)
            .await?;
        // Disabled channels must disappear from routing atomically.
        if status != ChannelStatus::Enabled {
            abilities::Entity::update_many()
                .col_expr(abilities::Column::Enabled, Expr::value(false))
                .filter(abilities::Column::ChannelId.eq(id))
                .exec(&txn)
                .await?;
        } else {
            abilities::Entity::update_many()
                .col_expr(abilities::Column::Enabled, Expr::value(true))
                .filter(abilities::Column::ChannelId.eq(id))
                .exec(&txn)
                .await?;
        }
        txn.commit().await?;
        Ok(())
    }

    async fn add_channel_used_quota(&self, id: i64, delta: i64) -> StorageResult<()> {
        channels::Entity::update_many()
            .col_expr(
                channels::Column::UsedQuota,
                Expr::col(channels::Column::UsedQuota).add(delta),
            )
            .filter(channels::Column::Id.eq(id))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn get_user(&self, id: i64) -> StorageResult<Option<UserRow>> {
        let model = users::Entity::find_by_id(id).one(&self.db).await?;
        Ok(model.map(user_row))
    }

    async fn get_token_by_key(&self, key: &str) -> StorageResult<Option<TokenRow>> {
        let model = tokens::Entity::find()
            .filter(tokens::Column::Key.eq(key))
            .one(&self.db)
            .await?;
        Ok(model.map(token_row))
    }

    async fn get_token_by_id(&self, id: i64) -> StorageResult<Option<TokenRow>> {
        let model = tokens::Entity::find_by_id(id).one(&self.db).await?;
        Ok(model.map(token_row))
    }

    async fn pre_consume(
        &self,
        user_id: i64,
        token_id: i64,
        token_unlimited: bool,
        amount: i64,
    ) -> StorageResult<bool> {
        let txn = self.db.begin().await?;
        let updated = users::Entity::update_many()
            .col_expr(
                users::Column::Quota,
                Expr::col(users::Column::Quota).sub(amount),
            )
            .filter(users::Column::Id.eq(user_id))
            .filter(users::Column::Quota.gte(amount))
            .exec(&txn)
            .await?;
        if updated.rows_affected == 0 {
            txn.rollback().await?;
            return Ok(false);
        }
        if !token_unlimited {
            let updated = tokens::Entity::update_many()
                .col_expr(
                    tokens::Column::RemainQuota,
                    Expr::col(tokens::Column::RemainQuota).sub(amount),
                )
                .filter(tokens::Column::Id.eq(token_id))
                .filter(tokens::Column::RemainQuota.gte(amount))
                .exec(&txn)
                .await?;
            if updated.rows_affected == 0 {
                txn.rollback().await?;
                return Ok(false);
            }
        }
        txn.commit().await?;
        Ok(true)
    }

    async fn refund(
        &self,
        user_id: i64,
        token_id: i64,
        token_unlimited: bool,
        amount: i64,
    ) -> StorageResult<()> {
        let txn = self.db.begin().await?;
        users::Entity::update_many()
            .col_expr(
                users::Column::Quota,
                Expr::col(users::Column::Quota).add(amount),
            )
            .filter(users::Column::Id.eq(user_id))
            .exec(&txn)
            .await?;
        if !token_unlimited {
            tokens::Entity::update_many()
                .col_expr(
                    tokens::Column::RemainQuota,
                    Expr::col(tokens::Column::RemainQuota).add(amount),
                )
                .filter(tokens::Column::Id.eq(token_id))
                .exec(&txn)
                .await?;
        }
        txn.commit().await?;
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
        let txn = self.db.begin().await?;
        users::Entity::update_many()
            .col_expr(
                users::Column::Quota,
                Expr::col(users::Column::Quota).sub(delta),
            )
            .col_expr(
                users::Column::UsedQuota,
                Expr::col(users::Column::UsedQuota).add(actual),
            )
            .col_expr(
                users::Column::RequestCount,
                Expr::col(users::Column::RequestCount).add(1),
            )
            .filter(users::Column::Id.eq(user_id))
            .exec(&txn)
            .await?;
        if !token_unlimited && delta != 0 {
            tokens::Entity::update_many()
                .col_expr(
                    tokens::Column::RemainQuota,
                    Expr::col(tokens::Column::RemainQuota).sub(delta),
                )
                .filter(tokens::Column::Id.eq(token_id))
                .exec(&txn)
                .await?;
        }
        txn.commit().await?;
        Ok(())
    }

    async fn insert_log(&self, entry: LogInsert) -> StorageResult<()> {
        let model = logs::ActiveModel {
            id: ActiveValue::NotSet,
            user_id: ActiveValue::Set(entry.user_id),
            token_id: ActiveValue::Set(entry.token_id),
            channel_id: ActiveValue::Set(entry.channel_id),
            model: ActiveValue::Set(entry.model),
            kind: ActiveValue::Set(entry.kind as i32),
            prompt_tokens: ActiveValue::Set(entry.prompt_tokens),
            completion_tokens: ActiveValue::Set(entry.completion_tokens),
            quota: ActiveValue::Set(entry.quota),
            elapsed_ms: ActiveValue::Set(entry.elapsed_ms),
            is_stream: ActiveValue::Set(entry.is_stream),
            content: ActiveValue::Set(entry.content),
            created_at: ActiveValue::Set(now_unix()),
        };
        model.insert(&self.db).await?;
        Ok(())
    }

    async fn insert_task(&self, task: TaskInsert) -> StorageResult<i64> {
        let now = now_unix();
        let model = relay_tasks::ActiveModel {
            id: ActiveValue::NotSet,
            task_id: ActiveValue::Set(task.task_id),
            platform: ActiveValue::Set(task.platform.as_str().to_string()),
            user_id: ActiveValue::Set(task.user_id),
            token_id: ActiveValue::Set(task.token_id),
            channel_id: ActiveValue::Set(task.channel_id),
            action: ActiveValue::Set(task.action),
            status: ActiveValue::Set(TaskStatus::Submitted.as_str().to_string()),
            progress: ActiveValue::Set(String::new()),
            submit_time: ActiveValue::Set(now),
            start_time: ActiveValue::Set(0),
            finish_time: ActiveValue::Set(0),
            quota: ActiveValue::Set(task.quota),
            fail_reason: ActiveValue::Set(String::new()),
            data: ActiveValue::Set(task.data),
        };
        let inserted = model.insert(&self.db).await?;
        Ok(inserted.id)
    }

    async fn update_task(&self, task: &TaskRow) -> StorageResult<()> {
        let model = relay_tasks::ActiveModel {
            id: ActiveValue::Unchanged(task.id),
            task_id: ActiveValue::Unchanged(task.task_id.clone()),
            platform: ActiveValue::Unchanged(task.platform.as_str().to_string()),
            user_id: ActiveValue::Unchanged(task.user_id),
            token_id: ActiveValue::Unchanged(task.token_id),
            channel_id: ActiveValue::Unchanged(task.channel_id),
            action: ActiveValue::Unchanged(task.action.clone()),
            status: ActiveValue::Set(task.status.as_str().to_string()),
            progress: ActiveValue::Set(task.progress.clone()),
            submit_time: ActiveValue::Unchanged(task.submit_time),
            start_time: ActiveValue::Set(task.start_time),
            finish_time: ActiveValue::Set(task.finish_time),
            quota: ActiveValue::Set(task.quota),
            fail_reason: ActiveValue::Set(task.fail_reason.clone()),
            data: ActiveValue::Set(task.data.clone()),
        };
        model.update(&self.db).await?;
        Ok(())
    }

    async fn load_active_tasks(&self) -> StorageResult<Vec<TaskRow>> {
        let models = relay_tasks::Entity::find()
            .filter(
                relay_tasks::Column::Status.is_in(vec![
                    TaskStatus::Submitted.as_str(),
                    TaskStatus::Queued.as_str(),
                    TaskStatus::InProgress.as_str(),
                    TaskStatus::Unknown.as_str(),
                ]),
            )
            .all(&self.db)
            .await?;
        Ok(models.into_iter().filter_map(task_row).collect())
    }

    async fn get_task(
        &self,
        platform: TaskPlatform,
        task_id: &str,
    ) -> StorageResult<Option<TaskRow>> {
        let model = relay_tasks::Entity::find()
            .filter(relay_tasks::Column::Platform.eq(platform.as_str()))
            .filter(relay_tasks::Column::TaskId.eq(task_id))
            .one(&self.db)
            .await?;
        Ok(model.and_then(task_row))
    }

    async fn list_user_tasks(
        &self,
        platform: TaskPlatform,
        user_id: i64,
        limit: u64,
    ) -> StorageResult<Vec<TaskRow>> {
        let models = relay_tasks::Entity::find()
            .filter(relay_tasks::Column::Platform.eq(platform.as_str()))
            .filter(relay_tasks::Column::UserId.eq(user_id))
            .order_by_desc(relay_tasks::Column::SubmitTime)
            .limit(limit)
            .all(&self.db)
            .await?;
        Ok(models.into_iter().filter_map(task_row).collect())
    }
}
