use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "relay_tasks")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    /// Provider-local job id returned by the submit call.
    pub task_id: String,
    /// "mj" or "suno".
    pub platform: String,
    pub user_id: i64,
    pub token_id: i64,
    pub channel_id: i64,
    pub action: String,
    /// See `rows::TaskStatus`.
    pub status: String,
    pub progress: String,
    pub submit_time: i64,
    pub start_time: i64,
    pub finish_time: i64,
    /// Reserved amount, zeroed once finalised. Finalisation is idempotent
    /// because a zero reservation has nothing left to settle.
    pub quota: i64,
    #[sea_orm(column_type = "Text")]
    pub fail_reason: String,
    /// Raw provider task payload for client fetches.
    #[sea_orm(column_type = "Text")]
    pub data: String,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
