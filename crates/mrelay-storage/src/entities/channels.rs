use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "channels")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    /// Provider discriminant, see `rows::ChannelType`.
    #[sea_orm(column_name = "channel_type")]
    pub kind: i32,
    pub name: String,
    /// Newline-joined credential list; dispatch round-robins across entries.
    #[sea_orm(column_type = "Text")]
    pub key: String,
    pub base_url: String,
    /// Comma-separated model names this channel claims.
    #[sea_orm(column_type = "Text")]
    pub models: String,
    /// Comma-separated user groups this channel serves.
    pub groups: String,
    /// JSON object canonical -> provider-native model rename map.
    #[sea_orm(column_type = "Text", nullable)]
    pub model_mapping: Option<String>,
    /// JSON object of upstream-status overrides, see `rows::StatusCodeMapping`.
    #[sea_orm(nullable)]
    pub status_code_mapping: Option<String>,
    pub priority: i64,
    pub weight: i64,
    pub status: i32,
    pub auto_ban: bool,
    /// Free-form JSON: proxy, region, region_weights, sdk_mode.
    #[sea_orm(column_type = "Text", nullable)]
    pub setting: Option<String>,
    /// Last test result and auto-disable reason.
    #[sea_orm(column_type = "Text", nullable)]
    pub channel_info: Option<String>,
    pub balance: f64,
    pub used_quota: i64,
    pub response_time_ms: i32,
    pub test_time: i64,
    pub created_at: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
