use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "tokens")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub user_id: i64,
    /// Opaque API key, unique across the table.
    #[sea_orm(unique)]
    pub key: String,
    pub name: String,
    pub remain_quota: i64,
    pub unlimited_quota: bool,
    /// Unix seconds; -1 never expires.
    pub expired_at: i64,
    /// Comma-separated allow-list; empty string allows every model.
    pub allowed_models: String,
    /// Comma-separated allow-list; empty string allows every group.
    pub allowed_groups: String,
    /// Sticky routing override; 0 means unset.
    pub specific_channel_id: i64,
    pub status: i32,
    pub created_at: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::users::Entity",
        from = "Column::UserId",
        to = "super::users::Column::Id",
        on_delete = "Cascade"
    )]
    User,
}

impl Related<super::users::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::User.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
