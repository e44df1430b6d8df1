//! Durable records for users, tokens, channels, abilities, logs and
//! async tasks, plus the `Storage` trait the rest of the workspace talks to.
//!
//! Runtime routing reads come from in-memory snapshots built out of
//! `load_channels` / `load_abilities`; only ledger updates and accounting
//! writes touch the database per request.

pub mod entities;
pub mod memory;
pub mod rows;
pub mod seaorm;
pub mod storage;

pub use memory::MemoryStorage;
pub use rows::{
    split_csv, AbilityRow, ChannelRow, ChannelSetting, ChannelStatus, ChannelType, LogInsert,
    LogKind, StatusCodeMapping, TaskInsert, TaskPlatform, TaskRow, TaskStatus, TokenRow, UserRow,
    ROLE_ADMIN, ROLE_USER, STATUS_DISABLED, STATUS_ENABLED,
};
pub use seaorm::SeaOrmStorage;
pub use storage::{Storage, StorageError, StorageResult};
