pub mod abilities;
pub mod channels;
pub mod logs;
pub mod relay_tasks;
pub mod tokens;
pub mod users;
