use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum GlobalConfigError {
    #[error("missing required global config field: {0}")]
    MissingField(&'static str),
}

/// Final, merged global configuration used by the running process.
///
/// Merge order: CLI > ENV > built-in defaults. Hot-reloadable fields are
/// read through the published snapshot pointer in the core state; nothing
/// reads process-wide mutable statics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalConfig {
    pub host: String,
    pub port: u16,
    /// Database DSN used for this process.
    pub sql_dsn: String,
    /// Optional distributed cache backend. Accepted for multi-node setups;
    /// a single node runs entirely on in-memory snapshots.
    pub redis_conn_string: Option<String>,
    /// Must be identical across nodes; used to sign sessions.
    pub session_secret: String,
    /// Must be identical across nodes; used to encrypt stored credentials.
    pub crypto_secret: String,
    /// Per-event stream inactivity timeout, seconds.
    pub streaming_timeout: u64,
    /// Ability cache refresh interval, seconds.
    pub channel_update_frequency: u64,
    /// Max attempts across distinct channels for one client request.
    pub retry_times: u32,
    /// Max page size for async-task list queries.
    pub task_query_limit: u64,
    /// Async task poller interval, seconds.
    pub task_poll_interval: u64,
    /// Coalesce used_quota increments instead of writing per request.
    pub batch_update_enabled: bool,
    /// Flush interval for coalesced quota updates, seconds.
    pub batch_update_interval: u64,
    /// Directory that local-path file uploads are restricted to.
    pub file_upload_dir: Option<String>,
    /// Bounded concurrency for batch file uploads.
    pub file_upload_concurrency: usize,
    /// Per-user in-flight request cap. 0 disables the check.
    pub user_concurrency_limit: u32,
    /// Per-model requests-per-minute token bucket. 0 disables the check.
    pub model_rpm_limit: u32,
}

/// Optional layer used for merging global config.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GlobalConfigPatch {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub sql_dsn: Option<String>,
    pub redis_conn_string: Option<String>,
    pub session_secret: Option<String>,
    pub crypto_secret: Option<String>,
    pub streaming_timeout: Option<u64>,
    pub channel_update_frequency: Option<u64>,
    pub retry_times: Option<u32>,
    pub task_query_limit: Option<u64>,
    pub task_poll_interval: Option<u64>,
    pub batch_update_enabled: Option<bool>,
    pub batch_update_interval: Option<u64>,
    pub file_upload_dir: Option<String>,
    pub file_upload_concurrency: Option<usize>,
    pub user_concurrency_limit: Option<u32>,
    pub model_rpm_limit: Option<u32>,
}

impl GlobalConfigPatch {
    pub fn overlay(&mut self, other: GlobalConfigPatch) {
        macro_rules! take {
            ($($field:ident),* $(,)?) => {
                $(if other.$field.is_some() {
                    self.$field = other.$field;
                })*
            };
        }
        take!(
            host,
            port,
            sql_dsn,
            redis_conn_string,
            session_secret,
            crypto_secret,
            streaming_timeout,
            channel_update_frequency,
            retry_times,
            task_query_limit,
            task_poll_interval,
            batch_update_enabled,
            batch_update_interval,
            file_upload_dir,
            file_upload_concurrency,
            user_concurrency_limit,
            model_rpm_limit,
        );
    }

    pub fn into_config(self) -> Result<GlobalConfig, GlobalConfigError> {
        Ok(GlobalConfig {
            host: self.host.unwrap_or_else(|| "0.0.0.0".to_string()),
            port: self.port.unwrap_or(3000),
            sql_dsn: self.sql_dsn.ok_or(GlobalConfigError::MissingField("sql_dsn"))?,
            redis_conn_string: self.redis_conn_string,
            session_secret: self
                .session_secret
                .ok_or(GlobalConfigError::MissingField("session_secret"))?,
            crypto_secret: self
                .crypto_secret
                .ok_or(GlobalConfigError::MissingField("crypto_secret"))?,
            streaming_timeout: self.streaming_timeout.unwrap_or(60),
            channel_update_frequency: self.channel_update_frequency.unwrap_or(30),
            retry_times: self.retry_times.unwrap_or(3),
            task_query_limit: self.task_query_limit.unwrap_or(100),
            task_poll_interval: self.task_poll_interval.unwrap_or(5),
            batch_update_enabled: self.batch_update_enabled.unwrap_or(false),
            batch_update_interval: self.batch_update_interval.unwrap_or(5),
            file_upload_dir: self.file_upload_dir,
            file_upload_concurrency: self.file_upload_concurrency.unwrap_or(10),
            user_concurrency_limit: self.user_concurrency_limit.unwrap_or(0),
            model_rpm_limit: self.model_rpm_limit.unwrap_or(0),
        })
    }
}

impl From<GlobalConfig> for GlobalConfigPatch {
    fn from(value: GlobalConfig) -> Self {
        Self {
            host: Some(value.host),
            port: Some(value.port),
            sql_dsn: Some(value.sql_dsn),
            redis_conn_string: value.redis_conn_string,
            session_secret: Some(value.session_secret),
            crypto_secret: Some(value.crypto_secret),
            streaming_timeout: Some(value.streaming_timeout),
            channel_update_frequency: Some(value.channel_update_frequency),
            retry_times: Some(value.retry_times),
            task_query_limit: Some(value.task_query_limit),
            task_poll_interval: Some(value.task_poll_interval),
            batch_update_enabled: Some(value.batch_update_enabled),
            batch_update_interval: Some(value.batch_update_interval),
            file_upload_dir: value.file_upload_dir,
            file_upload_concurrency: Some(value.file_upload_concurrency),
            user_concurrency_limit: Some(value.user_concurrency_limit),
            model_rpm_limit: Some(value.model_rpm_limit),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_patch() -> GlobalConfigPatch {
        GlobalConfigPatch {
            sql_dsn: Some("sqlite://mrelay.db?mode=rwc".to_string()),
            session_secret: Some("s".to_string()),
            crypto_secret: Some("c".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn overlay_prefers_incoming_values() {
        let mut merged = base_patch();
        merged.overlay(GlobalConfigPatch {
            port: Some(8080),
            streaming_timeout: Some(15),
            ..Default::default()
        });
        let config = merged.into_config().unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.streaming_timeout, 15);
        assert_eq!(config.channel_update_frequency, 30);
    }

    #[test]
    fn missing_dsn_is_rejected() {
        let mut patch = base_patch();
        patch.sql_dsn = None;
        assert!(patch.into_config().is_err());
    }
}
