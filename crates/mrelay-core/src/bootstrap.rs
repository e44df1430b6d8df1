use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};

use mrelay_common::{GlobalConfig, GlobalConfigPatch};
use mrelay_storage::{MemoryStorage, SeaOrmStorage, Storage};

use crate::state::AppState;

#[derive(Debug, Clone, Parser)]
#[command(name = "mrelay", version, about = "Unified multi-provider AI relay")]
pub struct CliArgs {
    /// Database DSN. `memory://` runs on the in-memory store.
    #[arg(long, env = "SQL_DSN", default_value = "sqlite://mrelay.db?mode=rwc")]
    pub sql_dsn: String,

    /// Optional distributed cache backend (multi-node deployments).
    #[arg(long, env = "REDIS_CONN_STRING")]
    pub redis_conn_string: Option<String>,

    #[arg(long, env = "MRELAY_HOST")]
    pub host: Option<String>,

    #[arg(long, env = "MRELAY_PORT")]
    pub port: Option<u16>,

    /// Must be identical across nodes.
    #[arg(long, env = "SESSION_SECRET")]
    pub session_secret: Option<String>,

    /// Must be identical across nodes.
    #[arg(long, env = "CRYPTO_SECRET")]
    pub crypto_secret: Option<String>,

    /// Per-event stream inactivity timeout, seconds.
    #[arg(long, env = "STREAMING_TIMEOUT")]
    pub streaming_timeout: Option<u64>,

    /// Ability cache refresh interval, seconds.
    #[arg(long, env = "CHANNEL_UPDATE_FREQUENCY")]
    pub channel_update_frequency: Option<u64>,

    /// Max attempts across distinct channels per request.
    #[arg(long, env = "RETRY_TIMES")]
    pub retry_times: Option<u32>,

    /// Max async-task list page size.
    #[arg(long, env = "TASK_QUERY_LIMIT")]
    pub task_query_limit: Option<u64>,

    /// Async task poller interval, seconds.
    #[arg(long, env = "TASK_POLL_INTERVAL")]
    pub task_poll_interval: Option<u64>,

    /// Coalesce used_quota increments.
    #[arg(long, env = "BATCH_UPDATE_ENABLED")]
    pub batch_update_enabled: Option<bool>,

    #[arg(long, env = "BATCH_UPDATE_INTERVAL")]
    pub batch_update_interval: Option<u64>,

    /// Directory local-path file uploads are restricted to.
    #[arg(long, env = "FILE_UPLOAD_DIR")]
    pub file_upload_dir: Option<String>,

    #[arg(long, env = "FILE_UPLOAD_CONCURRENCY")]
    pub file_upload_concurrency: Option<usize>,

    /// Per-user in-flight request cap, 0 disables.
    #[arg(long, env = "USER_CONCURRENCY_LIMIT")]
    pub user_concurrency_limit: Option<u32>,

    /// Per-model requests-per-minute cap, 0 disables.
    #[arg(long, env = "MODEL_RPM_LIMIT")]
    pub model_rpm_limit: Option<u32>,
}

pub struct Bootstrap {
    pub state: Arc<AppState>,
}

pub async fn bootstrap_from_env() -> anyhow::Result<Bootstrap> {
    bootstrap(CliArgs::parse()).await
}

pub async fn bootstrap(args: CliArgs) -> anyhow::Result<Bootstrap> {
    let mut patch = GlobalConfigPatch {
        host: args.host,
        port: args.port,
        sql_dsn: Some(args.sql_dsn.clone()),
        redis_conn_string: args.redis_conn_string,
        session_secret: args.session_secret,
        crypto_secret: args.crypto_secret,
        streaming_timeout: args.streaming_timeout,
        channel_update_frequency: args.channel_update_frequency,
        retry_times: args.retry_times,
        task_query_limit: args.task_query_limit,
        task_poll_interval: args.task_poll_interval,
        batch_update_enabled: args.batch_update_enabled,
        batch_update_interval: args.batch_update_interval,
        file_upload_dir: args.file_upload_dir,
        file_upload_concurrency: args.file_upload_concurrency,
        user_concurrency_limit: args.user_concurrency_limit,
        model_rpm_limit: args.model_rpm_limit,
    };

    // Single-node bootstrap tolerates missing secrets; multi-node setups
    // must pass identical values on every node.
    if patch.session_secret.is_none() {
        let generated = uuid::Uuid::new_v4().to_string();
        warn!(event = "session_secret_generated", "SESSION_SECRET not set; generated one for this node");
        patch.session_secret = Some(generated);
    }
    if patch.crypto_secret.is_none() {
        let generated = uuid::Uuid::new_v4().to_string();
        warn!(event = "crypto_secret_generated", "CRYPTO_SECRET not set; generated one for this node");
        patch.crypto_secret = Some(generated);
    }

    let global: GlobalConfig = patch.into_config().context("finalize global config")?;

    let storage: Arc<dyn Storage> = if global.sql_dsn.starts_with("memory://") {
        Arc::new(MemoryStorage::new())
    } else {
        Arc::new(
            SeaOrmStorage::connect(&global.sql_dsn)
                .await
                .context("connect storage")?,
        )
    };
    storage.sync().await.context("schema sync")?;

    let state = Arc::new(AppState::new(global, storage));

    // First snapshot before serving, then periodic refresh.
    state
        .abilities
        .refresh(state.storage.as_ref())
        .await
        .context("initial ability refresh")?;
    spawn_refresh_task(state.clone());
    spawn_batch_flush_task(state.clone());

    Ok(Bootstrap { state })
}

/// Periodic swap-on-refresh of the ability cache. Readers tolerate
/// staleness up to one interval.
fn spawn_refresh_task(state: Arc<AppState>) {
    tokio::spawn(async move {
        loop {
            let interval = state.global.load().channel_update_frequency.max(1);
            tokio::time::sleep(Duration::from_secs(interval)).await;
            if let Err(err) = state.abilities.refresh(state.storage.as_ref()).await {
                warn!(event = "ability_refresh_failed", error = %err);
            }
        }
    });
}

fn spawn_batch_flush_task(state: Arc<AppState>) {
    tokio::spawn(async move {
        loop {
            let global = state.global.load_full();
            let interval = global.batch_update_interval.max(1);
            tokio::time::sleep(Duration::from_secs(interval)).await;
            if global.batch_update_enabled {
                state.ledger.flush_channel_quota().await;
            }
        }
    });
}

/// Re-derive one channel's abilities after a mutation and rebuild the cache.
/// Admin surfaces call this after every channel save.
pub async fn notify_channel_mutation(state: &Arc<AppState>, channel_id: i64) -> anyhow::Result<()> {
    if let Some(channel) = state
        .storage
        .get_channel(channel_id)
        .await
        .context("load channel")?
    {
        state
            .storage
            .rebuild_channel_abilities(&channel)
            .await
            .context("rebuild abilities")?;
    }
    state
        .abilities
        .refresh(state.storage.as_ref())
        .await
        .context("refresh ability cache")?;
    info!(event = "channel_mutation_applied", channel_id);
    Ok(())
}
