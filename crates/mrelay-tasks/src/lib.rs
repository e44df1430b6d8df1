//! Async task subsystem: a single periodic worker advances Midjourney and
//! Suno jobs from SUBMITTED through IN_PROGRESS to a terminal state and
//! finalises their quota reservation exactly once.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use mrelay_adapters::{midjourney, suno, RelayError, RelayErrorKind, RelayResult};
use mrelay_core::AppState;
use mrelay_storage::{
    ChannelRow, LogInsert, LogKind, TaskPlatform, TaskRow, TaskStatus,
};
use tracing::{info, warn};

pub fn spawn_poller(state: Arc<AppState>) {
    tokio::spawn(async move {
        loop {
            let interval = state.global.load().task_poll_interval.max(1);
            tokio::time::sleep(Duration::from_secs(interval)).await;
            if let Err(err) = poll_once(&state).await {
                warn!(event = "task_poll_failed", error = %err);
            }
        }
    });
}

/// One polling round: load non-terminal tasks, fetch their upstream state
/// grouped by channel, apply transitions, finalise terminal ones.
pub async fn poll_once(state: &Arc<AppState>) -> RelayResult<usize> {
    let tasks = state
        .storage
        .load_active_tasks()
        .await
        .map_err(|err| RelayError::internal(format!("loading tasks failed: {err}")))?;
    if tasks.is_empty() {
        return Ok(0);
    }

    let mut by_channel: HashMap<(TaskPlatform, i64), Vec<TaskRow>> = HashMap::new();
    for task in tasks {
        by_channel
            .entry((task.platform, task.channel_id))
            .or_default()
            .push(task);
    }

    let mut advanced = 0;
    for ((platform, channel_id), group) in by_channel {
        let channel = match load_channel(state, channel_id).await {
            Some(channel) => channel,
            None => {
                warn!(event = "task_channel_missing", channel_id);
                continue;
            }
        };
        let ids: Vec<String> = group.iter().map(|task| task.task_id.clone()).collect();
        match platform {
            TaskPlatform::Midjourney => {
                let fetched = match midjourney::fetch_tasks(&channel, ids).await {
                    Ok(fetched) => fetched,
                    Err(err) => {
                        warn!(event = "task_fetch_failed", channel_id, error = %err);
                        continue;
                    }
                };
                let by_id: HashMap<String, mrelay_protocol::midjourney::MjTask> = fetched
                    .into_iter()
                    .map(|task| (task.id.clone(), task))
                    .collect();
                for mut task in group {
                    let Some(remote) = by_id.get(&task.task_id) else {
                        continue;
                    };
                    if apply_mj_update(&mut task, remote) {
                        advance(state, &mut task).await;
                        advanced += 1;
                    }
                }
            }
            TaskPlatform::Suno => {
                let fetched = match suno::fetch_tasks(&channel, ids).await {
                    Ok(fetched) => fetched,
                    Err(err) => {
                        warn!(event = "task_fetch_failed", channel_id, error = %err);
                        continue;
                    }
                };
                let by_id: HashMap<String, mrelay_protocol::suno::SunoTask> = fetched
                    .into_iter()
                    .map(|task| (task.task_id.clone(), task))
                    .collect();
                for mut task in group {
                    let Some(remote) = by_id.get(&task.task_id) else {
                        continue;
                    };
                    if apply_suno_update(&mut task, remote) {
                        advance(state, &mut task).await;
                        advanced += 1;
                    }
                }
            }
        }
    }
    Ok(advanced)
}

/// Disabled channels disappear from the ability cache but their in-flight
/// tasks still need polling, so fall back to the store.
async fn load_channel(state: &Arc<AppState>, channel_id: i64) -> Option<ChannelRow> {
    if let Some(channel) = state.abilities.get_by_id(channel_id) {
        return Some(channel);
    }
    state.storage.get_channel(channel_id).await.ok().flatten()
}

fn apply_mj_update(task: &mut TaskRow, remote: &mrelay_protocol::midjourney::MjTask) -> bool {
    let status = remote
        .status
        .as_deref()
        .map(TaskStatus::from_str)
        .unwrap_or(task.status);
    let progress = remote.progress.clone().unwrap_or_default();
    let changed = status != task.status || progress != task.progress;
    task.status = status;
    task.progress = progress;
    if let Some(start) = remote.start_time {
        task.start_time = start;
    }
    if let Some(finish) = remote.finish_time {
        task.finish_time = finish;
    }
    if let Some(reason) = &remote.fail_reason {
        task.fail_reason = reason.clone();
    }
    if let Ok(data) = serde_json::to_string(remote) {
        task.data = data;
    }
    changed
}

fn apply_suno_update(task: &mut TaskRow, remote: &mrelay_protocol::suno::SunoTask) -> bool {
    let status = remote
        .status
        .as_deref()
        .map(TaskStatus::from_str)
        .unwrap_or(task.status);
    let progress = remote.progress.clone().unwrap_or_default();
    let changed = status != task.status || progress != task.progress;
    task.status = status;
    task.progress = progress;
    if let Some(start) = remote.start_time {
        task.start_time = start;
    }
    if let Some(finish) = remote.finish_time {
        task.finish_time = finish;
    }
    if let Some(reason) = &remote.fail_reason {
        task.fail_reason = reason.clone();
    }
    if let Ok(data) = serde_json::to_string(remote) {
        task.data = data;
    }
    changed
}

/// Persist the transition; terminal states settle the reservation first.
async fn advance(state: &Arc<AppState>, task: &mut TaskRow) {
    if task.status.is_terminal() {
        finalize_task(state, task).await;
    }
    if let Err(err) = state.storage.update_task(task).await {
        warn!(event = "task_update_failed", task_id = %task.task_id, error = %err);
    }
}

/// Settle a terminal task. Idempotent: the reservation is zeroed in the same
/// row update, so a second poll of the same terminal task moves nothing.
pub async fn finalize_task(state: &Arc<AppState>, task: &mut TaskRow) {
    if task.quota <= 0 {
        return;
    }
    let reserved = task.quota;
    let token = state
        .storage
        .get_token_by_id(task.token_id)
        .await
        .ok()
        .flatten();
    let token_unlimited = token.map(|token| token.unlimited_quota).unwrap_or(true);

    match task.status {
        TaskStatus::Failure => {
            if let Err(err) = state
                .storage
                .refund(task.user_id, task.token_id, token_unlimited, reserved)
                .await
            {
                warn!(event = "task_refund_failed", task_id = %task.task_id, error = %err);
                return;
            }
            state
                .ledger
                .record_log(LogInsert {
                    user_id: task.user_id,
                    token_id: task.token_id,
                    channel_id: task.channel_id,
                    model: task.action.clone(),
                    kind: LogKind::Task,
                    prompt_tokens: 0,
                    completion_tokens: 0,
                    quota: -reserved,
                    elapsed_ms: 0,
                    is_stream: false,
                    content: format!(
                        "task-refund: {} failed ({}), {} quota returned",
                        task.task_id, task.fail_reason, reserved
                    ),
                })
                .await;
        }
        TaskStatus::Success => {
            // The reservation is an upper bound; the action the provider
            // actually ran may have been cheaper. Settle the actual cost and
            // refund the surplus through the delta.
            let actual = actual_task_quota(state, task);
            let delta = actual - reserved;
            if let Err(err) = state
                .storage
                .commit_usage(task.user_id, task.token_id, token_unlimited, delta, actual)
                .await
            {
                warn!(event = "task_settle_failed", task_id = %task.task_id, error = %err);
                return;
            }
            state
                .ledger
                .add_channel_used_quota(task.channel_id, actual)
                .await;
            let mut content = format!(
                "task {} finished, {} quota consumed",
                task.task_id, actual
            );
            if actual < reserved {
                content.push_str(&format!(", {} surplus returned", reserved - actual));
            }
            state
                .ledger
                .record_log(LogInsert {
                    user_id: task.user_id,
                    token_id: task.token_id,
                    channel_id: task.channel_id,
                    model: task.action.clone(),
                    kind: LogKind::Task,
                    prompt_tokens: 0,
                    completion_tokens: 0,
                    quota: actual,
                    elapsed_ms: 0,
                    is_stream: false,
                    content,
                })
                .await;
        }
        _ => return,
    }

    task.quota = 0;
    info!(
        event = "task_finalized",
        task_id = %task.task_id,
        status = task.status.as_str(),
        reserved
    );
}

/// Actual cost of a finished task, capped by the reservation.
///
/// The provider payload stored on the row names the action that really ran
/// (a modal submit may resolve into an upscale, for instance). Its price is
/// rescaled against the reserved amount so the group ratio applied at
/// submit time carries over, and anything cheaper than the reservation
/// becomes a surplus refund.
fn actual_task_quota(state: &Arc<AppState>, task: &TaskRow) -> i64 {
    let reserved = task.quota;
    let Some(remote_action) = remote_action(task) else {
        return reserved;
    };
    let prices = state.prices.load_full();
    let reserved_base = prices.task_action_quota(task.platform, &task.action);
    let actual_base = prices.task_action_quota(task.platform, &remote_action);
    if reserved_base <= 0 || actual_base == reserved_base {
        return reserved;
    }
    let actual = (reserved as i128 * actual_base as i128 / reserved_base as i128) as i64;
    actual.clamp(0, reserved)
}

fn remote_action(task: &TaskRow) -> Option<String> {
    let data: serde_json::Value = serde_json::from_str(&task.data).ok()?;
    data.get("action")
        .and_then(serde_json::Value::as_str)
        .map(str::to_lowercase)
}

/// Client fetch by local task id; cross-user access requires admin.
pub async fn get_task(
    state: &Arc<AppState>,
    platform: TaskPlatform,
    task_id: &str,
    user_id: i64,
    is_admin: bool,
) -> RelayResult<TaskRow> {
    let task = state
        .storage
        .get_task(platform, task_id)
        .await
        .map_err(|err| RelayError::internal(format!("task lookup failed: {err}")))?
        .ok_or_else(|| RelayError::invalid_request(format!("task {task_id} not found")))?;
    if task.user_id != user_id && !is_admin {
        return Err(RelayError::new(
            RelayErrorKind::Forbidden,
            "task belongs to another user",
        ));
    }
    Ok(task)
}

/// Task list for one user, capped by `TASK_QUERY_LIMIT`.
pub async fn list_tasks(
    state: &Arc<AppState>,
    platform: TaskPlatform,
    user_id: i64,
    limit: Option<u64>,
) -> RelayResult<Vec<TaskRow>> {
    let cap = state.global.load().task_query_limit.max(1);
    let limit = limit.unwrap_or(cap).min(cap);
    state
        .storage
        .list_user_tasks(platform, user_id, limit)
        .await
        .map_err(|err| RelayError::internal(format!("task list failed: {err}")))
}
