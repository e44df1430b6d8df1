//! Task finalisation: terminal settles run exactly once, task queries are
//! owner-checked and capped.

use std::sync::Arc;

use mrelay_common::{GlobalConfig, GlobalConfigPatch};
use mrelay_core::AppState;
use mrelay_storage::{
    MemoryStorage, Storage, TaskInsert, TaskPlatform, TaskStatus, TokenRow, UserRow,
    STATUS_ENABLED,
};
use mrelay_tasks::{finalize_task, get_task, list_tasks};

fn test_global() -> GlobalConfig {
    GlobalConfigPatch {
        sql_dsn: Some("memory://".to_string()),
        session_secret: Some("s".to_string()),
        crypto_secret: Some("c".to_string()),
        task_query_limit: Some(10),
        ..Default::default()
    }
    .into_config()
    .unwrap()
}

fn user(id: i64, quota: i64) -> UserRow {
    UserRow {
        id,
        username: format!("user-{id}"),
        group: "default".to_string(),
        quota,
        used_quota: 0,
        request_count: 0,
        status: STATUS_ENABLED,
        role: 1,
    }
}

fn token(id: i64, user_id: i64) -> TokenRow {
    TokenRow {
        id,
        user_id,
        key: format!("sk-{id}"),
        name: String::new(),
        remain_quota: 1_000,
        unlimited_quota: false,
        expired_at: -1,
        allowed_models: vec![],
        allowed_groups: vec![],
        specific_channel_id: None,
        status: STATUS_ENABLED,
    }
}

async fn setup() -> (Arc<MemoryStorage>, Arc<AppState>) {
    let storage = Arc::new(MemoryStorage::new());
    storage.seed_user(user(1, 1_000)).await;
    storage.seed_token(token(7, 1)).await;
    let state = Arc::new(AppState::new(test_global(), storage.clone()));
    (storage, state)
}

async fn submitted_task(storage: &MemoryStorage, quota: i64) -> mrelay_storage::TaskRow {
    // Mirrors the reservation flow: submit pre-consumes before the task row
    // exists.
    assert!(storage.pre_consume(1, 7, false, quota).await.unwrap());
    let id = storage
        .insert_task(TaskInsert {
            task_id: "mj-100".to_string(),
            platform: TaskPlatform::Midjourney,
            user_id: 1,
            token_id: 7,
            channel_id: 3,
            action: "imagine".to_string(),
            quota,
            data: "{}".to_string(),
        })
        .await
        .unwrap();
    storage
        .load_active_tasks()
        .await
        .unwrap()
        .into_iter()
        .find(|task| task.id == id)
        .unwrap()
}

#[tokio::test]
async fn failed_task_refunds_in_full_once() {
    let (storage, state) = setup().await;
    let mut task = submitted_task(&storage, 50).await;
    assert_eq!(storage.user_quota(1).await, Some(950));

    task.status = TaskStatus::Failure;
    task.fail_reason = "banned prompt".to_string();
    finalize_task(&state, &mut task).await;
    assert_eq!(storage.user_quota(1).await, Some(1_000));
    assert_eq!(task.quota, 0);

    // Idempotent: polling a terminal task again moves nothing.
    finalize_task(&state, &mut task).await;
    finalize_task(&state, &mut task).await;
    assert_eq!(storage.user_quota(1).await, Some(1_000));

    let logs = storage.logs().await;
    assert_eq!(logs.len(), 1);
    assert!(logs[0].entry.content.contains("task-refund"));
}

#[tokio::test]
async fn successful_task_refunds_surplus_when_action_proved_cheaper() {
    let (storage, state) = setup().await;
    let mut task = submitted_task(&storage, 50).await;
    assert_eq!(storage.user_quota(1).await, Some(950));

    // Submitted as "imagine" but the provider ran an upscale, which is
    // priced at half: half of the reservation must come back.
    task.status = TaskStatus::Success;
    task.data = r#"{"action":"UPSCALE"}"#.to_string();
    finalize_task(&state, &mut task).await;

    assert_eq!(storage.user_quota(1).await, Some(975));
    let user_row = storage.get_user(1).await.unwrap().unwrap();
    assert_eq!(user_row.used_quota, 25);
    assert_eq!(user_row.request_count, 1);
    assert_eq!(task.quota, 0);

    let logs = storage.logs().await;
    assert_eq!(logs.len(), 1);
    assert!(logs[0].entry.content.contains("surplus returned"));

    // Second finalisation is a no-op.
    finalize_task(&state, &mut task).await;
    let user_row = storage.get_user(1).await.unwrap().unwrap();
    assert_eq!(user_row.used_quota, 25);
    assert_eq!(user_row.request_count, 1);
    assert_eq!(storage.user_quota(1).await, Some(975));
}

#[tokio::test]
async fn successful_task_at_reserved_cost_keeps_the_reservation() {
    let (storage, state) = setup().await;
    let mut task = submitted_task(&storage, 50).await;

    // The provider ran exactly what was submitted: nothing comes back.
    task.status = TaskStatus::Success;
    task.data = r#"{"action":"IMAGINE"}"#.to_string();
    finalize_task(&state, &mut task).await;

    assert_eq!(storage.user_quota(1).await, Some(950));
    let user_row = storage.get_user(1).await.unwrap().unwrap();
    assert_eq!(user_row.used_quota, 50);
    assert_eq!(user_row.request_count, 1);
}

#[tokio::test]
async fn non_terminal_states_do_not_settle() {
    let (storage, state) = setup().await;
    let mut task = submitted_task(&storage, 50).await;

    task.status = TaskStatus::InProgress;
    finalize_task(&state, &mut task).await;
    assert_eq!(storage.user_quota(1).await, Some(950));
    assert_eq!(task.quota, 50);
}

#[tokio::test]
async fn task_queries_are_owner_checked() {
    let (storage, state) = setup().await;
    storage.seed_user(user(2, 100)).await;
    let mut task = submitted_task(&storage, 50).await;
    task.status = TaskStatus::Success;
    storage.update_task(&task).await.unwrap();

    let found = get_task(&state, TaskPlatform::Midjourney, "mj-100", 1, false)
        .await
        .unwrap();
    assert_eq!(found.task_id, "mj-100");

    // Another user is rejected unless admin.
    assert!(get_task(&state, TaskPlatform::Midjourney, "mj-100", 2, false)
        .await
        .is_err());
    assert!(get_task(&state, TaskPlatform::Midjourney, "mj-100", 2, true)
        .await
        .is_ok());
}

#[tokio::test]
async fn task_list_is_capped_by_query_limit() {
    let (storage, state) = setup().await;
    for index in 0..25 {
        storage
            .insert_task(TaskInsert {
                task_id: format!("mj-{index}"),
                platform: TaskPlatform::Midjourney,
                user_id: 1,
                token_id: 7,
                channel_id: 3,
                action: "imagine".to_string(),
                quota: 1,
                data: "{}".to_string(),
            })
            .await
            .unwrap();
    }
    // TASK_QUERY_LIMIT is 10; a larger client limit is clamped.
    let listed = list_tasks(&state, TaskPlatform::Midjourney, 1, Some(100))
        .await
        .unwrap();
    assert_eq!(listed.len(), 10);
}
