//! End-to-end pipeline scenarios over the in-memory store and a scripted
//! stub adapter: happy path, retry across bands, auto-disable, quota
//! preflight, stream settle and cancellation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use mrelay_adapters::{
    classify_upstream_failure, wreq, Adapter, AdapterOutput, AdapterRegistry, ConvertedRequest,
    RelayError, RelayErrorKind, RelayInfo, RelayRequest, RelayResult, RelayStream,
};
use mrelay_billing::{usage_quota, PriceTable};
use mrelay_common::{GlobalConfig, GlobalConfigPatch};
use mrelay_core::{relay, AppState, AuthedRequest, ClientDialect, RelayResponse};
use mrelay_protocol::openai::chat::{ChatCompletionRequest, ChatMessage};
use mrelay_protocol::openai::Usage;
use mrelay_protocol::sse;
use mrelay_storage::{
    ChannelRow, ChannelSetting, ChannelStatus, ChannelType, LogKind, MemoryStorage, Storage,
    TokenRow, UserRow, STATUS_ENABLED,
};

type Behaviour =
    Arc<dyn Fn(&RelayRequest, &RelayInfo) -> RelayResult<AdapterOutput> + Send + Sync>;

struct StubAdapter {
    behave: Behaviour,
}

#[async_trait]
impl Adapter for StubAdapter {
    fn init(&mut self, _info: &RelayInfo) {}

    fn get_url(&self, _info: &RelayInfo) -> RelayResult<String> {
        Ok("http://stub.local".to_string())
    }

    async fn set_headers(
        &self,
        _headers: &mut http::HeaderMap,
        _info: &RelayInfo,
    ) -> RelayResult<()> {
        Ok(())
    }

    fn convert_request(
        &self,
        _request: &RelayRequest,
        _info: &RelayInfo,
    ) -> RelayResult<ConvertedRequest> {
        Ok(ConvertedRequest::json(Bytes::new()))
    }

    async fn do_request(
        &self,
        _request: &RelayRequest,
        _info: &RelayInfo,
    ) -> RelayResult<wreq::Response> {
        Err(RelayError::internal("stub adapters never dispatch"))
    }

    async fn handle_response(
        &self,
        _response: wreq::Response,
        _info: &RelayInfo,
    ) -> RelayResult<AdapterOutput> {
        Err(RelayError::internal("stub adapters never parse"))
    }

    async fn execute(
        &self,
        request: &RelayRequest,
        info: &RelayInfo,
    ) -> RelayResult<AdapterOutput> {
        (self.behave)(request, info)
    }
}

fn test_global() -> GlobalConfig {
    GlobalConfigPatch {
        sql_dsn: Some("memory://".to_string()),
        session_secret: Some("s".to_string()),
        crypto_secret: Some("c".to_string()),
        streaming_timeout: Some(5),
        retry_times: Some(3),
        ..Default::default()
    }
    .into_config()
    .unwrap()
}

fn channel(id: i64, priority: i64) -> ChannelRow {
    ChannelRow {
        id,
        kind: ChannelType::OpenAi,
        name: format!("channel-{id}"),
        key: format!("sk-{id}"),
        base_url: String::new(),
        models: vec!["gpt-4o".to_string()],
        groups: vec!["default".to_string()],
        model_mapping: HashMap::new(),
        status_code_mapping: None,
        priority,
        weight: 1,
        status: ChannelStatus::Enabled,
        auto_ban: true,
        setting: ChannelSetting::default(),
    }
}

fn user(quota: i64) -> UserRow {
    UserRow {
        id: 1,
        username: "tester".to_string(),
        group: "default".to_string(),
        quota,
        used_quota: 0,
        request_count: 0,
        status: STATUS_ENABLED,
        role: 1,
    }
}

fn token(unlimited: bool, remain: i64) -> TokenRow {
    TokenRow {
        id: 7,
        user_id: 1,
        key: "sk-test".to_string(),
        name: "test".to_string(),
        remain_quota: remain,
        unlimited_quota: unlimited,
        expired_at: -1,
        allowed_models: vec![],
        allowed_groups: vec![],
        specific_channel_id: None,
        status: STATUS_ENABLED,
    }
}

async fn build_state(
    storage: Arc<MemoryStorage>,
    behave: Behaviour,
) -> Arc<AppState> {
    let mut state = AppState::new(test_global(), storage);
    let mut registry = AdapterRegistry::with_builtin();
    registry.register(ChannelType::OpenAi, move || {
        Box::new(StubAdapter {
            behave: behave.clone(),
        })
    });
    state.adapters = Arc::new(registry);
    state.abilities.refresh(state.storage.as_ref()).await.unwrap();
    Arc::new(state)
}

fn authed(token_row: TokenRow) -> AuthedRequest {
    AuthedRequest {
        specific_channel_id: token_row.specific_channel_id,
        user: user(0),
        token: token_row,
    }
}

fn chat_request(stream: bool) -> RelayRequest {
    RelayRequest::Chat(ChatCompletionRequest {
        model: "gpt-4o".to_string(),
        messages: vec![ChatMessage::user("hi")],
        stream: stream.then_some(true),
        ..Default::default()
    })
}

fn ok_json(info: &RelayInfo, usage: Usage) -> AdapterOutput {
    let mut body = serde_json::json!({
        "id": "chatcmpl-stub",
        "object": "chat.completion",
        "created": 0,
        "model": info.upstream_model,
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": "hello"},
            "finish_reason": "stop",
        }],
        "usage": usage,
    });
    info.rewrite_model(&mut body);
    AdapterOutput::Json { body, usage }
}

async fn wait_for_consume_log(storage: &MemoryStorage) -> mrelay_storage::LogInsert {
    for _ in 0..100 {
        let logs = storage.logs().await;
        if let Some(entry) = logs
            .iter()
            .find(|entry| entry.entry.kind == LogKind::Consume)
        {
            return entry.entry.clone();
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("no consume log recorded");
}

#[tokio::test]
async fn chat_happy_path_settles_actual_usage() {
    let storage = Arc::new(MemoryStorage::new());
    storage.seed_user(user(1_000_000)).await;
    storage.seed_token(token(true, 0)).await;
    storage.seed_channel(channel(1, 0)).await;

    let behave: Behaviour = Arc::new(|_req, info| Ok(ok_json(info, Usage::new(1, 1))));
    let state = build_state(storage.clone(), behave).await;

    let response = relay(
        state,
        authed(token(true, 0)),
        chat_request(false),
        ClientDialect::OpenAi,
    )
    .await
    .unwrap();

    let RelayResponse::Json(body) = response else {
        panic!("expected json response");
    };
    assert_eq!(body["model"], "gpt-4o");
    assert_eq!(body["choices"][0]["message"]["content"], "hello");

    let prices = PriceTable::default();
    let expected = usage_quota(
        1,
        1,
        prices.model_ratio("gpt-4o"),
        prices.completion_ratio("gpt-4o"),
        1.0,
    );
    assert_eq!(storage.user_quota(1).await, Some(1_000_000 - expected));

    let log = wait_for_consume_log(&storage).await;
    assert_eq!(log.quota, expected);
    assert_eq!(log.prompt_tokens, 1);
    assert_eq!(log.completion_tokens, 1);
    assert_eq!(log.channel_id, 1);
}

#[tokio::test]
async fn model_mapping_round_trips() {
    let storage = Arc::new(MemoryStorage::new());
    storage.seed_user(user(1_000_000)).await;
    storage.seed_token(token(true, 0)).await;
    let mut mapped = channel(1, 0);
    mapped
        .model_mapping
        .insert("gpt-4o".to_string(), "gpt-4o-native".to_string());
    storage.seed_channel(mapped).await;

    let seen_upstream = Arc::new(Mutex::new(String::new()));
    let seen = seen_upstream.clone();
    let behave: Behaviour = Arc::new(move |_req, info| {
        *seen.lock().unwrap() = info.upstream_model.clone();
        Ok(ok_json(info, Usage::new(1, 1)))
    });
    let state = build_state(storage.clone(), behave).await;

    let response = relay(
        state,
        authed(token(true, 0)),
        chat_request(false),
        ClientDialect::OpenAi,
    )
    .await
    .unwrap();

    // Upstream saw the native name, the client sees the canonical one back.
    assert_eq!(*seen_upstream.lock().unwrap(), "gpt-4o-native");
    let RelayResponse::Json(body) = response else {
        panic!("expected json response");
    };
    assert_eq!(body["model"], "gpt-4o");
}

#[tokio::test]
async fn transient_failure_retries_on_lower_priority_band() {
    let storage = Arc::new(MemoryStorage::new());
    storage.seed_user(user(1_000_000)).await;
    storage.seed_token(token(true, 0)).await;
    storage.seed_channel(channel(1, 10)).await;
    storage.seed_channel(channel(2, 0)).await;

    let order = Arc::new(Mutex::new(Vec::<i64>::new()));
    let seen = order.clone();
    let behave: Behaviour = Arc::new(move |_req, info| {
        seen.lock().unwrap().push(info.channel.id);
        if info.channel.id == 1 {
            Err(classify_upstream_failure(503, b"", None))
        } else {
            Ok(ok_json(info, Usage::new(1, 1)))
        }
    });
    let state = build_state(storage.clone(), behave).await;

    relay(
        state.clone(),
        authed(token(true, 0)),
        chat_request(false),
        ClientDialect::OpenAi,
    )
    .await
    .unwrap();

    assert_eq!(*order.lock().unwrap(), vec![1, 2]);
    // 503 is retriable but not a disable code.
    let kept = storage.get_channel(1).await.unwrap().unwrap();
    assert_eq!(kept.status, ChannelStatus::Enabled);
}

#[tokio::test]
async fn revoked_key_auto_disables_and_retries() {
    let storage = Arc::new(MemoryStorage::new());
    storage.seed_user(user(1_000_000)).await;
    storage.seed_token(token(true, 0)).await;
    storage.seed_channel(channel(1, 10)).await;
    storage.seed_channel(channel(2, 0)).await;

    let behave: Behaviour = Arc::new(|_req, info| {
        if info.channel.id == 1 {
            Err(classify_upstream_failure(
                401,
                br#"{"error":{"message":"Incorrect API key provided","type":"invalid_request_error"}}"#,
                None,
            ))
        } else {
            Ok(ok_json(info, Usage::new(1, 1)))
        }
    });
    let state = build_state(storage.clone(), behave).await;

    relay(
        state.clone(),
        authed(token(true, 0)),
        chat_request(false),
        ClientDialect::OpenAi,
    )
    .await
    .unwrap();

    let disabled = storage.get_channel(1).await.unwrap().unwrap();
    assert_eq!(disabled.status, ChannelStatus::AutoDisabled);
    // The cache dropped it as well: further selections only see channel 2.
    assert!(state.abilities.get_by_id(1).is_none());
}

#[tokio::test]
async fn quota_exceeded_before_any_upstream_call() {
    let storage = Arc::new(MemoryStorage::new());
    storage.seed_user(user(10)).await;
    storage.seed_token(token(false, 10)).await;
    storage.seed_channel(channel(1, 0)).await;

    let dispatched = Arc::new(Mutex::new(0_u32));
    let seen = dispatched.clone();
    let behave: Behaviour = Arc::new(move |_req, info| {
        *seen.lock().unwrap() += 1;
        Ok(ok_json(info, Usage::new(1, 1)))
    });
    let state = build_state(storage.clone(), behave).await;

    let request = RelayRequest::Chat(ChatCompletionRequest {
        model: "gpt-4o".to_string(),
        messages: vec![ChatMessage::user("hi")],
        max_tokens: Some(1_000),
        ..Default::default()
    });
    let err = relay(state, authed(token(false, 10)), request, ClientDialect::OpenAi)
        .await
        .unwrap_err();

    assert_eq!(err.kind, RelayErrorKind::QuotaExceeded);
    assert_eq!(*dispatched.lock().unwrap(), 0);
    assert_eq!(storage.user_quota(1).await, Some(10));
    assert!(storage.logs().await.is_empty());
}

#[tokio::test]
async fn failed_request_after_preconsume_refunds_everything() {
    let storage = Arc::new(MemoryStorage::new());
    storage.seed_user(user(1_000)).await;
    storage.seed_token(token(true, 0)).await;
    storage.seed_channel(channel(1, 0)).await;

    let behave: Behaviour =
        Arc::new(|_req, _info| Err(classify_upstream_failure(400, b"bad prompt", None)));
    let state = build_state(storage.clone(), behave).await;

    let err = relay(
        state,
        authed(token(true, 0)),
        chat_request(false),
        ClientDialect::OpenAi,
    )
    .await
    .unwrap_err();

    assert_eq!(err.kind, RelayErrorKind::UpstreamFatal);
    // Net quota delta for a failed request is exactly zero.
    assert_eq!(storage.user_quota(1).await, Some(1_000));
}

#[tokio::test]
async fn no_channel_for_model_is_a_503() {
    let storage = Arc::new(MemoryStorage::new());
    storage.seed_user(user(1_000)).await;
    storage.seed_token(token(true, 0)).await;

    let behave: Behaviour = Arc::new(|_req, info| Ok(ok_json(info, Usage::new(1, 1))));
    let state = build_state(storage.clone(), behave).await;

    let err = relay(
        state,
        authed(token(true, 0)),
        chat_request(false),
        ClientDialect::OpenAi,
    )
    .await
    .unwrap_err();
    assert_eq!(err.kind, RelayErrorKind::NoAvailableChannel);
    assert_eq!(storage.user_quota(1).await, Some(1_000));
}

struct StubStream {
    remaining: u32,
    sent: i64,
    prompt: i64,
}

#[async_trait]
impl RelayStream for StubStream {
    async fn next_frames(&mut self) -> RelayResult<Option<Vec<Bytes>>> {
        if self.remaining == 0 {
            return Ok(None);
        }
        self.remaining -= 1;
        self.sent += 1;
        tokio::time::sleep(Duration::from_millis(20)).await;
        let chunk = serde_json::json!({
            "id": "chatcmpl-stub",
            "object": "chat.completion.chunk",
            "created": 0,
            "model": "gpt-4o",
            "choices": [{"index": 0, "delta": {"content": "x"}, "finish_reason": null}],
        });
        Ok(Some(vec![sse::encode_frame(None, &chunk.to_string())]))
    }

    fn usage(&self) -> Usage {
        Usage::new(self.prompt, self.sent)
    }

    fn fallback_text(&self) -> &str {
        ""
    }
}

#[tokio::test]
async fn stream_completion_settles_observed_usage() {
    let storage = Arc::new(MemoryStorage::new());
    storage.seed_user(user(1_000_000)).await;
    storage.seed_token(token(true, 0)).await;
    storage.seed_channel(channel(1, 0)).await;

    let behave: Behaviour = Arc::new(|_req, _info| {
        Ok(AdapterOutput::Stream(Box::new(StubStream {
            remaining: 5,
            sent: 0,
            prompt: 10,
        })))
    });
    let state = build_state(storage.clone(), behave).await;

    let response = relay(
        state,
        authed(token(true, 0)),
        chat_request(true),
        ClientDialect::OpenAi,
    )
    .await
    .unwrap();

    let RelayResponse::Stream { mut rx, .. } = response else {
        panic!("expected stream response");
    };
    let mut frames = 0;
    while rx.recv().await.is_some() {
        frames += 1;
    }
    assert_eq!(frames, 5);

    let log = wait_for_consume_log(&storage).await;
    assert_eq!(log.prompt_tokens, 10);
    assert_eq!(log.completion_tokens, 5);
    assert!(log.is_stream);

    let prices = PriceTable::default();
    let expected = usage_quota(
        10,
        5,
        prices.model_ratio("gpt-4o"),
        prices.completion_ratio("gpt-4o"),
        1.0,
    );
    assert_eq!(storage.user_quota(1).await, Some(1_000_000 - expected));
}

#[tokio::test]
async fn client_disconnect_cancels_and_settles_partial_usage() {
    let storage = Arc::new(MemoryStorage::new());
    storage.seed_user(user(1_000_000)).await;
    storage.seed_token(token(true, 0)).await;
    storage.seed_channel(channel(1, 0)).await;

    let behave: Behaviour = Arc::new(|_req, _info| {
        Ok(AdapterOutput::Stream(Box::new(StubStream {
            remaining: 100,
            sent: 0,
            prompt: 10,
        })))
    });
    let state = build_state(storage.clone(), behave).await;

    let response = relay(
        state,
        authed(token(true, 0)),
        chat_request(true),
        ClientDialect::OpenAi,
    )
    .await
    .unwrap();

    let RelayResponse::Stream { mut rx, .. } = response else {
        panic!("expected stream response");
    };
    for _ in 0..3 {
        rx.recv().await.unwrap();
    }
    drop(rx);

    let log = wait_for_consume_log(&storage).await;
    assert!(log.content.contains("stream aborted"));
    assert_eq!(log.prompt_tokens, 10);
    // A few frames were observed, nowhere near the full hundred.
    assert!(log.completion_tokens >= 3 && log.completion_tokens < 100);
    let final_quota = storage.user_quota(1).await.unwrap();
    assert_eq!(final_quota, 1_000_000 - log.quota);
}

#[tokio::test]
async fn pinned_channel_must_serve_the_model() {
    let storage = Arc::new(MemoryStorage::new());
    storage.seed_user(user(1_000_000)).await;
    storage.seed_token(token(true, 0)).await;
    storage.seed_channel(channel(2, 0)).await;

    let behave: Behaviour = Arc::new(|_req, info| Ok(ok_json(info, Usage::new(1, 1))));
    let state = build_state(storage.clone(), behave).await;

    let mut pinned = token(true, 0);
    pinned.specific_channel_id = Some(2);
    let response = relay(
        state.clone(),
        authed(pinned),
        chat_request(false),
        ClientDialect::OpenAi,
    )
    .await;
    assert!(response.is_ok());

    let mut wrong = token(true, 0);
    wrong.specific_channel_id = Some(99);
    let err = relay(state, authed(wrong), chat_request(false), ClientDialect::OpenAi)
        .await
        .unwrap_err();
    assert_eq!(err.kind, RelayErrorKind::InvalidRequest);
}
