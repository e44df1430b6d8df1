//! Baidu ERNIE adapter. Channel keys are `client_id|client_secret`; the
//! wenxin API authenticates with an OAuth2 access token minted on a side
//! channel and carried as a query parameter.

use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::HeaderMap;
use mrelay_protocol::openai::chat::ChatCompletionRequest;
use mrelay_protocol::openai::Usage;
use mrelay_protocol::sse;

use crate::adapter::{Adapter, AdapterOutput, ConvertedRequest, RelayStream, SseUpstream};
use crate::auth_cache::UpstreamTokenCache;
use crate::client::client_for_proxy;
use crate::error::{classify_upstream_failure, RelayError, RelayErrorKind, RelayResult};
use crate::info::{RelayInfo, RelayMode, RelayRequest};

static TOKEN_CACHE: OnceLock<UpstreamTokenCache> = OnceLock::new();

fn token_cache() -> &'static UpstreamTokenCache {
    TOKEN_CACHE.get_or_init(UpstreamTokenCache::new)
}

#[derive(Debug, Default)]
pub struct BaiduAdapter;

impl BaiduAdapter {
    pub fn new() -> Self {
        Self
    }
}

/// Known ERNIE endpoint suffixes; unknown models use their lowercase name.
fn model_endpoint(model: &str) -> String {
    match model.to_lowercase().as_str() {
        "ernie-4.0-8k" => "completions_pro".to_string(),
        "ernie-3.5-8k" => "completions".to_string(),
        "ernie-speed-8k" => "ernie_speed".to_string(),
        "ernie-lite-8k" => "ernie-lite-8k".to_string(),
        other => other.to_string(),
    }
}

async fn fetch_access_token(info: &RelayInfo) -> RelayResult<String> {
    let cache_key = info.api_key.clone();
    let credential = info.api_key.clone();
    let proxy = info.channel.setting.proxy.clone();
    token_cache()
        .get_or_refresh(&cache_key, || async move {
            let (client_id, client_secret) = credential.split_once('|').ok_or_else(|| {
                RelayError::invalid_request("baidu channel key must be client_id|client_secret")
            })?;
            let client = client_for_proxy(proxy.as_deref())?;
            let url = format!(
                "https://aip.baidubce.com/oauth/2.0/token?grant_type=client_credentials&client_id={client_id}&client_secret={client_secret}"
            );
            let response = client.post(url).send().await.map_err(|err| {
                RelayError::upstream_transient(format!("baidu token request failed: {err}"))
            })?;
            let body = response.bytes().await.map_err(|err| {
                RelayError::upstream_transient(format!("baidu token read failed: {err}"))
            })?;
            let value: serde_json::Value = serde_json::from_slice(&body).map_err(|err| {
                RelayError::new(
                    RelayErrorKind::UpstreamAuthDead,
                    format!("baidu token response is not json: {err}"),
                )
            })?;
            let token = value
                .get("access_token")
                .and_then(serde_json::Value::as_str)
                .ok_or_else(|| {
                    RelayError::new(
                        RelayErrorKind::UpstreamAuthDead,
                        format!("baidu token refresh rejected: {value}"),
                    )
                })?
                .to_string();
            let ttl = value
                .get("expires_in")
                .and_then(serde_json::Value::as_u64)
                .unwrap_or(2_592_000);
            Ok((token, Duration::from_secs(ttl)))
        })
        .await
}

#[async_trait]
impl Adapter for BaiduAdapter {
    fn init(&mut self, _info: &RelayInfo) {}

    fn get_url(&self, info: &RelayInfo) -> RelayResult<String> {
        if info.mode != RelayMode::ChatCompletions {
            return Err(RelayError::invalid_request(
                "baidu channels serve chat requests only",
            ));
        }
        Ok(format!(
            "{}/rpc/2.0/ai_custom/v1/wenxinworkshop/chat/{}",
            info.base_url.trim_end_matches('/'),
            model_endpoint(&info.upstream_model)
        ))
    }

    async fn set_headers(&self, _headers: &mut HeaderMap, _info: &RelayInfo) -> RelayResult<()> {
        // Auth travels as the access_token query parameter.
        Ok(())
    }

    fn convert_request(
        &self,
        request: &RelayRequest,
        _info: &RelayInfo,
    ) -> RelayResult<ConvertedRequest> {
        let RelayRequest::Chat(req) = request else {
            return Err(RelayError::invalid_request(
                "baidu channels serve chat requests only",
            ));
        };
        let body = chat_to_ernie(req)?;
        let body = serde_json::to_vec(&body)
            .map_err(|err| RelayError::internal(format!("encode request: {err}")))?;
        Ok(ConvertedRequest::json(Bytes::from(body)))
    }

    async fn do_request(
        &self,
        request: &RelayRequest,
        info: &RelayInfo,
    ) -> RelayResult<wreq::Response> {
        let token = fetch_access_token(info).await?;
        let url = format!("{}?access_token={token}", self.get_url(info)?);
        let converted = self.convert_request(request, info)?;
        let client = client_for_proxy(info.channel.setting.proxy.as_deref())?;
        client
            .post(url)
            .header(http::header::CONTENT_TYPE, converted.content_type)
            .body(converted.body)
            .send()
            .await
            .map_err(|err| {
                RelayError::upstream_transient(format!("upstream request failed: {err}"))
            })
    }

    async fn handle_response(
        &self,
        response: wreq::Response,
        info: &RelayInfo,
    ) -> RelayResult<AdapterOutput> {
        if info.is_stream {
            return Ok(AdapterOutput::Stream(Box::new(ErnieStream::new(
                SseUpstream::new(response),
                info.origin_model.clone(),
            ))));
        }
        let body = response.bytes().await.map_err(|err| {
            RelayError::upstream_transient(format!("reading upstream body failed: {err}"))
        })?;
        let value: serde_json::Value = serde_json::from_slice(&body).map_err(|err| {
            RelayError::new(
                RelayErrorKind::UpstreamFatal,
                format!("upstream body is not valid json: {err}"),
            )
        })?;
        // ERNIE reports failures as 200 + error_code.
        if value.get("error_code").is_some() {
            return Err(ernie_error(&value));
        }
        let usage = value
            .get("usage")
            .and_then(|usage| serde_json::from_value::<Usage>(usage.clone()).ok())
            .unwrap_or_default();
        let text = value
            .get("result")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default();
        let converted = serde_json::json!({
            "id": value.get("id").and_then(serde_json::Value::as_str).unwrap_or("chatcmpl-baidu"),
            "object": "chat.completion",
            "created": time::OffsetDateTime::now_utc().unix_timestamp(),
            "model": info.origin_model,
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": text},
                "finish_reason": "stop",
            }],
            "usage": usage,
        });
        Ok(AdapterOutput::Json {
            body: converted,
            usage,
        })
    }
}

fn ernie_error(value: &serde_json::Value) -> RelayError {
    let code = value
        .get("error_code")
        .and_then(serde_json::Value::as_i64)
        .unwrap_or(0);
    let message = value
        .get("error_msg")
        .and_then(serde_json::Value::as_str)
        .unwrap_or("ernie error")
        .to_string();
    // 13/14/110/111 are credential problems; 18 is qps limit.
    let kind = match code {
        13 | 14 | 110 | 111 => RelayErrorKind::UpstreamAuthDead,
        18 => RelayErrorKind::UpstreamTransient,
        _ => RelayErrorKind::UpstreamFatal,
    };
    RelayError::new(kind, format!("ernie error {code}: {message}"))
}

fn chat_to_ernie(req: &ChatCompletionRequest) -> RelayResult<serde_json::Value> {
    let mut system = String::new();
    let mut messages: Vec<serde_json::Value> = Vec::new();
    for message in &req.messages {
        match message.role.as_str() {
            "system" | "developer" => system.push_str(&message.text()),
            role => {
                let role = if role == "assistant" { "assistant" } else { "user" };
                messages.push(serde_json::json!({"role": role, "content": message.text()}));
            }
        }
    }
    let mut body = serde_json::json!({"messages": messages});
    if !system.is_empty() {
        body["system"] = serde_json::Value::String(system);
    }
    if let Some(temperature) = req.temperature {
        body["temperature"] = serde_json::json!(temperature);
    }
    if let Some(top_p) = req.top_p {
        body["top_p"] = serde_json::json!(top_p);
    }
    if let Some(max_tokens) = req.max_output_tokens() {
        body["max_output_tokens"] = serde_json::json!(max_tokens);
    }
    if req.is_stream() {
        body["stream"] = serde_json::Value::Bool(true);
    }
    Ok(body)
}

struct ErnieStream {
    upstream: SseUpstream,
    origin_model: String,
    id: String,
    created: i64,
    usage: Usage,
    fallback_text: String,
    done: bool,
}

impl ErnieStream {
    fn new(upstream: SseUpstream, origin_model: String) -> Self {
        Self {
            upstream,
            origin_model,
            id: format!("chatcmpl-{}", uuid::Uuid::new_v4()),
            created: time::OffsetDateTime::now_utc().unix_timestamp(),
            usage: Usage::default(),
            fallback_text: String::new(),
            done: false,
        }
    }
}

#[async_trait]
impl RelayStream for ErnieStream {
    async fn next_frames(&mut self) -> RelayResult<Option<Vec<Bytes>>> {
        loop {
            let Some(event) = self.upstream.next_event().await? else {
                if self.done {
                    return Ok(None);
                }
                self.done = true;
                return Ok(Some(vec![sse::done_frame()]));
            };
            if event.data.trim().is_empty() {
                continue;
            }
            let Ok(value) = serde_json::from_str::<serde_json::Value>(&event.data) else {
                continue;
            };
            if value.get("error_code").is_some() {
                return Err(ernie_error(&value));
            }
            if let Some(usage) = value.get("usage") {
                if let Ok(parsed) = serde_json::from_value::<Usage>(usage.clone()) {
                    self.usage.merge(&parsed);
                }
            }
            let text = value
                .get("result")
                .and_then(serde_json::Value::as_str)
                .unwrap_or_default();
            self.fallback_text.push_str(text);
            let is_end = value
                .get("is_end")
                .and_then(serde_json::Value::as_bool)
                .unwrap_or(false);
            let chunk = serde_json::json!({
                "id": self.id,
                "object": "chat.completion.chunk",
                "created": self.created,
                "model": self.origin_model,
                "choices": [{
                    "index": 0,
                    "delta": {"role": "assistant", "content": text},
                    "finish_reason": if is_end { Some("stop") } else { None },
                }],
            });
            let data = serde_json::to_string(&chunk)
                .map_err(|err| RelayError::internal(format!("encode chunk: {err}")))?;
            return Ok(Some(vec![sse::encode_frame(None, &data)]));
        }
    }

    fn usage(&self) -> Usage {
        self.usage
    }

    fn fallback_text(&self) -> &str {
        &self.fallback_text
    }
}
