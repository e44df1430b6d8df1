//! Cloudflare Workers AI adapter. Channel keys are `account_id|api_token`.

use async_trait::async_trait;
use bytes::Bytes;
use http::header::AUTHORIZATION;
use http::HeaderMap;
use mrelay_protocol::openai::chat::ChatCompletionRequest;
use mrelay_protocol::openai::Usage;
use mrelay_protocol::sse;

use crate::adapter::{
    read_json_body, Adapter, AdapterOutput, ConvertedRequest, RelayStream, SseUpstream,
};
use crate::error::{RelayError, RelayErrorKind, RelayResult};
use crate::info::{RelayInfo, RelayMode, RelayRequest};

#[derive(Debug, Default)]
pub struct CloudflareAdapter;

impl CloudflareAdapter {
    pub fn new() -> Self {
        Self
    }
}

fn split_key(info: &RelayInfo) -> RelayResult<(&str, &str)> {
    info.api_key.split_once('|').ok_or_else(|| {
        RelayError::invalid_request("cloudflare channel key must be account_id|api_token")
    })
}

#[async_trait]
impl Adapter for CloudflareAdapter {
    fn init(&mut self, _info: &RelayInfo) {}

    fn get_url(&self, info: &RelayInfo) -> RelayResult<String> {
        if info.mode != RelayMode::ChatCompletions {
            return Err(RelayError::invalid_request(
                "cloudflare channels serve chat requests only",
            ));
        }
        let (account_id, _) = split_key(info)?;
        Ok(format!(
            "{}/client/v4/accounts/{account_id}/ai/run/{}",
            info.base_url.trim_end_matches('/'),
            info.upstream_model
        ))
    }

    async fn set_headers(&self, headers: &mut HeaderMap, info: &RelayInfo) -> RelayResult<()> {
        let (_, token) = split_key(info)?;
        headers.insert(
            AUTHORIZATION,
            format!("Bearer {token}")
                .parse()
                .map_err(|_| RelayError::internal("api token is not a valid header value"))?,
        );
        Ok(())
    }

    fn convert_request(
        &self,
        request: &RelayRequest,
        _info: &RelayInfo,
    ) -> RelayResult<ConvertedRequest> {
        let RelayRequest::Chat(req) = request else {
            return Err(RelayError::invalid_request(
                "cloudflare channels serve chat requests only",
            ));
        };
        let body = workers_ai_body(req);
        let body = serde_json::to_vec(&body)
            .map_err(|err| RelayError::internal(format!("encode request: {err}")))?;
        Ok(ConvertedRequest::json(Bytes::from(body)))
    }

    async fn handle_response(
        &self,
        response: wreq::Response,
        info: &RelayInfo,
    ) -> RelayResult<AdapterOutput> {
        if info.is_stream {
            return Ok(AdapterOutput::Stream(Box::new(WorkersAiStream::new(
                SseUpstream::new(response),
                info.origin_model.clone(),
            ))));
        }
        let body = read_json_body(response).await?;
        if body.get("success") == Some(&serde_json::Value::Bool(false)) {
            let message = body
                .pointer("/errors/0/message")
                .and_then(serde_json::Value::as_str)
                .unwrap_or("workers ai error");
            return Err(RelayError::new(
                RelayErrorKind::UpstreamFatal,
                message.to_string(),
            ));
        }
        let text = body
            .pointer("/result/response")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default();
        let converted = serde_json::json!({
            "id": format!("chatcmpl-{}", uuid::Uuid::new_v4()),
            "object": "chat.completion",
            "created": time::OffsetDateTime::now_utc().unix_timestamp(),
            "model": info.origin_model,
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": text},
                "finish_reason": "stop",
            }],
        });
        Ok(AdapterOutput::Json {
            body: converted,
            usage: Usage::default(),
        })
    }
}

fn workers_ai_body(req: &ChatCompletionRequest) -> serde_json::Value {
    let messages: Vec<serde_json::Value> = req
        .messages
        .iter()
        .map(|message| {
            serde_json::json!({"role": message.role, "content": message.text()})
        })
        .collect();
    let mut body = serde_json::json!({"messages": messages});
    if req.is_stream() {
        body["stream"] = serde_json::Value::Bool(true);
    }
    if let Some(max_tokens) = req.max_output_tokens() {
        body["max_tokens"] = serde_json::json!(max_tokens);
    }
    if let Some(temperature) = req.temperature {
        body["temperature"] = serde_json::json!(temperature);
    }
    body
}

struct WorkersAiStream {
    upstream: SseUpstream,
    origin_model: String,
    id: String,
    created: i64,
    usage: Usage,
    fallback_text: String,
    done: bool,
}

impl WorkersAiStream {
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
impl RelayStream for WorkersAiStream {
    async fn next_frames(&mut self) -> RelayResult<Option<Vec<Bytes>>> {
        loop {
            let Some(event) = self.upstream.next_event().await? else {
                if self.done {
                    return Ok(None);
                }
                self.done = true;
                return Ok(Some(vec![sse::done_frame()]));
            };
            if event.is_done() || event.data.trim().is_empty() {
                continue;
            }
            let Ok(body) = serde_json::from_str::<serde_json::Value>(&event.data) else {
                continue;
            };
            let text = body
                .get("response")
                .and_then(serde_json::Value::as_str)
                .unwrap_or_default();
            if let Some(usage) = body.get("usage") {
                if let Ok(parsed) = serde_json::from_value::<Usage>(usage.clone()) {
                    self.usage.merge(&parsed);
                }
            }
            self.fallback_text.push_str(text);
            let chunk = serde_json::json!({
                "id": self.id,
                "object": "chat.completion.chunk",
                "created": self.created,
                "model": self.origin_model,
                "choices": [{
                    "index": 0,
                    "delta": {"role": "assistant", "content": text},
                    "finish_reason": null,
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
