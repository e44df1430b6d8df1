//! Cohere v2 chat adapter.

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
use crate::error::{RelayError, RelayResult};
use crate::info::{RelayInfo, RelayMode, RelayRequest};

#[derive(Debug, Default)]
pub struct CohereAdapter;

impl CohereAdapter {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Adapter for CohereAdapter {
    fn init(&mut self, _info: &RelayInfo) {}

    fn get_url(&self, info: &RelayInfo) -> RelayResult<String> {
        match info.mode {
            RelayMode::ChatCompletions => Ok(format!(
                "{}/v2/chat",
                info.base_url.trim_end_matches('/')
            )),
            RelayMode::Embeddings => Ok(format!(
                "{}/v2/embed",
                info.base_url.trim_end_matches('/')
            )),
            _ => Err(RelayError::invalid_request(
                "cohere channels serve chat and embedding requests only",
            )),
        }
    }

    async fn set_headers(&self, headers: &mut HeaderMap, info: &RelayInfo) -> RelayResult<()> {
        headers.insert(
            AUTHORIZATION,
            format!("Bearer {}", info.api_key)
                .parse()
                .map_err(|_| RelayError::internal("api key is not a valid header value"))?,
        );
        Ok(())
    }

    fn convert_request(
        &self,
        request: &RelayRequest,
        info: &RelayInfo,
    ) -> RelayResult<ConvertedRequest> {
        let value = match request {
            RelayRequest::Chat(req) => chat_to_cohere(req, &info.upstream_model),
            RelayRequest::Embedding(req) => serde_json::json!({
                "model": info.upstream_model,
                "texts": [req.input_text()],
                "input_type": "search_query",
                "embedding_types": ["float"],
            }),
            _ => {
                return Err(RelayError::invalid_request(
                    "cohere channels serve chat and embedding requests only",
                ))
            }
        };
        let body = serde_json::to_vec(&value)
            .map_err(|err| RelayError::internal(format!("encode request: {err}")))?;
        Ok(ConvertedRequest::json(Bytes::from(body)))
    }

    async fn handle_response(
        &self,
        response: wreq::Response,
        info: &RelayInfo,
    ) -> RelayResult<AdapterOutput> {
        if info.is_stream {
            return Ok(AdapterOutput::Stream(Box::new(CohereStream::new(
                SseUpstream::new(response),
                info.origin_model.clone(),
            ))));
        }
        let body = read_json_body(response).await?;
        let usage = cohere_usage(&body);
        let mut text = String::new();
        if let Some(content) = body
            .pointer("/message/content")
            .and_then(serde_json::Value::as_array)
        {
            for block in content {
                if let Some(part) = block.get("text").and_then(serde_json::Value::as_str) {
                    text.push_str(part);
                }
            }
        }
        let finish = match body
            .get("finish_reason")
            .and_then(serde_json::Value::as_str)
        {
            Some("MAX_TOKENS") => "length",
            _ => "stop",
        };
        let converted = serde_json::json!({
            "id": body.get("id").and_then(serde_json::Value::as_str).unwrap_or("chatcmpl-cohere"),
            "object": "chat.completion",
            "created": time::OffsetDateTime::now_utc().unix_timestamp(),
            "model": info.origin_model,
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": text},
                "finish_reason": finish,
            }],
            "usage": usage,
        });
        Ok(AdapterOutput::Json {
            body: converted,
            usage,
        })
    }
}

fn cohere_usage(body: &serde_json::Value) -> Usage {
    let prompt = body
        .pointer("/usage/billed_units/input_tokens")
        .and_then(serde_json::Value::as_i64)
        .unwrap_or(0);
    let completion = body
        .pointer("/usage/billed_units/output_tokens")
        .and_then(serde_json::Value::as_i64)
        .unwrap_or(0);
    Usage::new(prompt, completion)
}

fn chat_to_cohere(req: &ChatCompletionRequest, upstream_model: &str) -> serde_json::Value {
    let messages: Vec<serde_json::Value> = req
        .messages
        .iter()
        .map(|message| {
            let role = match message.role.as_str() {
                "assistant" => "assistant",
                "system" | "developer" => "system",
                "tool" => "tool",
                _ => "user",
            };
            serde_json::json!({"role": role, "content": message.text()})
        })
        .collect();

    let mut body = serde_json::json!({
        "model": upstream_model,
        "messages": messages,
    });
    if req.is_stream() {
        body["stream"] = serde_json::Value::Bool(true);
    }
    if let Some(temperature) = req.temperature {
        body["temperature"] = serde_json::json!(temperature);
    }
    if let Some(max_tokens) = req.max_output_tokens() {
        body["max_tokens"] = serde_json::json!(max_tokens);
    }
    body
}

struct CohereStream {
    upstream: SseUpstream,
    origin_model: String,
    id: String,
    created: i64,
    usage: Usage,
    fallback_text: String,
    done: bool,
}

impl CohereStream {
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
impl RelayStream for CohereStream {
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
            let Ok(body) = serde_json::from_str::<serde_json::Value>(&event.data) else {
                continue;
            };
            let kind = body.get("type").and_then(serde_json::Value::as_str);
            let (text, finish) = match kind {
                Some("content-delta") => (
                    body.pointer("/delta/message/content/text")
                        .and_then(serde_json::Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    None,
                ),
                Some("message-end") => {
                    if let Some(usage) = body.pointer("/delta/usage") {
                        let parsed = Usage::new(
                            usage
                                .pointer("/billed_units/input_tokens")
                                .and_then(serde_json::Value::as_i64)
                                .unwrap_or(0),
                            usage
                                .pointer("/billed_units/output_tokens")
                                .and_then(serde_json::Value::as_i64)
                                .unwrap_or(0),
                        );
                        self.usage.merge(&parsed);
                    }
                    (String::new(), Some("stop"))
                }
                _ => continue,
            };
            self.fallback_text.push_str(&text);
            let chunk = serde_json::json!({
                "id": self.id,
                "object": "chat.completion.chunk",
                "created": self.created,
                "model": self.origin_model,
                "choices": [{
                    "index": 0,
                    "delta": {"role": "assistant", "content": text},
                    "finish_reason": finish,
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
