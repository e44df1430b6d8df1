//! Ali DashScope adapter (qwen chat + text embeddings).

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
pub struct AliAdapter;

impl AliAdapter {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Adapter for AliAdapter {
    fn init(&mut self, _info: &RelayInfo) {}

    fn get_url(&self, info: &RelayInfo) -> RelayResult<String> {
        let base = info.base_url.trim_end_matches('/');
        match info.mode {
            RelayMode::ChatCompletions => Ok(format!(
                "{base}/api/v1/services/aigc/text-generation/generation"
            )),
            RelayMode::Embeddings => Ok(format!(
                "{base}/api/v1/services/embeddings/text-embedding/text-embedding"
            )),
            _ => Err(RelayError::invalid_request(
                "ali channels serve chat and embedding requests only",
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
        if info.is_stream {
            headers.insert("X-DashScope-SSE", "enable".parse().expect("static header"));
        }
        Ok(())
    }

    fn convert_request(
        &self,
        request: &RelayRequest,
        info: &RelayInfo,
    ) -> RelayResult<ConvertedRequest> {
        let value = match request {
            RelayRequest::Chat(req) => chat_to_dashscope(req, &info.upstream_model),
            RelayRequest::Embedding(req) => serde_json::json!({
                "model": info.upstream_model,
                "input": {"texts": [req.input_text()]},
                "parameters": {"text_type": "query"},
            }),
            _ => {
                return Err(RelayError::invalid_request(
                    "ali channels serve chat and embedding requests only",
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
            return Ok(AdapterOutput::Stream(Box::new(DashScopeStream::new(
                SseUpstream::new(response),
                info.origin_model.clone(),
            ))));
        }
        let body = read_json_body(response).await?;
        if let Some(code) = body.get("code").and_then(serde_json::Value::as_str) {
            if !code.is_empty() {
                return Err(dashscope_error(&body, code));
            }
        }
        match info.mode {
            RelayMode::Embeddings => {
                let data: Vec<serde_json::Value> = body
                    .pointer("/output/embeddings")
                    .and_then(serde_json::Value::as_array)
                    .map(|embeddings| {
                        embeddings
                            .iter()
                            .enumerate()
                            .map(|(index, entry)| {
                                serde_json::json!({
                                    "object": "embedding",
                                    "index": index,
                                    "embedding": entry.get("embedding").cloned()
                                        .unwrap_or(serde_json::Value::Array(Vec::new())),
                                })
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                let usage = dashscope_usage(&body);
                let converted = serde_json::json!({
                    "object": "list",
                    "model": info.origin_model,
                    "data": data,
                    "usage": usage,
                });
                Ok(AdapterOutput::Json {
                    body: converted,
                    usage,
                })
            }
            _ => {
                let usage = dashscope_usage(&body);
                let (text, finish) = dashscope_message(&body);
                let converted = serde_json::json!({
                    "id": body.get("request_id").and_then(serde_json::Value::as_str)
                        .unwrap_or("chatcmpl-ali"),
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
    }
}

fn dashscope_error(body: &serde_json::Value, code: &str) -> RelayError {
    let message = body
        .get("message")
        .and_then(serde_json::Value::as_str)
        .unwrap_or("dashscope error");
    let kind = match code {
        "InvalidApiKey" | "Arrearage" => RelayErrorKind::UpstreamAuthDead,
        "Throttling" | "Throttling.RateQuota" | "Throttling.AllocationQuota" => {
            RelayErrorKind::UpstreamTransient
        }
        _ => RelayErrorKind::UpstreamFatal,
    };
    RelayError::new(kind, format!("dashscope {code}: {message}"))
}

fn dashscope_usage(body: &serde_json::Value) -> Usage {
    let prompt = body
        .pointer("/usage/input_tokens")
        .and_then(serde_json::Value::as_i64)
        .unwrap_or(0);
    let completion = body
        .pointer("/usage/output_tokens")
        .and_then(serde_json::Value::as_i64)
        .unwrap_or(0);
    Usage::new(prompt, completion)
}

fn dashscope_message(body: &serde_json::Value) -> (String, Option<&'static str>) {
    if let Some(choice) = body
        .pointer("/output/choices")
        .and_then(serde_json::Value::as_array)
        .and_then(|choices| choices.first())
    {
        let text = choice
            .pointer("/message/content")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default()
            .to_string();
        let finish = match choice
            .get("finish_reason")
            .and_then(serde_json::Value::as_str)
        {
            Some("stop") => Some("stop"),
            Some("length") => Some("length"),
            Some("null") | None => None,
            Some(_) => Some("stop"),
        };
        return (text, finish);
    }
    // Older models answer with output.text.
    (
        body.pointer("/output/text")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default()
            .to_string(),
        Some("stop"),
    )
}

fn chat_to_dashscope(req: &ChatCompletionRequest, upstream_model: &str) -> serde_json::Value {
    let messages: Vec<serde_json::Value> = req
        .messages
        .iter()
        .map(|message| {
            let role = match message.role.as_str() {
                "assistant" => "assistant",
                "system" | "developer" => "system",
                _ => "user",
            };
            serde_json::json!({"role": role, "content": message.text()})
        })
        .collect();

    let mut parameters = serde_json::json!({"result_format": "message"});
    if let Some(temperature) = req.temperature {
        parameters["temperature"] = serde_json::json!(temperature);
    }
    if let Some(top_p) = req.top_p {
        parameters["top_p"] = serde_json::json!(top_p);
    }
    if let Some(max_tokens) = req.max_output_tokens() {
        parameters["max_tokens"] = serde_json::json!(max_tokens);
    }
    if req.is_stream() {
        parameters["incremental_output"] = serde_json::Value::Bool(true);
    }

    serde_json::json!({
        "model": upstream_model,
        "input": {"messages": messages},
        "parameters": parameters,
    })
}

struct DashScopeStream {
    upstream: SseUpstream,
    origin_model: String,
    id: String,
    created: i64,
    usage: Usage,
    fallback_text: String,
    done: bool,
}

impl DashScopeStream {
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
impl RelayStream for DashScopeStream {
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
            if let Some(code) = body.get("code").and_then(serde_json::Value::as_str) {
                if !code.is_empty() {
                    return Err(dashscope_error(&body, code));
                }
            }
            self.usage.merge(&dashscope_usage(&body));
            let (text, finish) = dashscope_message(&body);
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
