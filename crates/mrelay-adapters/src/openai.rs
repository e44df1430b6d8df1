//! Default OpenAI-compatible adapter.
//!
//! Also serves every OpenAI-dialect provider (Mistral, Moonshot, DeepSeek,
//! Groq, OpenRouter, XAI, Perplexity, local Ollama's /v1 surface) — only the
//! base URL differs.

use async_trait::async_trait;
use bytes::Bytes;
use http::header::AUTHORIZATION;
use http::HeaderMap;
use mrelay_protocol::openai::Usage;
use mrelay_protocol::sse;

use crate::adapter::{
    read_json_body, Adapter, AdapterOutput, ConvertedRequest, RelayStream, SseUpstream,
};
use crate::error::{RelayError, RelayResult};
use crate::info::{RelayInfo, RelayMode, RelayRequest};

#[derive(Debug, Default)]
pub struct OpenAiAdapter;

impl OpenAiAdapter {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Adapter for OpenAiAdapter {
    fn init(&mut self, _info: &RelayInfo) {}

    fn get_url(&self, info: &RelayInfo) -> RelayResult<String> {
        let path = match info.mode {
            RelayMode::ChatCompletions | RelayMode::ClaudeMessages => "/v1/chat/completions",
            RelayMode::Completions => "/v1/completions",
            RelayMode::Embeddings => "/v1/embeddings",
            RelayMode::ImagesGenerations => "/v1/images/generations",
            RelayMode::AudioSpeech => "/v1/audio/speech",
            RelayMode::AudioTranscription => "/v1/audio/transcriptions",
            RelayMode::AudioTranslation => "/v1/audio/translations",
            RelayMode::Moderations => "/v1/moderations",
            RelayMode::MjSubmit | RelayMode::SunoSubmit => {
                return Err(RelayError::internal("task mode on completion adapter"))
            }
        };
        Ok(format!("{}{}", info.base_url.trim_end_matches('/'), path))
    }

    async fn set_headers(&self, headers: &mut HeaderMap, info: &RelayInfo) -> RelayResult<()> {
        let value = format!("Bearer {}", info.api_key)
            .parse()
            .map_err(|_| RelayError::internal("api key is not a valid header value"))?;
        headers.insert(AUTHORIZATION, value);
        Ok(())
    }

    fn convert_request(
        &self,
        request: &RelayRequest,
        info: &RelayInfo,
    ) -> RelayResult<ConvertedRequest> {
        let mut value = match request {
            RelayRequest::Chat(req) => serde_json::to_value(req),
            RelayRequest::Completion(req) => serde_json::to_value(req),
            RelayRequest::Embedding(req) => serde_json::to_value(req),
            RelayRequest::Image(req) => serde_json::to_value(req),
            RelayRequest::Speech(req) => serde_json::to_value(req),
            RelayRequest::Moderation(req) => serde_json::to_value(req),
            RelayRequest::AudioUpload {
                content_type, body, ..
            } => {
                // Multipart form relayed verbatim; the model inside the form
                // already names what the client asked for.
                return Ok(ConvertedRequest {
                    body: body.clone(),
                    content_type: content_type.clone(),
                });
            }
            RelayRequest::ClaudeMessages(_) => {
                return Err(RelayError::internal(
                    "claude dialect must be normalised before openai dispatch",
                ))
            }
            RelayRequest::MjSubmit { .. } | RelayRequest::SunoSubmit { .. } => {
                return Err(RelayError::internal("task request on completion adapter"))
            }
        }
        .map_err(|err| RelayError::internal(format!("encode request: {err}")))?;

        if let Some(object) = value.as_object_mut() {
            object.insert(
                "model".to_string(),
                serde_json::Value::String(info.upstream_model.clone()),
            );
            // Ask the upstream for a final usage chunk so streamed requests
            // can settle on exact counts.
            if info.is_stream && !object.contains_key("stream_options") {
                object.insert(
                    "stream_options".to_string(),
                    serde_json::json!({ "include_usage": true }),
                );
            }
        }
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
            return Ok(AdapterOutput::Stream(Box::new(OpenAiStream::new(
                SseUpstream::new(response),
                info.origin_model.clone(),
            ))));
        }

        if matches!(info.mode, RelayMode::AudioSpeech) {
            let content_type = response
                .headers()
                .get(http::header::CONTENT_TYPE)
                .and_then(|value| value.to_str().ok())
                .unwrap_or("application/octet-stream")
                .to_string();
            let body = response.bytes().await.map_err(|err| {
                RelayError::upstream_transient(format!("reading audio body failed: {err}"))
            })?;
            return Ok(AdapterOutput::Binary {
                content_type,
                body,
                usage: Usage::default(),
            });
        }

        let mut body = read_json_body(response).await?;
        let usage = body
            .get("usage")
            .and_then(|value| serde_json::from_value::<Usage>(value.clone()).ok())
            .unwrap_or_default();
        info.rewrite_model(&mut body);
        Ok(AdapterOutput::Json { body, usage })
    }
}

/// Pass-through stream mapper: canonical chunks in, canonical chunks out,
/// with the model field rewritten and the usage block captured on the fly.
pub struct OpenAiStream {
    upstream: SseUpstream,
    origin_model: String,
    usage: Usage,
    fallback_text: String,
    done: bool,
}

impl OpenAiStream {
    pub fn new(upstream: SseUpstream, origin_model: String) -> Self {
        Self {
            upstream,
            origin_model,
            usage: Usage::default(),
            fallback_text: String::new(),
            done: false,
        }
    }
}

#[async_trait]
impl RelayStream for OpenAiStream {
    async fn next_frames(&mut self) -> RelayResult<Option<Vec<Bytes>>> {
        loop {
            let Some(event) = self.upstream.next_event().await? else {
                if self.done {
                    return Ok(None);
                }
                self.done = true;
                return Ok(Some(vec![sse::done_frame()]));
            };
            if event.is_done() {
                // Swallow the upstream terminator; our own goes out when the
                // body actually ends so trailing usage chunks are not lost.
                continue;
            }
            if event.data.trim().is_empty() {
                continue;
            }
            let Ok(mut chunk) = serde_json::from_str::<serde_json::Value>(&event.data) else {
                // Malformed keep-alives are dropped rather than forwarded.
                continue;
            };
            if let Some(usage) = chunk.get("usage") {
                if !usage.is_null() {
                    if let Ok(parsed) = serde_json::from_value::<Usage>(usage.clone()) {
                        self.usage.merge(&parsed);
                    }
                }
            }
            if let Some(choices) = chunk.get("choices").and_then(|value| value.as_array()) {
                for choice in choices {
                    if let Some(text) = choice.pointer("/delta/content").and_then(|v| v.as_str()) {
                        self.fallback_text.push_str(text);
                    }
                }
            }
            if let Some(object) = chunk.as_object_mut() {
                if object.contains_key("model") {
                    object.insert(
                        "model".to_string(),
                        serde_json::Value::String(self.origin_model.clone()),
                    );
                }
            }
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
