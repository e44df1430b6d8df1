//! Google Gemini adapter: contents/parts conversion, SSE streaming via
//! `alt=sse`, embeddings, and the Files API used by the media relay.

use async_trait::async_trait;
use bytes::Bytes;
use http::HeaderMap;
use mrelay_protocol::openai::chat::{ChatCompletionRequest, ContentPart, MessageContent};
use mrelay_protocol::openai::Usage;
use mrelay_protocol::sse;
use serde::Deserialize;

use crate::adapter::{
    read_json_body, Adapter, AdapterOutput, ConvertedRequest, RelayStream, SseUpstream,
};
use crate::client::client_for_proxy;
use crate::error::{RelayError, RelayErrorKind, RelayResult};
use crate::info::{RelayInfo, RelayMode, RelayRequest};

#[derive(Debug, Default)]
pub struct GeminiAdapter;

impl GeminiAdapter {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Adapter for GeminiAdapter {
    fn init(&mut self, _info: &RelayInfo) {}

    fn get_url(&self, info: &RelayInfo) -> RelayResult<String> {
        let base = info.base_url.trim_end_matches('/');
        let model = &info.upstream_model;
        match info.mode {
            RelayMode::ChatCompletions if info.is_stream => Ok(format!(
                "{base}/v1beta/models/{model}:streamGenerateContent?alt=sse"
            )),
            RelayMode::ChatCompletions => {
                Ok(format!("{base}/v1beta/models/{model}:generateContent"))
            }
            RelayMode::Embeddings => Ok(format!("{base}/v1beta/models/{model}:embedContent")),
            _ => Err(RelayError::invalid_request(
                "gemini channels serve chat and embedding requests only",
            )),
        }
    }

    async fn set_headers(&self, headers: &mut HeaderMap, info: &RelayInfo) -> RelayResult<()> {
        headers.insert(
            "x-goog-api-key",
            info.api_key
                .parse()
                .map_err(|_| RelayError::internal("api key is not a valid header value"))?,
        );
        Ok(())
    }

    fn convert_request(
        &self,
        request: &RelayRequest,
        _info: &RelayInfo,
    ) -> RelayResult<ConvertedRequest> {
        let value = match request {
            RelayRequest::Chat(req) => chat_to_gemini(req)?,
            RelayRequest::Embedding(req) => serde_json::json!({
                "content": {"parts": [{"text": req.input_text()}]},
            }),
            _ => {
                return Err(RelayError::invalid_request(
                    "gemini channels serve chat and embedding requests only",
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
            return Ok(AdapterOutput::Stream(Box::new(GeminiStream::new(
                SseUpstream::new(response),
                info.origin_model.clone(),
            ))));
        }
        let body = read_json_body(response).await?;
        match info.mode {
            RelayMode::Embeddings => {
                let embedding = body
                    .pointer("/embedding/values")
                    .cloned()
                    .unwrap_or(serde_json::Value::Array(Vec::new()));
                let converted = serde_json::json!({
                    "object": "list",
                    "model": info.origin_model,
                    "data": [{"object": "embedding", "index": 0, "embedding": embedding}],
                });
                Ok(AdapterOutput::Json {
                    body: converted,
                    usage: Usage::default(),
                })
            }
            _ => {
                let usage = gemini_usage(&body);
                let converted = gemini_to_chat_response(&body, &info.origin_model, usage)?;
                Ok(AdapterOutput::Json {
                    body: converted,
                    usage,
                })
            }
        }
    }
}

fn gemini_usage(body: &serde_json::Value) -> Usage {
    let prompt = body
        .pointer("/usageMetadata/promptTokenCount")
        .and_then(serde_json::Value::as_i64)
        .unwrap_or(0);
    let completion = body
        .pointer("/usageMetadata/candidatesTokenCount")
        .and_then(serde_json::Value::as_i64)
        .unwrap_or(0);
    Usage::new(prompt, completion)
}

fn map_finish_reason(reason: Option<&str>) -> &'static str {
    match reason {
        Some("MAX_TOKENS") => "length",
        Some("SAFETY") | Some("RECITATION") | Some("PROHIBITED_CONTENT") => "content_filter",
        _ => "stop",
    }
}

pub fn chat_to_gemini(req: &ChatCompletionRequest) -> RelayResult<serde_json::Value> {
    let mut system_parts: Vec<serde_json::Value> = Vec::new();
    let mut contents: Vec<serde_json::Value> = Vec::new();

    for message in &req.messages {
        let role = match message.role.as_str() {
            "system" | "developer" => {
                system_parts.push(serde_json::json!({"text": message.text()}));
                continue;
            }
            "assistant" => "model",
            _ => "user",
        };
        let parts = message_parts(&message.content)?;
        if parts.is_empty() {
            continue;
        }
        contents.push(serde_json::json!({"role": role, "parts": parts}));
    }

    let mut generation_config = serde_json::Map::new();
    if let Some(temperature) = req.temperature {
        generation_config.insert("temperature".into(), serde_json::json!(temperature));
    }
    if let Some(top_p) = req.top_p {
        generation_config.insert("topP".into(), serde_json::json!(top_p));
    }
    if let Some(max_tokens) = req.max_output_tokens() {
        generation_config.insert("maxOutputTokens".into(), serde_json::json!(max_tokens));
    }
    if let Some(stop) = &req.stop {
        let sequences = match stop {
            serde_json::Value::String(text) => vec![text.clone()],
            serde_json::Value::Array(items) => items
                .iter()
                .filter_map(serde_json::Value::as_str)
                .map(str::to_string)
                .collect(),
            _ => Vec::new(),
        };
        if !sequences.is_empty() {
            generation_config.insert("stopSequences".into(), serde_json::json!(sequences));
        }
    }

    let mut body = serde_json::json!({"contents": contents});
    if !system_parts.is_empty() {
        body["systemInstruction"] = serde_json::json!({"parts": system_parts});
    }
    if !generation_config.is_empty() {
        body["generationConfig"] = serde_json::Value::Object(generation_config);
    }
    if let Some(tools) = &req.tools {
        let declarations: Vec<serde_json::Value> = tools
            .iter()
            .filter_map(|tool| tool.function.clone())
            .map(|mut function| {
                // Gemini rejects OpenAI's json-schema extras.
                if let Some(object) = function.as_object_mut() {
                    object.remove("strict");
                }
                function
            })
            .collect();
        if !declarations.is_empty() {
            body["tools"] = serde_json::json!([{"functionDeclarations": declarations}]);
        }
    }
    Ok(body)
}

fn message_parts(content: &MessageContent) -> RelayResult<Vec<serde_json::Value>> {
    Ok(match content {
        MessageContent::Absent | MessageContent::Null => Vec::new(),
        MessageContent::Text(text) => {
            if text.is_empty() {
                Vec::new()
            } else {
                vec![serde_json::json!({"text": text})]
            }
        }
        MessageContent::Parts(parts) => {
            let mut out = Vec::new();
            for part in parts {
                match part {
                    ContentPart::Text { text } => out.push(serde_json::json!({"text": text})),
                    ContentPart::ImageUrl { image_url } => {
                        if let Some(encoded) = image_url.url.strip_prefix("data:") {
                            let (media_type, data) =
                                encoded.split_once(";base64,").ok_or_else(|| {
                                    RelayError::invalid_request("unsupported image data url")
                                })?;
                            out.push(serde_json::json!({
                                "inlineData": {"mimeType": media_type, "data": data},
                            }));
                        } else {
                            // File-API URIs route through fileData.
                            out.push(serde_json::json!({
                                "fileData": {"fileUri": image_url.url},
                            }));
                        }
                    }
                    ContentPart::InputAudio { .. } => {
                        return Err(RelayError::invalid_request(
                            "audio parts are not supported on gemini channels",
                        ))
                    }
                }
            }
            out
        }
    })
}

fn gemini_to_chat_response(
    body: &serde_json::Value,
    origin_model: &str,
    usage: Usage,
) -> RelayResult<serde_json::Value> {
    let mut text = String::new();
    let mut finish = "stop";
    if let Some(candidate) = body
        .get("candidates")
        .and_then(serde_json::Value::as_array)
        .and_then(|candidates| candidates.first())
    {
        if let Some(parts) = candidate
            .pointer("/content/parts")
            .and_then(serde_json::Value::as_array)
        {
            for part in parts {
                if let Some(value) = part.get("text").and_then(serde_json::Value::as_str) {
                    text.push_str(value);
                }
            }
        }
        finish = map_finish_reason(
            candidate
                .get("finishReason")
                .and_then(serde_json::Value::as_str),
        );
    }

    Ok(serde_json::json!({
        "id": format!("chatcmpl-{}", uuid::Uuid::new_v4()),
        "object": "chat.completion",
        "created": time::OffsetDateTime::now_utc().unix_timestamp(),
        "model": origin_model,
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": text},
            "finish_reason": finish,
        }],
        "usage": usage,
    }))
}

/// Gemini SSE chunks -> OpenAI chat chunks. Usage metadata is cumulative, so
/// each observation replaces the previous one.
pub struct GeminiStream {
    upstream: SseUpstream,
    origin_model: String,
    id: String,
    created: i64,
    usage: Usage,
    fallback_text: String,
    done: bool,
}

impl GeminiStream {
    pub fn new(upstream: SseUpstream, origin_model: String) -> Self {
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
impl RelayStream for GeminiStream {
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
            self.usage.merge(&gemini_usage(&body));

            let mut text = String::new();
            let mut finish: Option<&str> = None;
            if let Some(candidate) = body
                .get("candidates")
                .and_then(serde_json::Value::as_array)
                .and_then(|candidates| candidates.first())
            {
                if let Some(parts) = candidate
                    .pointer("/content/parts")
                    .and_then(serde_json::Value::as_array)
                {
                    for part in parts {
                        if let Some(value) = part.get("text").and_then(serde_json::Value::as_str) {
                            text.push_str(value);
                        }
                    }
                }
                if let Some(reason) = candidate
                    .get("finishReason")
                    .and_then(serde_json::Value::as_str)
                {
                    finish = Some(map_finish_reason(Some(reason)));
                }
            }
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

// ---------------------------------------------------------------------------
// Files API (media relay)

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeminiFile {
    pub name: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub size_bytes: Option<String>,
    #[serde(default)]
    pub create_time: Option<String>,
    #[serde(default)]
    pub expiration_time: Option<String>,
    #[serde(default)]
    pub sha256_hash: Option<String>,
    pub uri: String,
    #[serde(default)]
    pub state: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiFileEnvelope {
    file: GeminiFile,
}

/// Upload bytes to the Gemini Files API through the channel's proxy.
/// Files expire upstream (~48h); only the returned URI is kept.
pub async fn upload_file(
    base_url: &str,
    api_key: &str,
    proxy: Option<&str>,
    display_name: &str,
    mime_type: &str,
    data: Bytes,
) -> RelayResult<GeminiFile> {
    let client = client_for_proxy(proxy)?;
    let base = base_url.trim_end_matches('/');
    let url = format!("{base}/upload/v1beta/files?uploadType=multipart");

    let metadata = serde_json::json!({"file": {"displayName": display_name}});
    let boundary = format!("mrelay-{}", uuid::Uuid::new_v4().simple());
    let mut body = Vec::with_capacity(data.len() + 512);
    body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
    body.extend_from_slice(b"Content-Type: application/json; charset=UTF-8\r\n\r\n");
    body.extend_from_slice(metadata.to_string().as_bytes());
    body.extend_from_slice(format!("\r\n--{boundary}\r\n").as_bytes());
    body.extend_from_slice(format!("Content-Type: {mime_type}\r\n\r\n").as_bytes());
    body.extend_from_slice(&data);
    body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());

    let response = client
        .post(url)
        .header("x-goog-api-key", api_key)
        .header(
            http::header::CONTENT_TYPE,
            format!("multipart/related; boundary={boundary}"),
        )
        .body(body)
        .send()
        .await
        .map_err(|err| RelayError::upstream_transient(format!("file upload failed: {err}")))?;

    if !response.status().is_success() {
        let status = response.status().as_u16();
        let body = response.bytes().await.unwrap_or_default();
        return Err(crate::error::classify_upstream_failure(status, &body, None));
    }
    let body = response.bytes().await.map_err(|err| {
        RelayError::upstream_transient(format!("reading upload response failed: {err}"))
    })?;
    let envelope: GeminiFileEnvelope = serde_json::from_slice(&body).map_err(|err| {
        RelayError::new(
            RelayErrorKind::UpstreamFatal,
            format!("unexpected upload response: {err}"),
        )
    })?;
    Ok(envelope.file)
}

/// Fetch one file's state by its `files/<id>` name.
pub async fn get_file(
    base_url: &str,
    api_key: &str,
    proxy: Option<&str>,
    name: &str,
) -> RelayResult<GeminiFile> {
    let client = client_for_proxy(proxy)?;
    let base = base_url.trim_end_matches('/');
    let url = format!("{base}/v1beta/{}", name.trim_start_matches('/'));
    let response = client
        .get(url)
        .header("x-goog-api-key", api_key)
        .send()
        .await
        .map_err(|err| RelayError::upstream_transient(format!("file status failed: {err}")))?;
    if !response.status().is_success() {
        let status = response.status().as_u16();
        let body = response.bytes().await.unwrap_or_default();
        return Err(crate::error::classify_upstream_failure(status, &body, None));
    }
    let body = response.bytes().await.map_err(|err| {
        RelayError::upstream_transient(format!("reading file status failed: {err}"))
    })?;
    serde_json::from_slice(&body).map_err(|err| {
        RelayError::new(
            RelayErrorKind::UpstreamFatal,
            format!("unexpected file status response: {err}"),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use mrelay_protocol::openai::chat::ChatMessage;

    #[test]
    fn system_messages_become_system_instruction() {
        let req = ChatCompletionRequest {
            model: "gemini-2.0-flash".into(),
            messages: vec![
                ChatMessage {
                    role: "system".into(),
                    content: MessageContent::Text("short answers".into()),
                    ..Default::default()
                },
                ChatMessage::user("hi"),
                ChatMessage::assistant("hello"),
            ],
            temperature: Some(0.4),
            max_tokens: Some(64),
            ..Default::default()
        };
        let body = chat_to_gemini(&req).unwrap();
        assert_eq!(body["systemInstruction"]["parts"][0]["text"], "short answers");
        assert_eq!(body["contents"][0]["role"], "user");
        assert_eq!(body["contents"][1]["role"], "model");
        assert_eq!(body["generationConfig"]["maxOutputTokens"], 64);
    }

    #[test]
    fn finish_reason_mapping() {
        assert_eq!(map_finish_reason(Some("MAX_TOKENS")), "length");
        assert_eq!(map_finish_reason(Some("SAFETY")), "content_filter");
        assert_eq!(map_finish_reason(Some("STOP")), "stop");
    }
}
