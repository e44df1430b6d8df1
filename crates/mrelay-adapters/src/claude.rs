//! Anthropic messages adapter.
//!
//! Serves two shapes: the native `/v1/messages` dialect (passthrough with
//! model rename) and OpenAI-dialect chat completions converted into message
//! blocks and back, including the streamed event mapping.

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use http::HeaderMap;
use mrelay_protocol::claude::stream::{BlockDelta, StreamEvent};
use mrelay_protocol::claude::{
    ClaudeContent, ClaudeMessage, ClaudeTool, ContentBlock, MessagesRequest,
};
use mrelay_protocol::openai::chat::{
    ChatCompletionRequest, ChatMessage, ContentPart, DeltaToolCall, DeltaToolCallFunction,
    MessageContent, ToolCall, ToolCallFunction,
};
use mrelay_protocol::openai::Usage;
use mrelay_protocol::sse;

use crate::adapter::{
    read_json_body, Adapter, AdapterOutput, ConvertedRequest, RelayStream, SseUpstream,
};
use crate::error::{RelayError, RelayResult};
use crate::info::{RelayInfo, RelayMode, RelayRequest};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: i64 = 4096;

#[derive(Debug, Default)]
pub struct ClaudeAdapter;

impl ClaudeAdapter {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Adapter for ClaudeAdapter {
    fn init(&mut self, _info: &RelayInfo) {}

    fn get_url(&self, info: &RelayInfo) -> RelayResult<String> {
        match info.mode {
            RelayMode::ChatCompletions | RelayMode::ClaudeMessages => Ok(format!(
                "{}/v1/messages",
                info.base_url.trim_end_matches('/')
            )),
            _ => Err(RelayError::invalid_request(
                "anthropic channels serve chat and messages requests only",
            )),
        }
    }

    async fn set_headers(&self, headers: &mut HeaderMap, info: &RelayInfo) -> RelayResult<()> {
        headers.insert(
            "x-api-key",
            info.api_key
                .parse()
                .map_err(|_| RelayError::internal("api key is not a valid header value"))?,
        );
        headers.insert(
            "anthropic-version",
            ANTHROPIC_VERSION.parse().expect("static header"),
        );
        Ok(())
    }

    fn convert_request(
        &self,
        request: &RelayRequest,
        info: &RelayInfo,
    ) -> RelayResult<ConvertedRequest> {
        let native = match request {
            RelayRequest::ClaudeMessages(req) => {
                let mut req = req.clone();
                req.model = info.upstream_model.clone();
                req
            }
            RelayRequest::Chat(req) => chat_to_messages(req, &info.upstream_model)?,
            _ => {
                return Err(RelayError::invalid_request(
                    "anthropic channels serve chat and messages requests only",
                ))
            }
        };
        let body = serde_json::to_vec(&native)
            .map_err(|err| RelayError::internal(format!("encode request: {err}")))?;
        Ok(ConvertedRequest::json(Bytes::from(body)))
    }

    async fn handle_response(
        &self,
        response: wreq::Response,
        info: &RelayInfo,
    ) -> RelayResult<AdapterOutput> {
        match (info.mode, info.is_stream) {
            (RelayMode::ClaudeMessages, true) => Ok(AdapterOutput::Stream(Box::new(
                ClaudeNativeStream::new(SseUpstream::new(response), info.origin_model.clone()),
            ))),
            (RelayMode::ClaudeMessages, false) => {
                let mut body = read_json_body(response).await?;
                let usage = claude_usage(&body);
                info.rewrite_model(&mut body);
                Ok(AdapterOutput::Json { body, usage })
            }
            (_, true) => Ok(AdapterOutput::Stream(Box::new(ClaudeToOpenAiStream::new(
                SseUpstream::new(response),
                info.origin_model.clone(),
            )))),
            (_, false) => {
                let body = read_json_body(response).await?;
                let usage = claude_usage(&body);
                let converted = messages_to_chat_response(&body, &info.origin_model)?;
                Ok(AdapterOutput::Json {
                    body: converted,
                    usage,
                })
            }
        }
    }
}

fn claude_usage(body: &serde_json::Value) -> Usage {
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

/// OpenAI chat -> Anthropic messages.
pub fn chat_to_messages(
    req: &ChatCompletionRequest,
    upstream_model: &str,
) -> RelayResult<MessagesRequest> {
    let mut system_parts: Vec<String> = Vec::new();
    let mut messages: Vec<ClaudeMessage> = Vec::new();

    for message in &req.messages {
        match message.role.as_str() {
            "system" | "developer" => system_parts.push(message.text()),
            "tool" => {
                let block = ContentBlock::ToolResult {
                    tool_use_id: message.tool_call_id.clone().unwrap_or_default(),
                    content: Some(serde_json::Value::String(message.text())),
                    is_error: None,
                };
                // Tool results ride in a user turn; append to the previous
                // one when possible to keep strict role alternation.
                match messages.last_mut() {
                    Some(last) if last.role == "user" => match &mut last.content {
                        ClaudeContent::Blocks(blocks) => blocks.push(block),
                        content => {
                            let text = content.text();
                            *content = ClaudeContent::Blocks(vec![
                                ContentBlock::Text { text },
                                block,
                            ]);
                        }
                    },
                    _ => messages.push(ClaudeMessage {
                        role: "user".to_string(),
                        content: ClaudeContent::Blocks(vec![block]),
                    }),
                }
            }
            "assistant" => {
                let mut blocks: Vec<ContentBlock> = Vec::new();
                let text = message.text();
                if !text.is_empty() {
                    blocks.push(ContentBlock::Text { text });
                }
                if let Some(tool_calls) = &message.tool_calls {
                    for call in tool_calls {
                        let input = serde_json::from_str(&call.function.arguments)
                            .unwrap_or(serde_json::Value::Object(Default::default()));
                        blocks.push(ContentBlock::ToolUse {
                            id: call.id.clone(),
                            name: call.function.name.clone(),
                            input,
                        });
                    }
                }
                if blocks.is_empty() {
                    continue;
                }
                messages.push(ClaudeMessage {
                    role: "assistant".to_string(),
                    content: ClaudeContent::Blocks(blocks),
                });
            }
            _ => {
                let content = match &message.content {
                    MessageContent::Parts(parts) => {
                        ClaudeContent::Blocks(parts_to_blocks(parts)?)
                    }
                    _ => ClaudeContent::Text(message.text()),
                };
                messages.push(ClaudeMessage {
                    role: "user".to_string(),
                    content,
                });
            }
        }
    }

    let tools = req.tools.as_ref().map(|tools| {
        tools
            .iter()
            .filter_map(|tool| tool.function.as_ref())
            .map(|function| ClaudeTool {
                name: function
                    .get("name")
                    .and_then(serde_json::Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                description: function
                    .get("description")
                    .and_then(serde_json::Value::as_str)
                    .map(str::to_string),
                input_schema: function
                    .get("parameters")
                    .cloned()
                    .unwrap_or_else(|| serde_json::json!({"type": "object"})),
            })
            .collect::<Vec<_>>()
    });

    let stop_sequences = req.stop.as_ref().map(|stop| match stop {
        serde_json::Value::String(text) => vec![text.clone()],
        serde_json::Value::Array(items) => items
            .iter()
            .filter_map(serde_json::Value::as_str)
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    });

    Ok(MessagesRequest {
        model: upstream_model.to_string(),
        messages,
        max_tokens: req.max_output_tokens().unwrap_or(DEFAULT_MAX_TOKENS),
        system: (!system_parts.is_empty())
            .then(|| serde_json::Value::String(system_parts.join("\n"))),
        stream: req.stream,
        temperature: req.temperature,
        top_p: req.top_p,
        top_k: None,
        stop_sequences,
        tools,
        tool_choice: None,
        metadata: None,
        extra: Default::default(),
    })
}

fn parts_to_blocks(parts: &[ContentPart]) -> RelayResult<Vec<ContentBlock>> {
    let mut blocks = Vec::new();
    for part in parts {
        match part {
            ContentPart::Text { text } => blocks.push(ContentBlock::Text { text: text.clone() }),
            ContentPart::ImageUrl { image_url } => {
                let source = if let Some(encoded) = image_url.url.strip_prefix("data:") {
                    let (media_type, data) = encoded
                        .split_once(";base64,")
                        .ok_or_else(|| RelayError::invalid_request("unsupported image data url"))?;
                    mrelay_protocol::claude::ImageSource {
                        kind: "base64".to_string(),
                        media_type: Some(media_type.to_string()),
                        data: Some(data.to_string()),
                        url: None,
                    }
                } else {
                    mrelay_protocol::claude::ImageSource {
                        kind: "url".to_string(),
                        media_type: None,
                        data: None,
                        url: Some(image_url.url.clone()),
                    }
                };
                blocks.push(ContentBlock::Image { source });
            }
            ContentPart::InputAudio { .. } => {
                return Err(RelayError::invalid_request(
                    "audio content is not supported on anthropic channels",
                ))
            }
        }
    }
    Ok(blocks)
}

fn map_stop_reason(reason: Option<&str>) -> Option<String> {
    reason.map(|reason| {
        match reason {
            "end_turn" | "stop_sequence" => "stop",
            "max_tokens" => "length",
            "tool_use" => "tool_calls",
            other => other,
        }
        .to_string()
    })
}

/// Anthropic message -> OpenAI chat completion response.
fn messages_to_chat_response(
    body: &serde_json::Value,
    origin_model: &str,
) -> RelayResult<serde_json::Value> {
    let mut text = String::new();
    let mut tool_calls: Vec<ToolCall> = Vec::new();
    if let Some(blocks) = body.get("content").and_then(serde_json::Value::as_array) {
        for block in blocks {
            match block.get("type").and_then(serde_json::Value::as_str) {
                Some("text") => {
                    if let Some(part) = block.get("text").and_then(serde_json::Value::as_str) {
                        text.push_str(part);
                    }
                }
                Some("tool_use") => tool_calls.push(ToolCall {
                    id: block
                        .get("id")
                        .and_then(serde_json::Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    kind: "function".to_string(),
                    function: ToolCallFunction {
                        name: block
                            .get("name")
                            .and_then(serde_json::Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                        arguments: block
                            .get("input")
                            .map(|input| input.to_string())
                            .unwrap_or_else(|| "{}".to_string()),
                    },
                }),
                _ => {}
            }
        }
    }

    let usage = claude_usage(body);
    let message = ChatMessage {
        role: "assistant".to_string(),
        content: MessageContent::Text(text),
        name: None,
        tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
        tool_call_id: None,
    };
    let finish_reason = map_stop_reason(
        body.get("stop_reason")
            .and_then(serde_json::Value::as_str),
    )
    .unwrap_or_else(|| "stop".to_string());

    Ok(serde_json::json!({
        "id": body.get("id").and_then(serde_json::Value::as_str)
            .map(|id| format!("chatcmpl-{id}"))
            .unwrap_or_else(|| "chatcmpl-unknown".to_string()),
        "object": "chat.completion",
        "created": time::OffsetDateTime::now_utc().unix_timestamp(),
        "model": origin_model,
        "choices": [{
            "index": 0,
            "message": message,
            "finish_reason": finish_reason,
        }],
        "usage": usage,
    }))
}

/// Native `/v1/messages` stream passthrough with model rewrite and usage
/// capture.
pub struct ClaudeNativeStream {
    upstream: SseUpstream,
    origin_model: String,
    usage: Usage,
    fallback_text: String,
}

impl ClaudeNativeStream {
    pub fn new(upstream: SseUpstream, origin_model: String) -> Self {
        Self {
            upstream,
            origin_model,
            usage: Usage::default(),
            fallback_text: String::new(),
        }
    }
}

#[async_trait]
impl RelayStream for ClaudeNativeStream {
    async fn next_frames(&mut self) -> RelayResult<Option<Vec<Bytes>>> {
        loop {
            let Some(event) = self.upstream.next_event().await? else {
                return Ok(None);
            };
            if event.data.trim().is_empty() {
                continue;
            }
            let Ok(mut value) = serde_json::from_str::<serde_json::Value>(&event.data) else {
                continue;
            };
            track_claude_stream_usage(&value, &mut self.usage, &mut self.fallback_text);
            if let Some(model) = value.pointer_mut("/message/model") {
                *model = serde_json::Value::String(self.origin_model.clone());
            }
            let name = value
                .get("type")
                .and_then(serde_json::Value::as_str)
                .map(str::to_string);
            let data = serde_json::to_string(&value)
                .map_err(|err| RelayError::internal(format!("encode event: {err}")))?;
            return Ok(Some(vec![sse::encode_frame(name.as_deref(), &data)]));
        }
    }

    fn usage(&self) -> Usage {
        self.usage
    }

    fn fallback_text(&self) -> &str {
        &self.fallback_text
    }
}

fn track_claude_stream_usage(
    value: &serde_json::Value,
    usage: &mut Usage,
    fallback_text: &mut String,
) {
    match value.get("type").and_then(serde_json::Value::as_str) {
        Some("message_start") => {
            if let Some(input) = value
                .pointer("/message/usage/input_tokens")
                .and_then(serde_json::Value::as_i64)
            {
                usage.merge(&Usage::new(input, usage.completion_tokens));
            }
        }
        Some("message_delta") => {
            if let Some(output) = value
                .pointer("/usage/output_tokens")
                .and_then(serde_json::Value::as_i64)
            {
                usage.merge(&Usage::new(usage.prompt_tokens, output));
            }
        }
        Some("content_block_delta") => {
            if let Some(text) = value
                .pointer("/delta/text")
                .and_then(serde_json::Value::as_str)
            {
                fallback_text.push_str(text);
            }
        }
        _ => {}
    }
}

/// Anthropic events -> OpenAI chat chunks, for OpenAI-dialect clients routed
/// onto an Anthropic channel.
pub struct ClaudeToOpenAiStream {
    upstream: SseUpstream,
    origin_model: String,
    id: String,
    created: i64,
    usage: Usage,
    fallback_text: String,
    /// content block index -> tool call index in the OpenAI delta shape.
    tool_indexes: HashMap<u32, u32>,
    next_tool_index: u32,
    sent_role: bool,
    done: bool,
}

impl ClaudeToOpenAiStream {
    pub fn new(upstream: SseUpstream, origin_model: String) -> Self {
        Self {
            upstream,
            origin_model,
            id: format!("chatcmpl-{}", uuid::Uuid::new_v4()),
            created: time::OffsetDateTime::now_utc().unix_timestamp(),
            usage: Usage::default(),
            fallback_text: String::new(),
            tool_indexes: HashMap::new(),
            next_tool_index: 0,
            sent_role: false,
            done: false,
        }
    }

    fn chunk(&self, delta: serde_json::Value, finish_reason: Option<&str>) -> serde_json::Value {
        serde_json::json!({
            "id": self.id,
            "object": "chat.completion.chunk",
            "created": self.created,
            "model": self.origin_model,
            "choices": [{
                "index": 0,
                "delta": delta,
                "finish_reason": finish_reason,
            }],
        })
    }

    fn encode(&self, chunk: &serde_json::Value) -> RelayResult<Bytes> {
        let data = serde_json::to_string(chunk)
            .map_err(|err| RelayError::internal(format!("encode chunk: {err}")))?;
        Ok(sse::encode_frame(None, &data))
    }
}

#[async_trait]
impl RelayStream for ClaudeToOpenAiStream {
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
            let Ok(parsed) = serde_json::from_str::<StreamEvent>(&event.data) else {
                continue;
            };
            match parsed {
                StreamEvent::MessageStart { message } => {
                    self.usage
                        .merge(&Usage::new(message.usage.input_tokens, 0));
                    self.sent_role = true;
                    let chunk = self.chunk(serde_json::json!({"role": "assistant"}), None);
                    return Ok(Some(vec![self.encode(&chunk)?]));
                }
                StreamEvent::ContentBlockStart {
                    index,
                    content_block,
                } => {
                    if let ContentBlock::ToolUse { id, name, .. } = content_block {
                        let tool_index = self.next_tool_index;
                        self.next_tool_index += 1;
                        self.tool_indexes.insert(index, tool_index);
                        let delta = DeltaToolCall {
                            index: tool_index,
                            id: Some(id),
                            kind: Some("function".to_string()),
                            function: Some(DeltaToolCallFunction {
                                name: Some(name),
                                arguments: Some(String::new()),
                            }),
                        };
                        let chunk = self.chunk(
                            serde_json::json!({"tool_calls": [delta]}),
                            None,
                        );
                        return Ok(Some(vec![self.encode(&chunk)?]));
                    }
                }
                StreamEvent::ContentBlockDelta { index, delta } => match delta {
                    BlockDelta::TextDelta { text } => {
                        self.fallback_text.push_str(&text);
                        let role = (!self.sent_role).then(|| {
                            self.sent_role = true;
                            "assistant"
                        });
                        let mut body = serde_json::json!({"content": text});
                        if let Some(role) = role {
                            body["role"] = serde_json::Value::String(role.to_string());
                        }
                        let chunk = self.chunk(body, None);
                        return Ok(Some(vec![self.encode(&chunk)?]));
                    }
                    BlockDelta::InputJsonDelta { partial_json } => {
                        if let Some(tool_index) = self.tool_indexes.get(&index).copied() {
                            let delta = DeltaToolCall {
                                index: tool_index,
                                id: None,
                                kind: None,
                                function: Some(DeltaToolCallFunction {
                                    name: None,
                                    arguments: Some(partial_json),
                                }),
                            };
                            let chunk = self.chunk(
                                serde_json::json!({"tool_calls": [delta]}),
                                None,
                            );
                            return Ok(Some(vec![self.encode(&chunk)?]));
                        }
                    }
                    BlockDelta::ThinkingDelta { .. } | BlockDelta::SignatureDelta { .. } => {}
                },
                StreamEvent::MessageDelta { delta, usage } => {
                    if let Some(usage) = usage {
                        if let Some(output) = usage.output_tokens {
                            self.usage.merge(&Usage::new(self.usage.prompt_tokens, output));
                        }
                        if let Some(input) = usage.input_tokens {
                            self.usage.merge(&Usage::new(input, self.usage.completion_tokens));
                        }
                    }
                    let finish = map_stop_reason(delta.stop_reason.as_deref())
                        .unwrap_or_else(|| "stop".to_string());
                    let mut chunk = self.chunk(serde_json::json!({}), Some(&finish));
                    chunk["usage"] = serde_json::to_value(self.usage)
                        .map_err(|err| RelayError::internal(err.to_string()))?;
                    return Ok(Some(vec![self.encode(&chunk)?]));
                }
                StreamEvent::ContentBlockStop { .. }
                | StreamEvent::MessageStop
                | StreamEvent::Ping => {}
                StreamEvent::Error { error } => {
                    return Err(RelayError::new(
                        crate::error::RelayErrorKind::StreamAborted,
                        error
                            .get("message")
                            .and_then(serde_json::Value::as_str)
                            .unwrap_or("upstream stream error")
                            .to_string(),
                    ))
                }
            }
        }
    }

    fn usage(&self) -> Usage {
        self.usage
    }

    fn fallback_text(&self) -> &str {
        &self.fallback_text
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mrelay_protocol::openai::chat::Tool;

    #[test]
    fn system_and_tools_convert() {
        let req = ChatCompletionRequest {
            model: "gpt-4o".into(),
            messages: vec![
                ChatMessage {
                    role: "system".into(),
                    content: MessageContent::Text("be brief".into()),
                    ..Default::default()
                },
                ChatMessage::user("hi"),
            ],
            tools: Some(vec![Tool {
                kind: "function".into(),
                function: Some(serde_json::json!({
                    "name": "lookup",
                    "description": "d",
                    "parameters": {"type": "object", "properties": {}},
                })),
            }]),
            max_tokens: Some(128),
            ..Default::default()
        };
        let native = chat_to_messages(&req, "claude-3-5-sonnet-20241022").unwrap();
        assert_eq!(native.model, "claude-3-5-sonnet-20241022");
        assert_eq!(native.max_tokens, 128);
        assert_eq!(native.system, Some(serde_json::Value::String("be brief".into())));
        assert_eq!(native.messages.len(), 1);
        assert_eq!(native.tools.as_ref().unwrap()[0].name, "lookup");
    }

    #[test]
    fn response_maps_stop_reason_and_usage() {
        let body = serde_json::json!({
            "id": "msg_1",
            "type": "message",
            "role": "assistant",
            "model": "claude-3-5-sonnet-20241022",
            "content": [{"type": "text", "text": "hello"}],
            "stop_reason": "max_tokens",
            "usage": {"input_tokens": 10, "output_tokens": 5},
        });
        let converted = messages_to_chat_response(&body, "my-claude").unwrap();
        assert_eq!(converted["model"], "my-claude");
        assert_eq!(converted["choices"][0]["finish_reason"], "length");
        assert_eq!(converted["usage"]["prompt_tokens"], 10);
        assert_eq!(converted["choices"][0]["message"]["content"], "hello");
    }

    #[test]
    fn tool_result_message_appends_to_user_turn() {
        let req = ChatCompletionRequest {
            model: "gpt-4o".into(),
            messages: vec![
                ChatMessage::user("check the weather"),
                ChatMessage {
                    role: "assistant".into(),
                    tool_calls: Some(vec![ToolCall {
                        id: "call_1".into(),
                        kind: "function".into(),
                        function: ToolCallFunction {
                            name: "weather".into(),
                            arguments: "{}".into(),
                        },
                    }]),
                    ..Default::default()
                },
                ChatMessage {
                    role: "tool".into(),
                    content: MessageContent::Text("sunny".into()),
                    tool_call_id: Some("call_1".into()),
                    ..Default::default()
                },
            ],
            ..Default::default()
        };
        let native = chat_to_messages(&req, "claude-3-5-sonnet").unwrap();
        assert_eq!(native.messages.len(), 3);
        assert_eq!(native.messages[2].role, "user");
    }
}
