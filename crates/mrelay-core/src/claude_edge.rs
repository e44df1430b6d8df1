//! `/v1/messages` on non-Anthropic channels: the Anthropic dialect is
//! normalised to the canonical OpenAI shape at the edge, relayed, and the
//! response (including the event stream) is transformed back.

use async_trait::async_trait;
use bytes::Bytes;
use mrelay_adapters::{RelayError, RelayResult, RelayStream};
use mrelay_protocol::claude::{ClaudeContent, ContentBlock, MessagesRequest};
use mrelay_protocol::openai::chat::{
    ChatCompletionRequest, ChatMessage, MessageContent, Tool, ToolCall, ToolCallFunction,
};
use mrelay_protocol::openai::Usage;
use mrelay_protocol::sse;

/// Claude request -> canonical chat request.
pub fn messages_to_chat(req: &MessagesRequest) -> ChatCompletionRequest {
    let mut messages: Vec<ChatMessage> = Vec::new();
    if let Some(system) = req.system_text() {
        if !system.is_empty() {
            messages.push(ChatMessage {
                role: "system".to_string(),
                content: MessageContent::Text(system),
                ..Default::default()
            });
        }
    }
    for message in &req.messages {
        match &message.content {
            ClaudeContent::Text(text) => messages.push(ChatMessage {
                role: message.role.clone(),
                content: MessageContent::Text(text.clone()),
                ..Default::default()
            }),
            ClaudeContent::Blocks(blocks) => {
                let mut text = String::new();
                let mut tool_calls: Vec<ToolCall> = Vec::new();
                for block in blocks {
                    match block {
                        ContentBlock::Text { text: part } => text.push_str(part),
                        ContentBlock::ToolUse { id, name, input } => tool_calls.push(ToolCall {
                            id: id.clone(),
                            kind: "function".to_string(),
                            function: ToolCallFunction {
                                name: name.clone(),
                                arguments: input.to_string(),
                            },
                        }),
                        ContentBlock::ToolResult {
                            tool_use_id,
                            content,
                            ..
                        } => {
                            messages.push(ChatMessage {
                                role: "tool".to_string(),
                                content: MessageContent::Text(
                                    content
                                        .as_ref()
                                        .map(render_tool_result)
                                        .unwrap_or_default(),
                                ),
                                tool_call_id: Some(tool_use_id.clone()),
                                ..Default::default()
                            });
                        }
                        ContentBlock::Image { .. } | ContentBlock::Thinking { .. } => {}
                    }
                }
                if !text.is_empty() || !tool_calls.is_empty() {
                    messages.push(ChatMessage {
                        role: message.role.clone(),
                        content: MessageContent::Text(text),
                        tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
                        ..Default::default()
                    });
                }
            }
        }
    }

    let tools = req.tools.as_ref().map(|tools| {
        tools
            .iter()
            .map(|tool| Tool {
                kind: "function".to_string(),
                function: Some(serde_json::json!({
                    "name": tool.name,
                    "description": tool.description,
                    "parameters": tool.input_schema,
                })),
            })
            .collect::<Vec<_>>()
    });

    ChatCompletionRequest {
        model: req.model.clone(),
        messages,
        stream: req.stream,
        max_tokens: Some(req.max_tokens),
        temperature: req.temperature,
        top_p: req.top_p,
        stop: req
            .stop_sequences
            .as_ref()
            .map(|sequences| serde_json::json!(sequences)),
        tools,
        ..Default::default()
    }
}

fn render_tool_result(content: &serde_json::Value) -> String {
    match content {
        serde_json::Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn reverse_stop_reason(reason: Option<&str>) -> &'static str {
    match reason {
        Some("length") => "max_tokens",
        Some("tool_calls") => "tool_use",
        _ => "end_turn",
    }
}

/// Canonical chat response -> Claude message shape.
pub fn chat_response_to_messages(body: &serde_json::Value, model: &str) -> serde_json::Value {
    let mut content: Vec<serde_json::Value> = Vec::new();
    let mut stop_reason = "end_turn";
    if let Some(choice) = body
        .get("choices")
        .and_then(serde_json::Value::as_array)
        .and_then(|choices| choices.first())
    {
        if let Some(text) = choice
            .pointer("/message/content")
            .and_then(serde_json::Value::as_str)
        {
            if !text.is_empty() {
                content.push(serde_json::json!({"type": "text", "text": text}));
            }
        }
        if let Some(tool_calls) = choice
            .pointer("/message/tool_calls")
            .and_then(serde_json::Value::as_array)
        {
            for call in tool_calls {
                let arguments = call
                    .pointer("/function/arguments")
                    .and_then(serde_json::Value::as_str)
                    .unwrap_or("{}");
                content.push(serde_json::json!({
                    "type": "tool_use",
                    "id": call.get("id").cloned().unwrap_or_default(),
                    "name": call.pointer("/function/name").cloned().unwrap_or_default(),
                    "input": serde_json::from_str::<serde_json::Value>(arguments)
                        .unwrap_or(serde_json::json!({})),
                }));
            }
        }
        stop_reason = reverse_stop_reason(
            choice
                .get("finish_reason")
                .and_then(serde_json::Value::as_str),
        );
    }

    let prompt = body
        .pointer("/usage/prompt_tokens")
        .and_then(serde_json::Value::as_i64)
        .unwrap_or(0);
    let completion = body
        .pointer("/usage/completion_tokens")
        .and_then(serde_json::Value::as_i64)
        .unwrap_or(0);

    serde_json::json!({
        "id": format!("msg_{}", uuid::Uuid::new_v4().simple()),
        "type": "message",
        "role": "assistant",
        "model": model,
        "content": content,
        "stop_reason": stop_reason,
        "stop_sequence": null,
        "usage": {"input_tokens": prompt, "output_tokens": completion},
    })
}

/// Wraps an OpenAI-dialect chunk stream and re-emits Anthropic events:
/// message_start, one text content block, message_delta with usage, and
/// message_stop.
pub struct ChatToClaudeStream {
    inner: Box<dyn RelayStream>,
    model: String,
    message_id: String,
    started: bool,
    block_open: bool,
    finished: bool,
}

impl ChatToClaudeStream {
    pub fn new(inner: Box<dyn RelayStream>, model: String) -> Self {
        Self {
            inner,
            model,
            message_id: format!("msg_{}", uuid::Uuid::new_v4().simple()),
            started: false,
            block_open: false,
            finished: false,
        }
    }

    fn frame(&self, name: &str, data: serde_json::Value) -> Bytes {
        sse::encode_frame(Some(name), &data.to_string())
    }

    fn closing_frames(&mut self) -> Vec<Bytes> {
        let usage = self.inner.usage();
        let mut frames = Vec::new();
        if self.block_open {
            frames.push(self.frame(
                "content_block_stop",
                serde_json::json!({"type": "content_block_stop", "index": 0}),
            ));
            self.block_open = false;
        }
        frames.push(self.frame(
            "message_delta",
            serde_json::json!({
                "type": "message_delta",
                "delta": {"stop_reason": "end_turn", "stop_sequence": null},
                "usage": {"output_tokens": usage.completion_tokens},
            }),
        ));
        frames.push(self.frame(
            "message_stop",
            serde_json::json!({"type": "message_stop"}),
        ));
        frames
    }
}

#[async_trait]
impl RelayStream for ChatToClaudeStream {
    async fn next_frames(&mut self) -> RelayResult<Option<Vec<Bytes>>> {
        loop {
            let Some(frames) = self.inner.next_frames().await? else {
                if self.finished {
                    return Ok(None);
                }
                self.finished = true;
                return Ok(Some(self.closing_frames()));
            };

            let mut out: Vec<Bytes> = Vec::new();
            if !self.started {
                self.started = true;
                let usage = self.inner.usage();
                out.push(self.frame(
                    "message_start",
                    serde_json::json!({
                        "type": "message_start",
                        "message": {
                            "id": self.message_id,
                            "type": "message",
                            "role": "assistant",
                            "model": self.model,
                            "content": [],
                            "stop_reason": null,
                            "stop_sequence": null,
                            "usage": {"input_tokens": usage.prompt_tokens, "output_tokens": 0},
                        },
                    }),
                ));
            }

            for frame in frames {
                for text in chunk_delta_texts(&frame) {
                    if !self.block_open {
                        self.block_open = true;
                        out.push(self.frame(
                            "content_block_start",
                            serde_json::json!({
                                "type": "content_block_start",
                                "index": 0,
                                "content_block": {"type": "text", "text": ""},
                            }),
                        ));
                    }
                    out.push(self.frame(
                        "content_block_delta",
                        serde_json::json!({
                            "type": "content_block_delta",
                            "index": 0,
                            "delta": {"type": "text_delta", "text": text},
                        }),
                    ));
                }
            }

            if !out.is_empty() {
                return Ok(Some(out));
            }
        }
    }

    fn usage(&self) -> Usage {
        self.inner.usage()
    }

    fn fallback_text(&self) -> &str {
        self.inner.fallback_text()
    }
}

/// Extract delta text from a canonical `data: <chunk>` frame. The inner
/// stream emits one chunk per frame, so re-parsing stays cheap.
fn chunk_delta_texts(frame: &Bytes) -> Vec<String> {
    let Ok(text) = std::str::from_utf8(frame) else {
        return Vec::new();
    };
    let mut out = Vec::new();
    for line in text.lines() {
        let Some(data) = line.strip_prefix("data: ") else {
            continue;
        };
        if data == sse::DONE_DATA {
            continue;
        }
        let Ok(value) = serde_json::from_str::<serde_json::Value>(data) else {
            continue;
        };
        if let Some(choices) = value.get("choices").and_then(serde_json::Value::as_array) {
            for choice in choices {
                if let Some(delta) = choice
                    .pointer("/delta/content")
                    .and_then(serde_json::Value::as_str)
                {
                    if !delta.is_empty() {
                        out.push(delta.to_string());
                    }
                }
            }
        }
    }
    out
}

/// In-band error event for `/v1/messages` streams.
pub fn claude_error_frame(error: &RelayError) -> Bytes {
    let body = serde_json::json!({
        "type": "error",
        "error": {"type": error.kind_str(), "message": error.message},
    });
    sse::encode_frame(Some("error"), &body.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mrelay_protocol::claude::ClaudeMessage;

    #[test]
    fn request_normalisation_keeps_system_and_limits() {
        let req = MessagesRequest {
            model: "claude-3-5-sonnet".into(),
            system: Some(serde_json::Value::String("be terse".into())),
            messages: vec![ClaudeMessage {
                role: "user".into(),
                content: ClaudeContent::Text("hello".into()),
            }],
            max_tokens: 77,
            ..Default::default()
        };
        let chat = messages_to_chat(&req);
        assert_eq!(chat.messages[0].role, "system");
        assert_eq!(chat.messages[1].text(), "hello");
        assert_eq!(chat.max_tokens, Some(77));
    }

    #[test]
    fn response_round_trips_usage_and_stop_reason() {
        let body = serde_json::json!({
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": "hi"},
                "finish_reason": "length",
            }],
            "usage": {"prompt_tokens": 9, "completion_tokens": 4, "total_tokens": 13},
        });
        let claude = chat_response_to_messages(&body, "claude-3-5-sonnet");
        assert_eq!(claude["stop_reason"], "max_tokens");
        assert_eq!(claude["usage"]["input_tokens"], 9);
        assert_eq!(claude["content"][0]["text"], "hi");
    }
}
