pub mod audio;
pub mod chat;
pub mod completion;
pub mod embedding;
pub mod image;
pub mod moderation;

pub use chat::{
    ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse, ChatMessage, Choice,
    ChunkChoice, ContentPart, DeltaMessage, MessageContent, ToolCall, ToolCallFunction,
};

use serde::{Deserialize, Serialize};

/// Final token accounting block, shared by every OpenAI-dialect response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
}

impl Usage {
    pub fn new(prompt_tokens: i64, completion_tokens: i64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }

    /// Later observations win field-by-field; providers that report usage
    /// incrementally keep overwriting until the final block arrives.
    pub fn merge(&mut self, incoming: &Usage) {
        if incoming.prompt_tokens > 0 {
            self.prompt_tokens = incoming.prompt_tokens;
        }
        if incoming.completion_tokens > 0 {
            self.completion_tokens = incoming.completion_tokens;
        }
        self.total_tokens = if incoming.total_tokens > 0 {
            incoming.total_tokens
        } else {
            self.prompt_tokens + self.completion_tokens
        };
    }

    pub fn is_empty(&self) -> bool {
        self.prompt_tokens == 0 && self.completion_tokens == 0 && self.total_tokens == 0
    }
}
