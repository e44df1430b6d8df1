use std::time::Duration;

use bytes::Bytes;
use mrelay_protocol::claude::MessagesRequest;
use mrelay_protocol::midjourney::SubmitRequest;
use mrelay_protocol::openai::chat::ChatCompletionRequest;
use mrelay_protocol::openai::completion::CompletionRequest;
use mrelay_protocol::openai::embedding::EmbeddingRequest;
use mrelay_protocol::openai::image::ImageRequest;
use mrelay_protocol::openai::moderation::ModerationRequest;
use mrelay_protocol::openai::audio::SpeechRequest;
use mrelay_storage::ChannelRow;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelayMode {
    ChatCompletions,
    Completions,
    Embeddings,
    ImagesGenerations,
    AudioSpeech,
    AudioTranscription,
    AudioTranslation,
    Moderations,
    ClaudeMessages,
    MjSubmit,
    SunoSubmit,
}

/// The canonical, dialect-neutral request handed to an adapter.
#[derive(Debug, Clone)]
pub enum RelayRequest {
    Chat(ChatCompletionRequest),
    Completion(CompletionRequest),
    Embedding(EmbeddingRequest),
    Image(ImageRequest),
    Speech(SpeechRequest),
    /// Multipart audio bodies are relayed verbatim; only the model field is
    /// rewritten (inside the multipart form, by the adapter).
    AudioUpload {
        model: String,
        content_type: String,
        body: Bytes,
    },
    Moderation(ModerationRequest),
    /// Native Anthropic dialect; reaches only Anthropic-type channels.
    ClaudeMessages(MessagesRequest),
    MjSubmit {
        action: String,
        body: SubmitRequest,
    },
    SunoSubmit {
        action: String,
        body: serde_json::Value,
    },
}

impl RelayRequest {
    pub fn mode(&self) -> RelayMode {
        match self {
            RelayRequest::Chat(_) => RelayMode::ChatCompletions,
            RelayRequest::Completion(_) => RelayMode::Completions,
            RelayRequest::Embedding(_) => RelayMode::Embeddings,
            RelayRequest::Image(_) => RelayMode::ImagesGenerations,
            RelayRequest::Speech(_) => RelayMode::AudioSpeech,
            RelayRequest::AudioUpload { .. } => RelayMode::AudioTranscription,
            RelayRequest::Moderation(_) => RelayMode::Moderations,
            RelayRequest::ClaudeMessages(_) => RelayMode::ClaudeMessages,
            RelayRequest::MjSubmit { .. } => RelayMode::MjSubmit,
            RelayRequest::SunoSubmit { .. } => RelayMode::SunoSubmit,
        }
    }

    pub fn is_stream(&self) -> bool {
        match self {
            RelayRequest::Chat(req) => req.is_stream(),
            RelayRequest::Completion(req) => req.is_stream(),
            RelayRequest::ClaudeMessages(req) => req.is_stream(),
            _ => false,
        }
    }
}

/// Per-request routing and channel context threaded through every adapter
/// call. Built by the pipeline after channel selection.
#[derive(Debug, Clone)]
pub struct RelayInfo {
    pub trace_id: String,
    pub user_id: i64,
    pub token_id: i64,
    pub group: String,
    pub mode: RelayMode,
    /// Model name the client asked for; responses carry this name.
    pub origin_model: String,
    /// Model name the provider sees, after the channel's rename map.
    pub upstream_model: String,
    pub is_stream: bool,
    pub channel: ChannelRow,
    /// Credential selected from the channel's key list for this attempt.
    pub api_key: String,
    pub base_url: String,
    pub streaming_timeout: Duration,
    /// Async-task action (mj "imagine", suno "music", ...), when relevant.
    pub task_action: Option<String>,
}

impl RelayInfo {
    /// Rewrite the `model` field of a canonical response back to the name
    /// the client asked for.
    pub fn rewrite_model(&self, body: &mut serde_json::Value) {
        if let Some(object) = body.as_object_mut() {
            if object.contains_key("model") {
                object.insert(
                    "model".to_string(),
                    serde_json::Value::String(self.origin_model.clone()),
                );
            }
        }
    }
}
