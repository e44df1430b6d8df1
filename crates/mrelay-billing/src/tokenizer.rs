//! Provider-agnostic prompt token estimation.
//!
//! Exact counts come back from upstream usage blocks; this estimator only
//! feeds the pre-consume upper bound and the fallback when a provider never
//! reports usage. BPE encoders are cached per model family.

use std::sync::Arc;

use dashmap::DashMap;
use mrelay_protocol::openai::chat::{ChatMessage, ContentPart, MessageContent};
use tiktoken_rs::{get_bpe_from_model, o200k_base, CoreBPE};

const TOKENS_PER_MESSAGE: i64 = 3;
const TOKENS_PER_NAME: i64 = 1;
const REPLY_PRIMING_TOKENS: i64 = 3;
/// Flat estimate for an image part; detail-aware counting is upstream's job.
const IMAGE_TOKENS: i64 = 85;

pub struct TokenEstimator {
    encoders: DashMap<String, Arc<CoreBPE>>,
    fallback: Arc<CoreBPE>,
}

impl Default for TokenEstimator {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenEstimator {
    pub fn new() -> Self {
        let fallback = Arc::new(o200k_base().expect("bundled o200k encoder"));
        Self {
            encoders: DashMap::new(),
            fallback,
        }
    }

    fn encoder_for(&self, model: &str) -> Arc<CoreBPE> {
        if let Some(found) = self.encoders.get(model) {
            return found.clone();
        }
        let encoder = match get_bpe_from_model(model) {
            Ok(bpe) => Arc::new(bpe),
            Err(_) => self.fallback.clone(),
        };
        self.encoders.insert(model.to_string(), encoder.clone());
        encoder
    }

    pub fn count_text(&self, model: &str, text: &str) -> i64 {
        if text.is_empty() {
            return 0;
        }
        self.encoder_for(model).encode_with_special_tokens(text).len() as i64
    }

    /// Chat prompt estimate with the per-message framing overhead.
    pub fn count_messages(&self, model: &str, messages: &[ChatMessage]) -> i64 {
        let encoder = self.encoder_for(model);
        let mut total = REPLY_PRIMING_TOKENS;
        for message in messages {
            total += TOKENS_PER_MESSAGE;
            total += encoder.encode_with_special_tokens(&message.role).len() as i64;
            total += self.count_content(&encoder, &message.content);
            if let Some(name) = &message.name {
                total += TOKENS_PER_NAME;
                total += encoder.encode_with_special_tokens(name).len() as i64;
            }
            if let Some(tool_calls) = &message.tool_calls {
                for call in tool_calls {
                    total += encoder.encode_with_special_tokens(&call.function.name).len() as i64;
                    total += encoder
                        .encode_with_special_tokens(&call.function.arguments)
                        .len() as i64;
                }
            }
        }
        total
    }

    fn count_content(&self, encoder: &CoreBPE, content: &MessageContent) -> i64 {
        match content {
            MessageContent::Absent | MessageContent::Null => 0,
            MessageContent::Text(text) => encoder.encode_with_special_tokens(text).len() as i64,
            MessageContent::Parts(parts) => {
                let mut total = 0;
                for part in parts {
                    total += match part {
                        ContentPart::Text { text } => {
                            encoder.encode_with_special_tokens(text).len() as i64
                        }
                        ContentPart::ImageUrl { .. } => IMAGE_TOKENS,
                        ContentPart::InputAudio { .. } => IMAGE_TOKENS,
                    };
                }
                total
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_text_is_zero() {
        let estimator = TokenEstimator::new();
        assert_eq!(estimator.count_text("gpt-4o", ""), 0);
    }

    #[test]
    fn message_overhead_is_applied() {
        let estimator = TokenEstimator::new();
        let messages = vec![ChatMessage::user("hi")];
        let counted = estimator.count_messages("gpt-4o", &messages);
        // 3 priming + 3 per-message + role + content tokens.
        assert!(counted >= 7, "got {counted}");
    }

    #[test]
    fn unknown_model_falls_back() {
        let estimator = TokenEstimator::new();
        let counted = estimator.count_text("ernie-4.0-8k", "hello world");
        assert!(counted > 0);
    }

    #[test]
    fn image_parts_use_flat_estimate() {
        let estimator = TokenEstimator::new();
        let message: ChatMessage = serde_json::from_str(
            r#"{"role":"user","content":[{"type":"image_url","image_url":{"url":"http://x/a.png"}}]}"#,
        )
        .unwrap();
        let counted = estimator.count_messages("gpt-4o", &[message]);
        assert!(counted >= IMAGE_TOKENS);
    }
}
