use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModerationRequest {
    #[serde(default = "default_moderation_model")]
    pub model: String,
    pub input: Value,
}

fn default_moderation_model() -> String {
    "omni-moderation-latest".to_string()
}

impl ModerationRequest {
    pub fn input_text(&self) -> String {
        match &self.input {
            Value::String(text) => text.clone(),
            Value::Array(items) => items
                .iter()
                .filter_map(Value::as_str)
                .collect::<Vec<_>>()
                .join("\n"),
            _ => String::new(),
        }
    }
}
