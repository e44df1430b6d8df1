//! Runtime row shapes.
//!
//! The relay never reads entities directly on the hot path; bootstrap and the
//! refresh task convert entities into these rows and publish them through
//! in-memory snapshots.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelType {
    OpenAi = 1,
    Anthropic = 2,
    Gemini = 3,
    Baidu = 4,
    Ali = 5,
    Zhipu = 6,
    Cohere = 7,
    Mistral = 8,
    Cloudflare = 9,
    Ollama = 10,
    Moonshot = 11,
    DeepSeek = 12,
    Groq = 13,
    OpenRouter = 14,
    Xai = 15,
    Perplexity = 16,
    Midjourney = 17,
    Suno = 18,
}

impl ChannelType {
    pub fn from_i32(value: i32) -> Option<Self> {
        Some(match value {
            1 => Self::OpenAi,
            2 => Self::Anthropic,
            3 => Self::Gemini,
            4 => Self::Baidu,
            5 => Self::Ali,
            6 => Self::Zhipu,
            7 => Self::Cohere,
            8 => Self::Mistral,
            9 => Self::Cloudflare,
            10 => Self::Ollama,
            11 => Self::Moonshot,
            12 => Self::DeepSeek,
            13 => Self::Groq,
            14 => Self::OpenRouter,
            15 => Self::Xai,
            16 => Self::Perplexity,
            17 => Self::Midjourney,
            18 => Self::Suno,
            _ => return None,
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Anthropic => "anthropic",
            Self::Gemini => "gemini",
            Self::Baidu => "baidu",
            Self::Ali => "ali",
            Self::Zhipu => "zhipu",
            Self::Cohere => "cohere",
            Self::Mistral => "mistral",
            Self::Cloudflare => "cloudflare",
            Self::Ollama => "ollama",
            Self::Moonshot => "moonshot",
            Self::DeepSeek => "deepseek",
            Self::Groq => "groq",
            Self::OpenRouter => "openrouter",
            Self::Xai => "xai",
            Self::Perplexity => "perplexity",
            Self::Midjourney => "midjourney",
            Self::Suno => "suno",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    Enabled = 1,
    ManuallyDisabled = 2,
    AutoDisabled = 3,
}

impl ChannelStatus {
    pub fn from_i32(value: i32) -> Self {
        match value {
            1 => Self::Enabled,
            3 => Self::AutoDisabled,
            _ => Self::ManuallyDisabled,
        }
    }
}

pub const STATUS_ENABLED: i32 = 1;
pub const STATUS_DISABLED: i32 = 2;

pub const ROLE_USER: i32 = 1;
pub const ROLE_ADMIN: i32 = 10;

/// Per-channel free-form settings carried in the `setting` JSON column.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelSetting {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub region_weights: HashMap<String, u32>,
    #[serde(default)]
    pub sdk_mode: bool,
}

/// Upstream HTTP status classification overrides, `status_code_mapping` column.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatusCodeMapping {
    #[serde(default)]
    pub retry: Vec<u16>,
    #[serde(default)]
    pub disable: Vec<u16>,
}

#[derive(Debug, Clone)]
pub struct ChannelRow {
    pub id: i64,
    pub kind: ChannelType,
    pub name: String,
    pub key: String,
    pub base_url: String,
    pub models: Vec<String>,
    pub groups: Vec<String>,
    pub model_mapping: HashMap<String, String>,
    pub status_code_mapping: Option<StatusCodeMapping>,
    pub priority: i64,
    pub weight: i64,
    pub status: ChannelStatus,
    pub auto_ban: bool,
    pub setting: ChannelSetting,
}

impl ChannelRow {
    /// Credential entries in declaration order; empty lines are skipped.
    pub fn keys(&self) -> Vec<&str> {
        self.key
            .split('\n')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .collect()
    }

    /// Canonical -> provider-native model rename.
    pub fn map_model<'a>(&'a self, model: &'a str) -> &'a str {
        self.model_mapping
            .get(model)
            .map(String::as_str)
            .unwrap_or(model)
    }

    pub fn serves(&self, group: &str, model: &str) -> bool {
        self.groups.iter().any(|entry| entry == group)
            && self.models.iter().any(|entry| entry == model)
    }
}

#[derive(Debug, Clone)]
pub struct AbilityRow {
    pub group: String,
    pub model: String,
    pub channel_id: i64,
    pub enabled: bool,
    pub priority: i64,
    pub weight: i64,
}

#[derive(Debug, Clone)]
pub struct UserRow {
    pub id: i64,
    pub username: String,
    pub group: String,
    pub quota: i64,
    pub used_quota: i64,
    pub request_count: i64,
    pub status: i32,
    pub role: i32,
}

impl UserRow {
    pub fn is_enabled(&self) -> bool {
        self.status == STATUS_ENABLED
    }

    pub fn is_admin(&self) -> bool {
        self.role >= ROLE_ADMIN
    }
}

#[derive(Debug, Clone)]
pub struct TokenRow {
    pub id: i64,
    pub user_id: i64,
    pub key: String,
    pub name: String,
    pub remain_quota: i64,
    pub unlimited_quota: bool,
    pub expired_at: i64,
    pub allowed_models: Vec<String>,
    pub allowed_groups: Vec<String>,
    pub specific_channel_id: Option<i64>,
    pub status: i32,
}

impl TokenRow {
    pub fn is_enabled(&self) -> bool {
        self.status == STATUS_ENABLED
    }

    pub fn is_expired(&self, now_unix: i64) -> bool {
        self.expired_at >= 0 && self.expired_at < now_unix
    }

    pub fn allows_model(&self, model: &str) -> bool {
        self.allowed_models.is_empty() || self.allowed_models.iter().any(|entry| entry == model)
    }

    pub fn allows_group(&self, group: &str) -> bool {
        self.allowed_groups.is_empty() || self.allowed_groups.iter().any(|entry| entry == group)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogKind {
    TopUp = 1,
    Consume = 2,
    System = 3,
    Error = 4,
    Task = 5,
}

#[derive(Debug, Clone)]
pub struct LogInsert {
    pub user_id: i64,
    pub token_id: i64,
    pub channel_id: i64,
    pub model: String,
    pub kind: LogKind,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub quota: i64,
    pub elapsed_ms: i64,
    pub is_stream: bool,
    pub content: String,
}

impl LogInsert {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            user_id: 0,
            token_id: 0,
            channel_id: 0,
            model: String::new(),
            kind: LogKind::System,
            prompt_tokens: 0,
            completion_tokens: 0,
            quota: 0,
            elapsed_ms: 0,
            is_stream: false,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskPlatform {
    #[serde(rename = "mj")]
    Midjourney,
    #[serde(rename = "suno")]
    Suno,
}

impl TaskPlatform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Midjourney => "mj",
            Self::Suno => "suno",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "mj" => Some(Self::Midjourney),
            "suno" => Some(Self::Suno),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Submitted,
    Queued,
    InProgress,
    Success,
    Failure,
    Unknown,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Submitted => "SUBMITTED",
            Self::Queued => "QUEUED",
            Self::InProgress => "IN_PROGRESS",
            Self::Success => "SUCCESS",
            Self::Failure => "FAILURE",
            Self::Unknown => "UNKNOWN",
        }
    }

    pub fn from_str(value: &str) -> Self {
        match value {
            "SUBMITTED" | "NOT_START" => Self::Submitted,
            "QUEUED" => Self::Queued,
            "IN_PROGRESS" | "MODAL" => Self::InProgress,
            "SUCCESS" => Self::Success,
            "FAILURE" => Self::Failure,
            _ => Self::Unknown,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failure)
    }
}

#[derive(Debug, Clone)]
pub struct TaskRow {
    pub id: i64,
    pub task_id: String,
    pub platform: TaskPlatform,
    pub user_id: i64,
    pub token_id: i64,
    pub channel_id: i64,
    pub action: String,
    pub status: TaskStatus,
    pub progress: String,
    pub submit_time: i64,
    pub start_time: i64,
    pub finish_time: i64,
    pub quota: i64,
    pub fail_reason: String,
    pub data: String,
}

#[derive(Debug, Clone)]
pub struct TaskInsert {
    pub task_id: String,
    pub platform: TaskPlatform,
    pub user_id: i64,
    pub token_id: i64,
    pub channel_id: i64,
    pub action: String,
    pub quota: i64,
    pub data: String,
}

pub fn split_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_key_splitting_skips_blank_lines() {
        let row = ChannelRow {
            id: 1,
            kind: ChannelType::OpenAi,
            name: "c".into(),
            key: "sk-a\n\nsk-b\n".into(),
            base_url: String::new(),
            models: vec![],
            groups: vec![],
            model_mapping: HashMap::new(),
            status_code_mapping: None,
            priority: 0,
            weight: 1,
            status: ChannelStatus::Enabled,
            auto_ban: true,
            setting: ChannelSetting::default(),
        };
        assert_eq!(row.keys(), vec!["sk-a", "sk-b"]);
    }

    #[test]
    fn token_allow_lists_default_open() {
        let token = TokenRow {
            id: 1,
            user_id: 1,
            key: "k".into(),
            name: String::new(),
            remain_quota: 0,
            unlimited_quota: true,
            expired_at: -1,
            allowed_models: vec![],
            allowed_groups: vec!["vip".into()],
            specific_channel_id: None,
            status: STATUS_ENABLED,
        };
        assert!(token.allows_model("anything"));
        assert!(token.allows_group("vip"));
        assert!(!token.allows_group("default"));
        assert!(!token.is_expired(1_700_000_000));
    }
}
