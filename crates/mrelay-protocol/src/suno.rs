//! Suno API dialect (music generation submit / fetch).

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Suno's generic envelope; `code == "success"` marks an accepted call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SunoResponse<T> {
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> SunoResponse<T> {
    pub fn accepted(&self) -> bool {
        self.code.eq_ignore_ascii_case("success")
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SunoTask {
    pub task_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fail_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub submit_time: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_time: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl SunoTask {
    pub fn is_terminal(&self) -> bool {
        matches!(self.status.as_deref(), Some("SUCCESS") | Some("FAILURE"))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FetchRequest {
    pub ids: Vec<String>,
}
