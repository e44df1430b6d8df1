use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// `POST /v1/audio/speech` — text in, audio bytes out.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpeechRequest {
    pub model: String,
    pub input: String,
    pub voice: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_format: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Transcription and translation respond with this shape in `json` format;
/// other response formats are passed through verbatim.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TranscriptionResponse {
    pub text: String,
}
