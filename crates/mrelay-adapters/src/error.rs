use mrelay_protocol::ErrorEnvelope;
use mrelay_storage::StatusCodeMapping;

pub type RelayResult<T> = Result<T, RelayError>;

/// Error taxonomy carried by every relay failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayErrorKind {
    InvalidRequest,
    Unauthorized,
    Forbidden,
    QuotaExceeded,
    NoAvailableChannel,
    RateLimited,
    /// Network error, 429 or 5xx: try another channel.
    UpstreamTransient,
    /// Non-retriable upstream 4xx: surface as-is.
    UpstreamFatal,
    /// Credential revoked upstream: auto-disable the channel, then retry.
    UpstreamAuthDead,
    /// Client disconnect or stream inactivity: settle with observed usage.
    StreamAborted,
    Internal,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct RelayError {
    pub kind: RelayErrorKind,
    pub message: String,
    pub upstream_status: Option<u16>,
    /// Provider error body passed through to the client where safe.
    pub provider_error: Option<serde_json::Value>,
}

impl RelayError {
    pub fn new(kind: RelayErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            upstream_status: None,
            provider_error: None,
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(RelayErrorKind::InvalidRequest, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(RelayErrorKind::Unauthorized, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(RelayErrorKind::Forbidden, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(RelayErrorKind::Internal, message)
    }

    pub fn upstream_transient(message: impl Into<String>) -> Self {
        Self::new(RelayErrorKind::UpstreamTransient, message)
    }

    pub fn with_upstream_status(mut self, status: u16) -> Self {
        self.upstream_status = Some(status);
        self
    }

    pub fn with_provider_error(mut self, body: serde_json::Value) -> Self {
        self.provider_error = Some(body);
        self
    }

    pub fn is_retriable(&self) -> bool {
        matches!(
            self.kind,
            RelayErrorKind::UpstreamTransient | RelayErrorKind::UpstreamAuthDead
        )
    }

    pub fn should_disable_channel(&self) -> bool {
        self.kind == RelayErrorKind::UpstreamAuthDead
    }

    /// Status presented to the client. Upstream fatal errors keep the
    /// provider status so 4xx semantics survive the relay.
    pub fn http_status(&self) -> u16 {
        match self.kind {
            RelayErrorKind::InvalidRequest => 400,
            RelayErrorKind::Unauthorized => 401,
            RelayErrorKind::QuotaExceeded => 402,
            RelayErrorKind::Forbidden => 403,
            RelayErrorKind::RateLimited => 429,
            RelayErrorKind::NoAvailableChannel => 503,
            RelayErrorKind::UpstreamTransient => 502,
            RelayErrorKind::UpstreamFatal => self.upstream_status.unwrap_or(502),
            RelayErrorKind::UpstreamAuthDead => 502,
            RelayErrorKind::StreamAborted => 408,
            RelayErrorKind::Internal => 500,
        }
    }

    pub fn kind_str(&self) -> &'static str {
        match self.kind {
            RelayErrorKind::InvalidRequest => "invalid_request_error",
            RelayErrorKind::Unauthorized => "authentication_error",
            RelayErrorKind::Forbidden => "permission_error",
            RelayErrorKind::QuotaExceeded => "insufficient_quota",
            RelayErrorKind::NoAvailableChannel => "no_available_channel",
            RelayErrorKind::RateLimited => "rate_limit_error",
            RelayErrorKind::UpstreamTransient | RelayErrorKind::UpstreamAuthDead => {
                "upstream_error"
            }
            RelayErrorKind::UpstreamFatal => "upstream_error",
            RelayErrorKind::StreamAborted => "stream_aborted",
            RelayErrorKind::Internal => "api_error",
        }
    }

    pub fn to_envelope(&self) -> ErrorEnvelope {
        if let Some(body) = &self.provider_error {
            if let Ok(envelope) = serde_json::from_value::<ErrorEnvelope>(body.clone()) {
                return envelope;
            }
        }
        ErrorEnvelope::new(self.message.clone(), self.kind_str())
    }
}

const DEFAULT_RETRY: [u16; 1] = [429];
const DEFAULT_DISABLE: [u16; 2] = [401, 403];

/// Markers in upstream error bodies that mean the credential itself is dead,
/// regardless of the status code.
const AUTH_DEAD_MARKERS: [&str; 6] = [
    "api key not valid",
    "incorrect api key",
    "account_deactivated",
    "invalid_api_key",
    "organization has been disabled",
    "permission_denied_error",
];

/// Classify an upstream HTTP failure, honouring the channel's
/// `status_code_mapping` overrides before the defaults.
pub fn classify_upstream_failure(
    status: u16,
    body: &[u8],
    mapping: Option<&StatusCodeMapping>,
) -> RelayError {
    let text = String::from_utf8_lossy(body);
    let provider_error = serde_json::from_slice::<serde_json::Value>(body).ok();
    let message = provider_error
        .as_ref()
        .and_then(|value| value.pointer("/error/message"))
        .and_then(serde_json::Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| format!("upstream returned status {status}"));

    let mut kind = if let Some(mapping) = mapping {
        if mapping.disable.contains(&status) {
            RelayErrorKind::UpstreamAuthDead
        } else if mapping.retry.contains(&status) {
            RelayErrorKind::UpstreamTransient
        } else {
            default_kind_for(status)
        }
    } else {
        default_kind_for(status)
    };

    if kind != RelayErrorKind::UpstreamTransient {
        let lowered = text.to_lowercase();
        if AUTH_DEAD_MARKERS
            .iter()
            .any(|marker| lowered.contains(marker))
        {
            kind = RelayErrorKind::UpstreamAuthDead;
        }
    }

    let mut error = RelayError::new(kind, message).with_upstream_status(status);
    if let Some(body) = provider_error {
        error = error.with_provider_error(body);
    }
    error
}

fn default_kind_for(status: u16) -> RelayErrorKind {
    if DEFAULT_RETRY.contains(&status) || status >= 500 {
        RelayErrorKind::UpstreamTransient
    } else if DEFAULT_DISABLE.contains(&status) {
        RelayErrorKind::UpstreamAuthDead
    } else {
        RelayErrorKind::UpstreamFatal
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_classification() {
        assert_eq!(
            classify_upstream_failure(503, b"", None).kind,
            RelayErrorKind::UpstreamTransient
        );
        assert_eq!(
            classify_upstream_failure(429, b"", None).kind,
            RelayErrorKind::UpstreamTransient
        );
        assert_eq!(
            classify_upstream_failure(401, b"", None).kind,
            RelayErrorKind::UpstreamAuthDead
        );
        assert_eq!(
            classify_upstream_failure(404, b"", None).kind,
            RelayErrorKind::UpstreamFatal
        );
    }

    #[test]
    fn channel_mapping_overrides_defaults() {
        let mapping = StatusCodeMapping {
            retry: vec![404],
            disable: vec![418],
        };
        assert_eq!(
            classify_upstream_failure(404, b"", Some(&mapping)).kind,
            RelayErrorKind::UpstreamTransient
        );
        assert_eq!(
            classify_upstream_failure(418, b"", Some(&mapping)).kind,
            RelayErrorKind::UpstreamAuthDead
        );
    }

    #[test]
    fn revoked_key_body_marks_auth_dead() {
        let body = br#"{"error":{"message":"Incorrect API key provided","type":"invalid_request_error"}}"#;
        let error = classify_upstream_failure(400, body, None);
        assert_eq!(error.kind, RelayErrorKind::UpstreamAuthDead);
        assert!(error.message.contains("Incorrect API key"));
    }

    #[test]
    fn provider_envelope_passes_through() {
        let body = br#"{"error":{"message":"boom","type":"server_error"}}"#;
        let error = classify_upstream_failure(500, body, None);
        let envelope = error.to_envelope();
        assert_eq!(envelope.error.message, "boom");
        assert_eq!(envelope.error.kind, "server_error");
    }
}
