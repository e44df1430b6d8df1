use std::collections::VecDeque;

use async_trait::async_trait;
use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::HeaderMap;
use mrelay_protocol::openai::Usage;
use mrelay_protocol::sse::{SseDecoder, SseEvent};

use crate::client::client_for_proxy;
use crate::error::{classify_upstream_failure, RelayError, RelayErrorKind, RelayResult};
use crate::info::{RelayInfo, RelayRequest};

/// Provider-native payload produced by `convert_request`.
#[derive(Debug, Clone)]
pub struct ConvertedRequest {
    pub body: Bytes,
    pub content_type: String,
}

impl ConvertedRequest {
    pub fn json(body: Bytes) -> Self {
        Self {
            body,
            content_type: "application/json".to_string(),
        }
    }
}

/// A finished adapter exchange: either a canonical JSON (or binary) body with
/// its usage, or a lazily-pulled canonical event stream.
pub enum AdapterOutput {
    Json {
        body: serde_json::Value,
        usage: Usage,
    },
    Binary {
        content_type: String,
        body: Bytes,
        usage: Usage,
    },
    Stream(Box<dyn RelayStream>),
}

/// Lazy sequence of canonical client frames produced by an adapter's stream
/// mapper. The pipeline pulls frames, enforces the inactivity timeout and
/// flushes them to the client; upstream order is preserved by construction.
#[async_trait]
pub trait RelayStream: Send {
    /// Next batch of client frames. `Ok(None)` means the upstream finished
    /// cleanly and `usage()` is final.
    async fn next_frames(&mut self) -> RelayResult<Option<Vec<Bytes>>>;

    /// Usage observed so far; final once the stream ends.
    fn usage(&self) -> Usage;

    /// Accumulated output text for estimator-based fallback billing when the
    /// provider never reports a usage block.
    fn fallback_text(&self) -> &str;
}

/// The common provider contract. One adapter instance serves one request;
/// `init` runs once after channel selection.
#[async_trait]
pub trait Adapter: Send + Sync {
    fn init(&mut self, info: &RelayInfo);

    /// Absolute provider URL for this request.
    fn get_url(&self, info: &RelayInfo) -> RelayResult<String>;

    /// Attach auth and provider-specific headers. Async because some
    /// providers mint derived tokens on a side channel first.
    async fn set_headers(&self, headers: &mut HeaderMap, info: &RelayInfo) -> RelayResult<()>;

    /// Canonical request -> provider-native payload, with the channel's
    /// model rename already applied via `info.upstream_model`.
    fn convert_request(
        &self,
        request: &RelayRequest,
        info: &RelayInfo,
    ) -> RelayResult<ConvertedRequest>;

    /// Dispatch the converted payload. The default builds a POST from
    /// `get_url`/`set_headers`/`convert_request` through the channel's proxy.
    async fn do_request(
        &self,
        request: &RelayRequest,
        info: &RelayInfo,
    ) -> RelayResult<wreq::Response> {
        let url = self.get_url(info)?;
        let converted = self.convert_request(request, info)?;
        let mut headers = HeaderMap::new();
        headers.insert(
            CONTENT_TYPE,
            converted
                .content_type
                .parse()
                .map_err(|_| RelayError::internal("invalid content type"))?,
        );
        self.set_headers(&mut headers, info).await?;
        let client = client_for_proxy(info.channel.setting.proxy.as_deref())?;
        client
            .post(url)
            .headers(headers)
            .body(converted.body)
            .send()
            .await
            .map_err(|err| {
                RelayError::upstream_transient(format!("upstream request failed: {err}"))
            })
    }

    /// Parse the upstream response into canonical shape. Non-2xx statuses
    /// never reach this method; `execute` classifies them first.
    async fn handle_response(
        &self,
        response: wreq::Response,
        info: &RelayInfo,
    ) -> RelayResult<AdapterOutput>;

    /// One full exchange: dispatch, classify failures against the channel's
    /// status-code overrides, parse. The routing loop only ever calls this.
    async fn execute(
        &self,
        request: &RelayRequest,
        info: &RelayInfo,
    ) -> RelayResult<AdapterOutput> {
        let response = self.do_request(request, info).await?;
        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            return Err(read_failure(response, info).await);
        }
        self.handle_response(response, info).await
    }
}

/// Drain a failed upstream response and classify it with the channel's
/// status-code overrides.
pub async fn read_failure(response: wreq::Response, info: &RelayInfo) -> RelayError {
    let status = response.status().as_u16();
    let body = response.bytes().await.unwrap_or_default();
    classify_upstream_failure(status, &body, info.channel.status_code_mapping.as_ref())
}

pub async fn read_json_body(response: wreq::Response) -> RelayResult<serde_json::Value> {
    let body = response.bytes().await.map_err(|err| {
        RelayError::upstream_transient(format!("reading upstream body failed: {err}"))
    })?;
    serde_json::from_slice(&body).map_err(|err| {
        RelayError::new(
            RelayErrorKind::UpstreamFatal,
            format!("upstream body is not valid json: {err}"),
        )
    })
}

/// Incremental SSE reader over an open upstream response.
pub struct SseUpstream {
    response: wreq::Response,
    decoder: SseDecoder,
    queue: VecDeque<SseEvent>,
    finished: bool,
}

impl SseUpstream {
    pub fn new(response: wreq::Response) -> Self {
        Self {
            response,
            decoder: SseDecoder::new(),
            queue: VecDeque::new(),
            finished: false,
        }
    }

    /// Next upstream event in arrival order; `None` at end of body.
    pub async fn next_event(&mut self) -> RelayResult<Option<SseEvent>> {
        loop {
            if let Some(event) = self.queue.pop_front() {
                return Ok(Some(event));
            }
            if self.finished {
                return Ok(None);
            }
            match self.response.chunk().await {
                Ok(Some(chunk)) => self.queue.extend(self.decoder.decode(&chunk)),
                Ok(None) => {
                    self.finished = true;
                    self.queue.extend(self.decoder.finish());
                }
                Err(err) => {
                    self.finished = true;
                    return Err(RelayError::new(
                        RelayErrorKind::StreamAborted,
                        format!("upstream stream failed: {err}"),
                    ));
                }
            }
        }
    }
}
