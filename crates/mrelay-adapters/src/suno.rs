//! Suno adapter: music/lyrics submit plus the poller's fetch-many call.

use async_trait::async_trait;
use bytes::Bytes;
use http::header::AUTHORIZATION;
use http::HeaderMap;
use mrelay_protocol::openai::Usage;
use mrelay_protocol::suno::{FetchRequest, SunoResponse, SunoTask};

use crate::adapter::{read_json_body, Adapter, AdapterOutput, ConvertedRequest};
use crate::client::client_for_proxy;
use crate::error::{classify_upstream_failure, RelayError, RelayErrorKind, RelayResult};
use crate::info::{RelayInfo, RelayRequest};
use mrelay_storage::ChannelRow;

#[derive(Debug, Default)]
pub struct SunoAdapter;

impl SunoAdapter {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Adapter for SunoAdapter {
    fn init(&mut self, _info: &RelayInfo) {}

    fn get_url(&self, info: &RelayInfo) -> RelayResult<String> {
        let action = info
            .task_action
            .as_deref()
            .ok_or_else(|| RelayError::internal("suno submit without action"))?;
        Ok(format!(
            "{}/suno/submit/{action}",
            info.base_url.trim_end_matches('/')
        ))
    }

    async fn set_headers(&self, headers: &mut HeaderMap, info: &RelayInfo) -> RelayResult<()> {
        headers.insert(
            AUTHORIZATION,
            format!("Bearer {}", info.api_key)
                .parse()
                .map_err(|_| RelayError::internal("api key is not a valid header value"))?,
        );
        Ok(())
    }

    fn convert_request(
        &self,
        request: &RelayRequest,
        _info: &RelayInfo,
    ) -> RelayResult<ConvertedRequest> {
        let RelayRequest::SunoSubmit { body, .. } = request else {
            return Err(RelayError::internal("non-suno request on suno adapter"));
        };
        let body = serde_json::to_vec(body)
            .map_err(|err| RelayError::internal(format!("encode request: {err}")))?;
        Ok(ConvertedRequest::json(Bytes::from(body)))
    }

    async fn handle_response(
        &self,
        response: wreq::Response,
        _info: &RelayInfo,
    ) -> RelayResult<AdapterOutput> {
        let body = read_json_body(response).await?;
        let submit: SunoResponse<String> = serde_json::from_value(body.clone()).map_err(|err| {
            RelayError::new(
                RelayErrorKind::UpstreamFatal,
                format!("unexpected suno response: {err}"),
            )
        })?;
        if !submit.accepted() {
            return Err(RelayError::new(
                RelayErrorKind::UpstreamFatal,
                format!(
                    "suno submit rejected: {}",
                    submit.message.unwrap_or_default()
                ),
            )
            .with_provider_error(body));
        }
        Ok(AdapterOutput::Json {
            body,
            usage: Usage::default(),
        })
    }
}

pub async fn fetch_tasks(channel: &ChannelRow, ids: Vec<String>) -> RelayResult<Vec<SunoTask>> {
    let client = client_for_proxy(channel.setting.proxy.as_deref())?;
    let key = channel
        .keys()
        .first()
        .map(|key| key.to_string())
        .unwrap_or_default();
    let url = format!("{}/suno/fetch", channel.base_url.trim_end_matches('/'));
    let payload = serde_json::to_vec(&FetchRequest { ids })
        .map_err(|err| RelayError::internal(format!("encode fetch request: {err}")))?;
    let response = client
        .post(url)
        .header(AUTHORIZATION, format!("Bearer {key}"))
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(payload)
        .send()
        .await
        .map_err(|err| RelayError::upstream_transient(format!("suno fetch failed: {err}")))?;
    if !response.status().is_success() {
        let status = response.status().as_u16();
        let body = response.bytes().await.unwrap_or_default();
        return Err(classify_upstream_failure(status, &body, None));
    }
    let body = response
        .bytes()
        .await
        .map_err(|err| RelayError::upstream_transient(format!("suno fetch read failed: {err}")))?;
    let envelope: SunoResponse<Vec<SunoTask>> = serde_json::from_slice(&body).map_err(|err| {
        RelayError::new(
            RelayErrorKind::UpstreamFatal,
            format!("unexpected suno task list: {err}"),
        )
    })?;
    Ok(envelope.data.unwrap_or_default())
}
