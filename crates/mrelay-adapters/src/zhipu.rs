//! Zhipu GLM adapter. Channel keys are `id.secret`; each request carries a
//! short-lived JWT minted from the secret and cached until near expiry.

use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::header::AUTHORIZATION;
use http::HeaderMap;
use jsonwebtoken::{encode, EncodingKey, Header};
use serde::Serialize;

use crate::adapter::{read_json_body, Adapter, AdapterOutput, ConvertedRequest};
use crate::auth_cache::UpstreamTokenCache;
use crate::error::{RelayError, RelayResult};
use crate::info::{RelayInfo, RelayMode, RelayRequest};
use crate::openai::{OpenAiAdapter, OpenAiStream};
use crate::adapter::SseUpstream;
use mrelay_protocol::openai::Usage;

const TOKEN_TTL: Duration = Duration::from_secs(300);

static TOKEN_CACHE: OnceLock<UpstreamTokenCache> = OnceLock::new();

fn token_cache() -> &'static UpstreamTokenCache {
    TOKEN_CACHE.get_or_init(UpstreamTokenCache::new)
}

#[derive(Debug, Serialize)]
struct ZhipuClaims {
    api_key: String,
    exp: u64,
    timestamp: u64,
}

fn mint_jwt(credential: &str) -> RelayResult<String> {
    let (id, secret) = credential
        .split_once('.')
        .ok_or_else(|| RelayError::invalid_request("zhipu channel key must be id.secret"))?;
    let now_ms = (time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as u64;
    let claims = ZhipuClaims {
        api_key: id.to_string(),
        exp: now_ms + TOKEN_TTL.as_millis() as u64,
        timestamp: now_ms,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|err| RelayError::internal(format!("zhipu jwt mint failed: {err}")))
}

/// GLM's v4 surface is OpenAI-shaped; only the URL and the bearer token
/// differ, so request/response conversion is delegated.
#[derive(Debug, Default)]
pub struct ZhipuAdapter {
    inner: OpenAiAdapter,
}

impl ZhipuAdapter {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Adapter for ZhipuAdapter {
    fn init(&mut self, _info: &RelayInfo) {}

    fn get_url(&self, info: &RelayInfo) -> RelayResult<String> {
        let base = info.base_url.trim_end_matches('/');
        match info.mode {
            RelayMode::ChatCompletions => Ok(format!("{base}/api/paas/v4/chat/completions")),
            RelayMode::Embeddings => Ok(format!("{base}/api/paas/v4/embeddings")),
            RelayMode::ImagesGenerations => Ok(format!("{base}/api/paas/v4/images/generations")),
            _ => Err(RelayError::invalid_request(
                "zhipu channels serve chat, embedding and image requests only",
            )),
        }
    }

    async fn set_headers(&self, headers: &mut HeaderMap, info: &RelayInfo) -> RelayResult<()> {
        let cache_key = info.api_key.clone();
        let credential = info.api_key.clone();
        let jwt = token_cache()
            .get_or_refresh(&cache_key, || async move {
                Ok((mint_jwt(&credential)?, TOKEN_TTL))
            })
            .await?;
        headers.insert(
            AUTHORIZATION,
            format!("Bearer {jwt}")
                .parse()
                .map_err(|_| RelayError::internal("jwt is not a valid header value"))?,
        );
        Ok(())
    }

    fn convert_request(
        &self,
        request: &RelayRequest,
        info: &RelayInfo,
    ) -> RelayResult<ConvertedRequest> {
        self.inner.convert_request(request, info)
    }

    async fn handle_response(
        &self,
        response: wreq::Response,
        info: &RelayInfo,
    ) -> RelayResult<AdapterOutput> {
        if info.is_stream {
            return Ok(AdapterOutput::Stream(Box::new(OpenAiStream::new(
                SseUpstream::new(response),
                info.origin_model.clone(),
            ))));
        }
        let mut body = read_json_body(response).await?;
        let usage = body
            .get("usage")
            .and_then(|value| serde_json::from_value::<Usage>(value.clone()).ok())
            .unwrap_or_default();
        info.rewrite_model(&mut body);
        Ok(AdapterOutput::Json { body, usage })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jwt_minting_requires_dotted_key() {
        assert!(mint_jwt("no-dot-here").is_err());
        let token = mint_jwt("my-id.my-secret").unwrap();
        // header.claims.signature
        assert_eq!(token.split('.').count(), 3);
    }
}
