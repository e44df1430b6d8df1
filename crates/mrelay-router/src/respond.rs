use std::convert::Infallible;

use axum::body::Body;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use futures_util::stream;
use mrelay_core::{ClientDialect, RelayResponse};
use mrelay_adapters::RelayError;
use mrelay_protocol::claude::ClaudeErrorEnvelope;

pub fn into_http_response(relayed: RelayResponse) -> Response {
    match relayed {
        RelayResponse::Json(body) => json_response(StatusCode::OK, &body),
        RelayResponse::Binary { content_type, body } => {
            let mut response = Response::new(Body::from(body));
            if let Ok(value) = HeaderValue::from_str(&content_type) {
                response.headers_mut().insert(header::CONTENT_TYPE, value);
            }
            response
        }
        RelayResponse::Stream { rx, content_type } => {
            let body = Body::from_stream(stream::unfold(rx, |mut rx| async move {
                rx.recv()
                    .await
                    .map(|frame| (Ok::<Bytes, Infallible>(frame), rx))
            }));
            let mut response = Response::new(body);
            response
                .headers_mut()
                .insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
            response
                .headers_mut()
                .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
            response
        }
    }
}

/// Error envelope in the dialect the client speaks.
pub fn error_response(error: &RelayError, dialect: ClientDialect) -> Response {
    let status =
        StatusCode::from_u16(error.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = match dialect {
        ClientDialect::OpenAi => serde_json::to_value(error.to_envelope()).unwrap_or_default(),
        ClientDialect::Claude => {
            serde_json::to_value(ClaudeErrorEnvelope::new(error.kind_str(), &error.message))
                .unwrap_or_default()
        }
    };
    json_response(status, &body)
}

pub fn json_response(status: StatusCode, body: &serde_json::Value) -> Response {
    let bytes = serde_json::to_vec(body).unwrap_or_else(|_| b"{}".to_vec());
    let mut response = Response::new(Body::from(bytes));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    response
}
