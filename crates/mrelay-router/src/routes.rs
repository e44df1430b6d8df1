use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Multipart, Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;

use mrelay_adapters::{RelayError, RelayRequest};
use mrelay_core::{authenticate, relay, AppState, AuthedRequest, ClientDialect};
use mrelay_protocol::claude::MessagesRequest;
use mrelay_protocol::midjourney::SubmitRequest;
use mrelay_protocol::openai::audio::SpeechRequest;
use mrelay_protocol::openai::chat::ChatCompletionRequest;
use mrelay_protocol::openai::completion::CompletionRequest;
use mrelay_protocol::openai::embedding::EmbeddingRequest;
use mrelay_protocol::openai::image::ImageRequest;
use mrelay_protocol::openai::moderation::ModerationRequest;
use mrelay_storage::TaskPlatform;

use crate::respond::{error_response, into_http_response, json_response};

pub fn relay_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/completions", post(completions))
        .route("/v1/embeddings", post(embeddings))
        .route("/v1/images/generations", post(images_generations))
        .route("/v1/audio/speech", post(audio_speech))
        .route("/v1/audio/transcriptions", post(audio_transcriptions))
        .route("/v1/audio/translations", post(audio_translations))
        .route("/v1/moderations", post(moderations))
        .route("/v1/messages", post(claude_messages))
        .route("/v1/models", get(list_models))
        .route("/mj/submit/{action}", post(mj_submit))
        .route("/mj/task/{id}/fetch", get(mj_fetch))
        .route("/mj/task/list", get(mj_list))
        .route("/suno/submit/{action}", post(suno_submit))
        .route("/suno/fetch", post(suno_fetch_many))
        .route("/suno/fetch/{id}", get(suno_fetch))
        .route("/v1/files", post(files_upload))
        .route("/api/file/upload", post(file_upload_local))
        .route("/v1/files/batch-upload", post(files_batch_upload))
        .route("/v1/files/batch-status", post(files_batch_status))
        .with_state(state)
}

async fn auth_or_reject(
    state: &Arc<AppState>,
    headers: &HeaderMap,
    dialect: ClientDialect,
) -> Result<AuthedRequest, Response> {
    authenticate(&state.ledger, headers)
        .await
        .map_err(|err| error_response(&err, dialect))
}

fn parse_json<T: serde::de::DeserializeOwned>(
    body: &Bytes,
    dialect: ClientDialect,
) -> Result<T, Response> {
    serde_json::from_slice(body).map_err(|err| {
        error_response(
            &RelayError::invalid_request(format!("invalid request body: {err}")),
            dialect,
        )
    })
}

async fn run_relay(
    state: Arc<AppState>,
    authed: AuthedRequest,
    request: RelayRequest,
    dialect: ClientDialect,
) -> Response {
    match relay(state, authed, request, dialect).await {
        Ok(response) => into_http_response(response),
        Err(err) => error_response(&err, dialect),
    }
}

async fn chat_completions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let dialect = ClientDialect::OpenAi;
    let authed = match auth_or_reject(&state, &headers, dialect).await {
        Ok(authed) => authed,
        Err(response) => return response,
    };
    let request: ChatCompletionRequest = match parse_json(&body, dialect) {
        Ok(request) => request,
        Err(response) => return response,
    };
    run_relay(state, authed, RelayRequest::Chat(request), dialect).await
}

async fn completions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let dialect = ClientDialect::OpenAi;
    let authed = match auth_or_reject(&state, &headers, dialect).await {
        Ok(authed) => authed,
        Err(response) => return response,
    };
    let request: CompletionRequest = match parse_json(&body, dialect) {
        Ok(request) => request,
        Err(response) => return response,
    };
    run_relay(state, authed, RelayRequest::Completion(request), dialect).await
}

async fn embeddings(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let dialect = ClientDialect::OpenAi;
    let authed = match auth_or_reject(&state, &headers, dialect).await {
        Ok(authed) => authed,
        Err(response) => return response,
    };
    let request: EmbeddingRequest = match parse_json(&body, dialect) {
        Ok(request) => request,
        Err(response) => return response,
    };
    run_relay(state, authed, RelayRequest::Embedding(request), dialect).await
}

async fn images_generations(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let dialect = ClientDialect::OpenAi;
    let authed = match auth_or_reject(&state, &headers, dialect).await {
        Ok(authed) => authed,
        Err(response) => return response,
    };
    let request: ImageRequest = match parse_json(&body, dialect) {
        Ok(request) => request,
        Err(response) => return response,
    };
    run_relay(state, authed, RelayRequest::Image(request), dialect).await
}

async fn audio_speech(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let dialect = ClientDialect::OpenAi;
    let authed = match auth_or_reject(&state, &headers, dialect).await {
        Ok(authed) => authed,
        Err(response) => return response,
    };
    let request: SpeechRequest = match parse_json(&body, dialect) {
        Ok(request) => request,
        Err(response) => return response,
    };
    run_relay(state, authed, RelayRequest::Speech(request), dialect).await
}

async fn audio_transcriptions(
    state: State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    audio_upload(state, headers, body).await
}

async fn audio_translations(
    state: State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    audio_upload(state, headers, body).await
}

/// Multipart audio bodies are relayed verbatim; only the `model` field is
/// read out of the form for routing and billing.
async fn audio_upload(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let dialect = ClientDialect::OpenAi;
    let authed = match auth_or_reject(&state, &headers, dialect).await {
        Ok(authed) => authed,
        Err(response) => return response,
    };
    let content_type = headers
        .get(http::header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("application/octet-stream")
        .to_string();
    let model =
        scan_multipart_field(&body, "model").unwrap_or_else(|| "whisper-1".to_string());
    run_relay(
        state,
        authed,
        RelayRequest::AudioUpload {
            model,
            content_type,
            body,
        },
        dialect,
    )
    .await
}

async fn moderations(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let dialect = ClientDialect::OpenAi;
    let authed = match auth_or_reject(&state, &headers, dialect).await {
        Ok(authed) => authed,
        Err(response) => return response,
    };
    let request: ModerationRequest = match parse_json(&body, dialect) {
        Ok(request) => request,
        Err(response) => return response,
    };
    run_relay(state, authed, RelayRequest::Moderation(request), dialect).await
}

async fn claude_messages(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let dialect = ClientDialect::Claude;
    let authed = match auth_or_reject(&state, &headers, dialect).await {
        Ok(authed) => authed,
        Err(response) => return response,
    };
    let request: MessagesRequest = match parse_json(&body, dialect) {
        Ok(request) => request,
        Err(response) => return response,
    };
    run_relay(state, authed, RelayRequest::ClaudeMessages(request), dialect).await
}

async fn list_models(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Response {
    let dialect = ClientDialect::OpenAi;
    let authed = match auth_or_reject(&state, &headers, dialect).await {
        Ok(authed) => authed,
        Err(response) => return response,
    };
    let group = mrelay_core::resolve_group(&authed.user);
    let models: Vec<serde_json::Value> = state
        .abilities
        .models_for_group(&group)
        .into_iter()
        .filter(|model| authed.token.allows_model(model))
        .map(|model| {
            serde_json::json!({
                "id": model,
                "object": "model",
                "owned_by": "mrelay",
            })
        })
        .collect();
    json_response(
        StatusCode::OK,
        &serde_json::json!({"object": "list", "data": models}),
    )
}

// ---------------------------------------------------------------------------
// Midjourney / Suno task surface

fn mj_error(message: &str) -> Response {
    json_response(
        StatusCode::OK,
        &serde_json::json!({"code": -1, "description": message, "result": null}),
    )
}

async fn mj_submit(
    State(state): State<Arc<AppState>>,
    Path(action): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let authed = match authenticate(&state.ledger, &headers).await {
        Ok(authed) => authed,
        Err(err) => return mj_error(&err.message),
    };
    let request: SubmitRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(err) => return mj_error(&format!("invalid request body: {err}")),
    };
    match relay(
        state,
        authed,
        RelayRequest::MjSubmit {
            action,
            body: request,
        },
        ClientDialect::OpenAi,
    )
    .await
    {
        Ok(response) => into_http_response(response),
        Err(err) => mj_error(&err.message),
    }
}

async fn mj_fetch(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    let authed = match authenticate(&state.ledger, &headers).await {
        Ok(authed) => authed,
        Err(err) => return mj_error(&err.message),
    };
    match mrelay_tasks::get_task(
        &state,
        TaskPlatform::Midjourney,
        &id,
        authed.user.id,
        authed.user.is_admin(),
    )
    .await
    {
        Ok(task) => {
            let data = serde_json::from_str::<serde_json::Value>(&task.data)
                .unwrap_or(serde_json::json!({"id": task.task_id}));
            json_response(StatusCode::OK, &data)
        }
        Err(err) => mj_error(&err.message),
    }
}

#[derive(Debug, Default, Deserialize)]
struct TaskListQuery {
    limit: Option<u64>,
}

async fn mj_list(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TaskListQuery>,
    headers: HeaderMap,
) -> Response {
    let authed = match authenticate(&state.ledger, &headers).await {
        Ok(authed) => authed,
        Err(err) => return mj_error(&err.message),
    };
    match mrelay_tasks::list_tasks(
        &state,
        TaskPlatform::Midjourney,
        authed.user.id,
        query.limit,
    )
    .await
    {
        Ok(tasks) => {
            let data: Vec<serde_json::Value> = tasks
                .iter()
                .map(|task| {
                    serde_json::from_str(&task.data)
                        .unwrap_or(serde_json::json!({"id": task.task_id}))
                })
                .collect();
            json_response(StatusCode::OK, &serde_json::Value::Array(data))
        }
        Err(err) => mj_error(&err.message),
    }
}

fn suno_error(message: &str) -> Response {
    json_response(
        StatusCode::OK,
        &serde_json::json!({"code": "error", "message": message, "data": null}),
    )
}

async fn suno_submit(
    State(state): State<Arc<AppState>>,
    Path(action): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let authed = match authenticate(&state.ledger, &headers).await {
        Ok(authed) => authed,
        Err(err) => return suno_error(&err.message),
    };
    let request: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(err) => return suno_error(&format!("invalid request body: {err}")),
    };
    match relay(
        state,
        authed,
        RelayRequest::SunoSubmit {
            action,
            body: request,
        },
        ClientDialect::OpenAi,
    )
    .await
    {
        Ok(response) => into_http_response(response),
        Err(err) => suno_error(&err.message),
    }
}

async fn suno_fetch(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    let authed = match authenticate(&state.ledger, &headers).await {
        Ok(authed) => authed,
        Err(err) => return suno_error(&err.message),
    };
    match mrelay_tasks::get_task(
        &state,
        TaskPlatform::Suno,
        &id,
        authed.user.id,
        authed.user.is_admin(),
    )
    .await
    {
        Ok(task) => {
            let data = serde_json::from_str::<serde_json::Value>(&task.data)
                .unwrap_or(serde_json::json!({"task_id": task.task_id}));
            json_response(
                StatusCode::OK,
                &serde_json::json!({"code": "success", "data": data}),
            )
        }
        Err(err) => suno_error(&err.message),
    }
}

#[derive(Debug, Deserialize)]
struct SunoFetchManyRequest {
    #[serde(default)]
    ids: Vec<String>,
}

async fn suno_fetch_many(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let authed = match authenticate(&state.ledger, &headers).await {
        Ok(authed) => authed,
        Err(err) => return suno_error(&err.message),
    };
    let request: SunoFetchManyRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(err) => return suno_error(&format!("invalid request body: {err}")),
    };
    let mut data = Vec::with_capacity(request.ids.len());
    for id in request.ids {
        match mrelay_tasks::get_task(
            &state,
            TaskPlatform::Suno,
            &id,
            authed.user.id,
            authed.user.is_admin(),
        )
        .await
        {
            Ok(task) => data.push(
                serde_json::from_str::<serde_json::Value>(&task.data)
                    .unwrap_or(serde_json::json!({"task_id": task.task_id})),
            ),
            Err(err) => return suno_error(&err.message),
        }
    }
    json_response(
        StatusCode::OK,
        &serde_json::json!({"code": "success", "data": data}),
    )
}

// ---------------------------------------------------------------------------
// File / media relay

async fn files_upload(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Response {
    let dialect = ClientDialect::OpenAi;
    let authed = match auth_or_reject(&state, &headers, dialect).await {
        Ok(authed) => authed,
        Err(response) => return response,
    };
    while let Ok(Some(field)) = multipart.next_field().await {
        if field.name() != Some("file") {
            continue;
        }
        let filename = field
            .file_name()
            .unwrap_or("upload")
            .to_string();
        let content_type = field.content_type().map(str::to_string);
        let data = match field.bytes().await {
            Ok(data) => data,
            Err(err) => {
                return error_response(
                    &RelayError::invalid_request(format!("reading upload failed: {err}")),
                    dialect,
                )
            }
        };
        return match mrelay_core::files::upload_bytes(
            &state,
            &authed,
            &filename,
            content_type.as_deref(),
            data,
        )
        .await
        {
            Ok(body) => json_response(StatusCode::OK, &body),
            Err(err) => error_response(&err, dialect),
        };
    }
    error_response(
        &RelayError::invalid_request("multipart body has no 'file' field"),
        dialect,
    )
}

#[derive(Debug, Deserialize)]
struct LocalUploadRequest {
    local_path: String,
}

async fn file_upload_local(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let dialect = ClientDialect::OpenAi;
    let authed = match auth_or_reject(&state, &headers, dialect).await {
        Ok(authed) => authed,
        Err(response) => return response,
    };
    let request: LocalUploadRequest = match parse_json(&body, dialect) {
        Ok(request) => request,
        Err(response) => return response,
    };
    match mrelay_core::files::upload_local_file(&state, &authed, &request.local_path).await {
        Ok(body) => json_response(StatusCode::OK, &body),
        Err(err) => error_response(&err, dialect),
    }
}

#[derive(Debug, Deserialize)]
struct BatchUploadRequest {
    local_paths: Vec<String>,
}

async fn files_batch_upload(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let dialect = ClientDialect::OpenAi;
    let authed = match auth_or_reject(&state, &headers, dialect).await {
        Ok(authed) => authed,
        Err(response) => return response,
    };
    let request: BatchUploadRequest = match parse_json(&body, dialect) {
        Ok(request) => request,
        Err(response) => return response,
    };
    if request.local_paths.is_empty() {
        return error_response(
            &RelayError::invalid_request("'local_paths' must not be empty"),
            dialect,
        );
    }
    match mrelay_core::files::batch_upload(&state, &authed, request.local_paths).await {
        Ok(body) => json_response(StatusCode::OK, &body),
        Err(err) => error_response(&err, dialect),
    }
}

#[derive(Debug, Deserialize)]
struct BatchStatusRequest {
    file_names: Vec<String>,
}

async fn files_batch_status(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let dialect = ClientDialect::OpenAi;
    let authed = match auth_or_reject(&state, &headers, dialect).await {
        Ok(authed) => authed,
        Err(response) => return response,
    };
    let request: BatchStatusRequest = match parse_json(&body, dialect) {
        Ok(request) => request,
        Err(response) => return response,
    };
    if request.file_names.is_empty() {
        return error_response(
            &RelayError::invalid_request("'file_names' must not be empty"),
            dialect,
        );
    }
    match mrelay_core::files::batch_status(&state, &authed, request.file_names).await {
        Ok(body) => json_response(StatusCode::OK, &body),
        Err(err) => error_response(&err, dialect),
    }
}

/// Pull one form field's value out of a raw multipart body without consuming
/// it; the body itself is relayed verbatim.
fn scan_multipart_field(body: &Bytes, field: &str) -> Option<String> {
    let text = String::from_utf8_lossy(body);
    let marker = format!("name=\"{field}\"");
    let start = text.find(&marker)?;
    let rest = &text[start + marker.len()..];
    let value_start = rest.find("\r\n\r\n").map(|pos| pos + 4)?;
    let rest = &rest[value_start..];
    let value_end = rest.find('\r').unwrap_or(rest.len());
    let value = rest[..value_end].trim();
    (!value.is_empty()).then(|| value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multipart_scan_finds_model() {
        let body = Bytes::from_static(
            b"--x\r\nContent-Disposition: form-data; name=\"model\"\r\n\r\nwhisper-1\r\n--x\r\nContent-Disposition: form-data; name=\"file\"; filename=\"a.mp3\"\r\n\r\nbinary\r\n--x--\r\n",
        );
        assert_eq!(
            scan_multipart_field(&body, "model").as_deref(),
            Some("whisper-1")
        );
        assert!(scan_multipart_field(&body, "language").is_none());
    }
}
