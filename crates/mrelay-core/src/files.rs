//! File / media relay: push client media to the upstream provider's file
//! API (Gemini Files) and hand back the URI plus the channel that served it,
//! so follow-up requests can pin the same credential.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use mrelay_adapters::{default_base_url, gemini, RelayError, RelayErrorKind, RelayResult};
use mrelay_storage::{ChannelRow, ChannelType};
use tokio::sync::Semaphore;

use crate::auth::{resolve_group, AuthedRequest};
use crate::state::AppState;

const FILE_ROUTING_MODEL: &str = "gemini-2.0-flash";

/// Pick the channel that will own the uploaded file. Pinned channels win;
/// otherwise regular ability selection runs for the file routing model.
fn select_file_channel(state: &AppState, authed: &AuthedRequest) -> RelayResult<ChannelRow> {
    let group = resolve_group(&authed.user);
    if let Some(channel_id) = authed.specific_channel_id {
        return state.abilities.get_by_id(channel_id).ok_or_else(|| {
            RelayError::invalid_request(format!("pinned channel {channel_id} not found"))
        });
    }
    state
        .abilities
        .select(&group, FILE_ROUTING_MODEL, 0, &HashSet::new())
        .map_err(|_| {
            RelayError::new(
                RelayErrorKind::NoAvailableChannel,
                "no gemini channel available for file upload",
            )
        })
}

fn channel_credentials(channel: &ChannelRow) -> RelayResult<(String, String)> {
    if channel.kind != ChannelType::Gemini {
        return Err(RelayError::invalid_request(
            "file uploads require a gemini channel",
        ));
    }
    let key = channel
        .keys()
        .first()
        .map(|key| key.to_string())
        .ok_or_else(|| RelayError::internal("channel has no credential"))?;
    let base = if channel.base_url.is_empty() {
        default_base_url(channel.kind).to_string()
    } else {
        channel.base_url.clone()
    };
    Ok((base, key))
}

/// Reject paths outside the configured allow-listed directory. Paths are
/// canonicalised first so `..` segments cannot escape.
fn validate_local_path(allowed_dir: &str, requested: &str) -> RelayResult<PathBuf> {
    let allowed = Path::new(allowed_dir)
        .canonicalize()
        .map_err(|err| RelayError::internal(format!("upload dir unavailable: {err}")))?;
    let path = Path::new(requested).canonicalize().map_err(|_| {
        RelayError::invalid_request(format!("local file '{requested}' not found"))
    })?;
    if !path.starts_with(&allowed) {
        return Err(RelayError::forbidden(format!(
            "access to path '{requested}' is not allowed"
        )));
    }
    Ok(path)
}

fn guess_mime(filename: &str) -> &'static str {
    match Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_lowercase)
        .as_deref()
    {
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("mp4") => "video/mp4",
        Some("mov") => "video/quicktime",
        Some("mp3") => "audio/mpeg",
        Some("wav") => "audio/wav",
        Some("pdf") => "application/pdf",
        Some("txt") => "text/plain",
        _ => "application/octet-stream",
    }
}

fn file_response(file: &gemini::GeminiFile, channel_id: i64) -> serde_json::Value {
    serde_json::json!({
        "uri": file.uri,
        "file": {
            "name": file.name,
            "display_name": file.display_name,
            "mime_type": file.mime_type,
            "size_bytes": file.size_bytes,
            "create_time": file.create_time,
            "expiration_time": file.expiration_time,
            "sha256_hash": file.sha256_hash,
            "uri": file.uri,
            "state": file.state,
        },
        "channel_id": channel_id,
    })
}

/// `POST /api/file/upload` — read a server-local file from the allow-listed
/// directory and push it upstream.
pub async fn upload_local_file(
    state: &Arc<AppState>,
    authed: &AuthedRequest,
    local_path: &str,
) -> RelayResult<serde_json::Value> {
    let global = state.global.load_full();
    let allowed_dir = global
        .file_upload_dir
        .as_deref()
        .ok_or_else(|| RelayError::forbidden("local file uploads are not configured"))?;
    let path = validate_local_path(allowed_dir, local_path)?;
    let filename = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("upload")
        .to_string();
    let data = tokio::fs::read(&path)
        .await
        .map_err(|err| RelayError::internal(format!("reading '{local_path}' failed: {err}")))?;

    let channel = select_file_channel(state, authed)?;
    let (base, key) = channel_credentials(&channel)?;
    let file = gemini::upload_file(
        &base,
        &key,
        channel.setting.proxy.as_deref(),
        &filename,
        guess_mime(&filename),
        Bytes::from(data),
    )
    .await?;
    Ok(file_response(&file, channel.id))
}

/// `POST /v1/files` — multipart body upload.
pub async fn upload_bytes(
    state: &Arc<AppState>,
    authed: &AuthedRequest,
    filename: &str,
    content_type: Option<&str>,
    data: Bytes,
) -> RelayResult<serde_json::Value> {
    let channel = select_file_channel(state, authed)?;
    let (base, key) = channel_credentials(&channel)?;
    let mime = content_type.unwrap_or_else(|| guess_mime(filename));
    let file = gemini::upload_file(
        &base,
        &key,
        channel.setting.proxy.as_deref(),
        filename,
        mime,
        data,
    )
    .await?;
    Ok(file_response(&file, channel.id))
}

/// `POST /v1/files/batch-upload` — all files share one channel; uploads run
/// under a bounded concurrency pool.
pub async fn batch_upload(
    state: &Arc<AppState>,
    authed: &AuthedRequest,
    local_paths: Vec<String>,
) -> RelayResult<serde_json::Value> {
    let global = state.global.load_full();
    let allowed_dir = global
        .file_upload_dir
        .clone()
        .ok_or_else(|| RelayError::forbidden("local file uploads are not configured"))?;

    // Validate everything up front; one bad path fails the whole batch
    // before any upload starts.
    let mut validated = Vec::with_capacity(local_paths.len());
    for requested in &local_paths {
        if requested.is_empty() {
            continue;
        }
        validated.push((requested.clone(), validate_local_path(&allowed_dir, requested)?));
    }

    let channel = select_file_channel(state, authed)?;
    let (base, key) = channel_credentials(&channel)?;
    let proxy = channel.setting.proxy.clone();
    let semaphore = Arc::new(Semaphore::new(global.file_upload_concurrency.max(1)));

    let mut handles = Vec::with_capacity(validated.len());
    for (requested, path) in validated {
        let semaphore = semaphore.clone();
        let base = base.clone();
        let key = key.clone();
        let proxy = proxy.clone();
        handles.push(tokio::spawn(async move {
            let _permit = semaphore.acquire().await;
            let filename = path
                .file_name()
                .and_then(|name| name.to_str())
                .unwrap_or("upload")
                .to_string();
            let result = match tokio::fs::read(&path).await {
                Ok(data) => {
                    gemini::upload_file(
                        &base,
                        &key,
                        proxy.as_deref(),
                        &filename,
                        guess_mime(&filename),
                        Bytes::from(data),
                    )
                    .await
                }
                Err(err) => Err(RelayError::internal(format!("read failed: {err}"))),
            };
            (requested, result)
        }));
    }

    let mut results = Vec::with_capacity(handles.len());
    for handle in handles {
        let (requested, result) = handle
            .await
            .map_err(|err| RelayError::internal(format!("upload task panicked: {err}")))?;
        results.push(match result {
            Ok(file) => serde_json::json!({
                "original_path": requested,
                "success": true,
                "file": file_response(&file, channel.id)["file"],
            }),
            Err(err) => serde_json::json!({
                "original_path": requested,
                "success": false,
                "error": err.message,
            }),
        });
    }

    Ok(serde_json::json!({
        "channel_id": channel.id,
        "results": results,
    }))
}

/// `POST /v1/files/batch-status` — per-file state keyed by `files/<id>`.
pub async fn batch_status(
    state: &Arc<AppState>,
    authed: &AuthedRequest,
    file_names: Vec<String>,
) -> RelayResult<serde_json::Value> {
    let channel = select_file_channel(state, authed)?;
    let (base, key) = channel_credentials(&channel)?;
    let proxy = channel.setting.proxy.clone();
    let global = state.global.load_full();
    let semaphore = Arc::new(Semaphore::new(global.file_upload_concurrency.max(1)));

    let mut handles = Vec::new();
    for name in file_names.into_iter().filter(|name| !name.is_empty()) {
        let semaphore = semaphore.clone();
        let base = base.clone();
        let key = key.clone();
        let proxy = proxy.clone();
        handles.push(tokio::spawn(async move {
            let _permit = semaphore.acquire().await;
            let result = gemini::get_file(&base, &key, proxy.as_deref(), &name).await;
            (name, result)
        }));
    }

    let mut results = serde_json::Map::new();
    for handle in handles {
        let (name, result) = handle
            .await
            .map_err(|err| RelayError::internal(format!("status task panicked: {err}")))?;
        let entry = match result {
            Ok(file) => serde_json::json!({"file": file_response(&file, channel.id)["file"]}),
            Err(err) => serde_json::json!({"error": err.message}),
        };
        results.insert(name, entry);
    }

    Ok(serde_json::json!({"results": results}))
}
