//! Per-request orchestration: authenticate -> parse -> preflight ->
//! pre-consume -> route (with retry and auto-disable) -> respond -> settle.
//!
//! Any failure after pre-consume and before settle refunds the reservation
//! in full; a finished request settles exactly once.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use mrelay_adapters::{
    default_base_url, AdapterOutput, RelayError, RelayErrorKind, RelayInfo, RelayMode,
    RelayRequest, RelayStream,
};
use mrelay_billing::{fixed_quota, usage_quota};
use mrelay_protocol::openai::Usage;
use mrelay_protocol::sse;
use mrelay_storage::{ChannelRow, ChannelStatus, LogInsert, LogKind, TaskInsert, TaskPlatform};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::auth::{resolve_group, AuthedRequest};
use crate::claude_edge;
use crate::state::AppState;

/// Which dialect the client speaks; decides the error envelope and the
/// stream framing sent back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientDialect {
    OpenAi,
    Claude,
}

pub enum RelayResponse {
    Json(serde_json::Value),
    Binary {
        content_type: String,
        body: Bytes,
    },
    Stream {
        rx: mpsc::Receiver<Bytes>,
        content_type: &'static str,
    },
}

struct Pricing {
    model_ratio: f64,
    completion_ratio: f64,
    group_ratio: f64,
    fixed_price: Option<f64>,
}

pub async fn relay(
    state: Arc<AppState>,
    authed: AuthedRequest,
    request: RelayRequest,
    dialect: ClientDialect,
) -> Result<RelayResponse, RelayError> {
    let started = Instant::now();
    let trace_id = uuid::Uuid::new_v4().to_string();
    let global = state.global.load_full();
    let group = resolve_group(&authed.user);
    let mode = request.mode();
    let origin_model = request_model(&request);
    let is_stream = request.is_stream();

    // Token allow-lists come before anything billable.
    if !authed.token.allows_model(&origin_model) {
        return Err(RelayError::forbidden(format!(
            "token has no access to model {origin_model}"
        )));
    }
    if !authed.token.allows_group(&group) {
        return Err(RelayError::forbidden(format!(
            "token has no access to group {group}"
        )));
    }

    // Backpressure rejects before quota moves. The guard rides in the settle
    // context so streamed requests stay counted until their copier finishes.
    let inflight = state
        .limiter
        .acquire(
            authed.user.id,
            &origin_model,
            global.user_concurrency_limit,
            global.model_rpm_limit,
        )
        .await?;

    let prices = state.prices.load_full();
    let pricing = Pricing {
        model_ratio: prices.model_ratio(&origin_model),
        completion_ratio: prices.completion_ratio(&origin_model),
        group_ratio: prices.group_ratio(&group),
        fixed_price: prices.fixed_price(&origin_model),
    };

    let prompt_estimate = estimate_prompt_tokens(&state, &request, &origin_model);
    let pre_quota = match mode {
        RelayMode::MjSubmit | RelayMode::SunoSubmit => {
            let action = task_action(&request).unwrap_or_default();
            let platform = match mode {
                RelayMode::MjSubmit => TaskPlatform::Midjourney,
                _ => TaskPlatform::Suno,
            };
            (prices.task_action_quota(platform, &action) as f64 * pricing.group_ratio).round()
                as i64
        }
        _ => match pricing.fixed_price {
            Some(dollars) => fixed_quota(dollars, pricing.group_ratio),
            None => {
                let max_completion = max_completion_tokens(&request).unwrap_or(0);
                usage_quota(
                    prompt_estimate,
                    max_completion,
                    pricing.model_ratio,
                    pricing.completion_ratio,
                    pricing.group_ratio,
                )
            }
        },
    };

    state
        .ledger
        .pre_consume(&authed.token, pre_quota)
        .await
        .map_err(|err| match err {
            mrelay_billing::LedgerError::QuotaExceeded => RelayError::new(
                RelayErrorKind::QuotaExceeded,
                "insufficient quota for this request",
            ),
            other => RelayError::internal(format!("pre-consume failed: {other}")),
        })?;

    // Everything past this point must either settle or refund.
    match dispatch(
        &state,
        &authed,
        &request,
        DispatchContext {
            trace_id: &trace_id,
            group: &group,
            mode,
            origin_model: &origin_model,
            is_stream,
            streaming_timeout: Duration::from_secs(global.streaming_timeout),
            retry_times: global.retry_times,
        },
    )
    .await
    {
        Ok((info, output)) => {
            respond_and_settle(
                state,
                authed,
                request,
                dialect,
                info,
                output,
                SettleContext {
                    pre_quota,
                    prompt_estimate,
                    pricing,
                    started,
                    _inflight: inflight,
                },
            )
            .await
        }
        Err(err) => {
            if let Err(refund_err) = state.ledger.refund(&authed.token, pre_quota).await {
                warn!(
                    event = "refund_failed",
                    trace_id = %trace_id,
                    user_id = authed.user.id,
                    error = %refund_err
                );
            }
            Err(err)
        }
    }
}

struct DispatchContext<'a> {
    trace_id: &'a str,
    group: &'a str,
    mode: RelayMode,
    origin_model: &'a str,
    is_stream: bool,
    streaming_timeout: Duration,
    retry_times: u32,
}

/// The routing loop: pick a channel, dispatch, classify failures, retry on
/// a different channel while the error stays retriable.
async fn dispatch(
    state: &Arc<AppState>,
    authed: &AuthedRequest,
    request: &RelayRequest,
    ctx: DispatchContext<'_>,
) -> Result<(RelayInfo, AdapterOutput), RelayError> {
    let mut tried: HashSet<i64> = HashSet::new();
    let mut last_error: Option<RelayError> = None;

    for retry_index in 0..=ctx.retry_times {
        let channel = match select_channel(state, authed, ctx.group, ctx.origin_model, retry_index, &tried)
        {
            Ok(channel) => channel,
            Err(err) => {
                if retry_index == 0 {
                    return Err(err);
                }
                return Err(last_error.unwrap_or(err));
            }
        };
        tried.insert(channel.id);

        // Claude-dialect requests reach non-Anthropic channels in canonical
        // chat shape; the response path folds them back (see
        // `respond_and_settle`).
        let (attempt_request, attempt_mode) = match request {
            RelayRequest::ClaudeMessages(req)
                if channel.kind != mrelay_storage::ChannelType::Anthropic =>
            {
                (
                    RelayRequest::Chat(claude_edge::messages_to_chat(req)),
                    RelayMode::ChatCompletions,
                )
            }
            other => (other.clone(), ctx.mode),
        };

        let mut info = build_relay_info(state, authed, &attempt_request, &ctx, &channel);
        info.mode = attempt_mode;
        let Some(mut adapter) = state.adapters.build(channel.kind) else {
            return Err(RelayError::internal(format!(
                "no adapter registered for channel type {:?}",
                channel.kind
            )));
        };
        adapter.init(&info);

        info!(
            event = "upstream_dispatch",
            trace_id = %ctx.trace_id,
            channel_id = channel.id,
            channel_type = channel.kind.as_str(),
            model = %info.upstream_model,
            attempt = retry_index,
            is_stream = ctx.is_stream
        );

        match adapter.execute(&attempt_request, &info).await {
            Ok(output) => return Ok((info, output)),
            Err(err) => {
                warn!(
                    event = "upstream_failed",
                    trace_id = %ctx.trace_id,
                    channel_id = channel.id,
                    status = err.upstream_status,
                    attempt = retry_index,
                    error = %err
                );
                handle_channel_failure(state, &channel, &err).await;
                if err.is_retriable() && retry_index < ctx.retry_times {
                    last_error = Some(err);
                    continue;
                }
                return Err(err);
            }
        }
    }

    Err(last_error.unwrap_or_else(|| {
        RelayError::new(RelayErrorKind::NoAvailableChannel, "no channel available")
    }))
}

fn select_channel(
    state: &AppState,
    authed: &AuthedRequest,
    group: &str,
    model: &str,
    retry_index: u32,
    tried: &HashSet<i64>,
) -> Result<ChannelRow, RelayError> {
    if let Some(channel_id) = authed.specific_channel_id {
        // Sticky routing skips the ability lookup but still has to serve the
        // (group, model) pair.
        let channel = state.abilities.get_by_id(channel_id).ok_or_else(|| {
            RelayError::invalid_request(format!("pinned channel {channel_id} not found"))
        })?;
        if !tried.is_empty() {
            return Err(RelayError::new(
                RelayErrorKind::NoAvailableChannel,
                "pinned channel already failed",
            ));
        }
        if !channel.serves(group, model) {
            return Err(RelayError::invalid_request(format!(
                "pinned channel {channel_id} does not serve {model} for group {group}"
            )));
        }
        return Ok(channel);
    }

    state
        .abilities
        .select(group, model, retry_index, tried)
        .map_err(|_| {
            RelayError::new(
                RelayErrorKind::NoAvailableChannel,
                format!("no available channel for model {model} in group {group}"),
            )
        })
}

fn build_relay_info(
    state: &AppState,
    authed: &AuthedRequest,
    request: &RelayRequest,
    ctx: &DispatchContext<'_>,
    channel: &ChannelRow,
) -> RelayInfo {
    let keys = channel.keys();
    let key_index = state.abilities.next_key_index(channel.id, keys.len());
    let api_key = keys.get(key_index).copied().unwrap_or_default().to_string();
    let base_url = if channel.base_url.is_empty() {
        default_base_url(channel.kind).to_string()
    } else {
        channel.base_url.clone()
    };
    RelayInfo {
        trace_id: ctx.trace_id.to_string(),
        user_id: authed.user.id,
        token_id: authed.token.id,
        group: ctx.group.to_string(),
        mode: ctx.mode,
        origin_model: ctx.origin_model.to_string(),
        upstream_model: channel.map_model(ctx.origin_model).to_string(),
        is_stream: ctx.is_stream,
        channel: channel.clone(),
        api_key,
        base_url,
        streaming_timeout: ctx.streaming_timeout,
        task_action: task_action(request),
    }
}

/// Auto-disable a channel whose credential is dead. Best effort: a failed
/// status write never blocks the retry loop.
async fn handle_channel_failure(state: &Arc<AppState>, channel: &ChannelRow, err: &RelayError) {
    if !err.should_disable_channel() || !channel.auto_ban {
        return;
    }
    state.abilities.remove_channel(channel.id);
    let reason = format!(
        "auto-disabled: {} (upstream status {})",
        err.message,
        err.upstream_status.unwrap_or(0)
    );
    if let Err(storage_err) = state
        .storage
        .set_channel_status(channel.id, ChannelStatus::AutoDisabled, &reason)
        .await
    {
        warn!(
            event = "auto_disable_persist_failed",
            channel_id = channel.id,
            error = %storage_err
        );
    }
    state
        .ledger
        .record_log(LogInsert::system(format!(
            "channel {} ({}) auto-disabled: {}",
            channel.name, channel.id, err.message
        )))
        .await;
}

struct SettleContext {
    pre_quota: i64,
    prompt_estimate: i64,
    pricing: Pricing,
    started: Instant,
    _inflight: crate::limit::InflightGuard,
}

async fn respond_and_settle(
    state: Arc<AppState>,
    authed: AuthedRequest,
    request: RelayRequest,
    dialect: ClientDialect,
    info: RelayInfo,
    output: AdapterOutput,
    ctx: SettleContext,
) -> Result<RelayResponse, RelayError> {
    // Async task submits keep their reservation until the poller finalises.
    if matches!(info.mode, RelayMode::MjSubmit | RelayMode::SunoSubmit) {
        return finish_task_submit(state, authed, request, info, output, ctx).await;
    }

    match output {
        AdapterOutput::Json { mut body, usage } => {
            let usage = finalize_usage(&state, usage, ctx.prompt_estimate, &info, &body);
            settle(&state, &authed, &info, &ctx, usage, false).await;
            // A Claude-dialect client routed onto a non-Anthropic channel got
            // a canonical chat response; fold it back into message shape.
            // Native ClaudeMessages responses are already in dialect.
            if dialect == ClientDialect::Claude && info.mode != RelayMode::ClaudeMessages {
                body = claude_edge::chat_response_to_messages(&body, &info.origin_model);
            }
            Ok(RelayResponse::Json(body))
        }
        AdapterOutput::Binary { content_type, body, usage } => {
            let usage = if usage.is_empty() {
                Usage::new(ctx.prompt_estimate, 0)
            } else {
                usage
            };
            settle(&state, &authed, &info, &ctx, usage, false).await;
            Ok(RelayResponse::Binary { content_type, body })
        }
        AdapterOutput::Stream(stream) => {
            let stream: Box<dyn RelayStream> =
                if dialect == ClientDialect::Claude && info.mode != RelayMode::ClaudeMessages {
                    Box::new(claude_edge::ChatToClaudeStream::new(
                        stream,
                        info.origin_model.clone(),
                    ))
                } else {
                    stream
                };
            Ok(spawn_stream_copier(state, authed, dialect, info, stream, ctx))
        }
    }
}

/// Copy the canonical event stream to the client, enforcing the per-event
/// inactivity timeout, then settle with whatever usage was observed. Client
/// disconnects cancel the upstream read; errors after headers go in-band.
fn spawn_stream_copier(
    state: Arc<AppState>,
    authed: AuthedRequest,
    dialect: ClientDialect,
    info: RelayInfo,
    mut stream: Box<dyn RelayStream>,
    ctx: SettleContext,
) -> RelayResponse {
    let (tx, rx) = mpsc::channel::<Bytes>(32);
    tokio::spawn(async move {
        let mut aborted = false;
        loop {
            match tokio::time::timeout(info.streaming_timeout, stream.next_frames()).await {
                Ok(Ok(Some(frames))) => {
                    let mut client_gone = false;
                    for frame in frames {
                        if tx.send(frame).await.is_err() {
                            client_gone = true;
                            break;
                        }
                    }
                    if client_gone {
                        aborted = true;
                        break;
                    }
                }
                Ok(Ok(None)) => break,
                Ok(Err(err)) => {
                    warn!(
                        event = "stream_failed",
                        trace_id = %info.trace_id,
                        channel_id = info.channel.id,
                        error = %err
                    );
                    let frame = match dialect {
                        ClientDialect::OpenAi => error_frame(&err),
                        ClientDialect::Claude => claude_edge::claude_error_frame(&err),
                    };
                    let _ = tx.send(frame).await;
                    aborted = true;
                    break;
                }
                Err(_elapsed) => {
                    warn!(
                        event = "stream_timeout",
                        trace_id = %info.trace_id,
                        channel_id = info.channel.id,
                        timeout_secs = info.streaming_timeout.as_secs()
                    );
                    let err = RelayError::new(
                        RelayErrorKind::StreamAborted,
                        "stream timed out waiting for the upstream",
                    );
                    let frame = match dialect {
                        ClientDialect::OpenAi => error_frame(&err),
                        ClientDialect::Claude => claude_edge::claude_error_frame(&err),
                    };
                    let _ = tx.send(frame).await;
                    aborted = true;
                    break;
                }
            }
        }

        // Observed tokens are billable; the unconsumed remainder of the
        // reservation is returned by the settle below.
        let mut usage = stream.usage();
        if usage.prompt_tokens == 0 {
            usage.merge(&Usage::new(ctx.prompt_estimate, usage.completion_tokens));
        }
        if usage.completion_tokens == 0 {
            let estimated = state
                .estimator
                .count_text(&info.origin_model, stream.fallback_text());
            usage.merge(&Usage::new(usage.prompt_tokens, estimated));
        }
        drop(stream);
        settle(&state, &authed, &info, &ctx, usage, aborted).await;
    });

    RelayResponse::Stream {
        rx,
        content_type: "text/event-stream",
    }
}

async fn settle(
    state: &Arc<AppState>,
    authed: &AuthedRequest,
    info: &RelayInfo,
    ctx: &SettleContext,
    usage: Usage,
    aborted: bool,
) {
    let actual = match ctx.pricing.fixed_price {
        Some(dollars) => fixed_quota(dollars, ctx.pricing.group_ratio),
        None => usage_quota(
            usage.prompt_tokens,
            usage.completion_tokens,
            ctx.pricing.model_ratio,
            ctx.pricing.completion_ratio,
            ctx.pricing.group_ratio,
        ),
    };
    if let Err(err) = state.ledger.settle(&authed.token, ctx.pre_quota, actual).await {
        warn!(
            event = "settle_failed",
            trace_id = %info.trace_id,
            user_id = authed.user.id,
            error = %err
        );
    }
    state
        .ledger
        .add_channel_used_quota(info.channel.id, actual)
        .await;

    let mut content = format!(
        "model ratio {:.4}, completion ratio {:.2}, group ratio {:.2}",
        ctx.pricing.model_ratio, ctx.pricing.completion_ratio, ctx.pricing.group_ratio
    );
    if aborted {
        content.push_str(", stream aborted early");
    }
    state
        .ledger
        .record_log(LogInsert {
            user_id: authed.user.id,
            token_id: authed.token.id,
            channel_id: info.channel.id,
            model: info.origin_model.clone(),
            kind: LogKind::Consume,
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            quota: actual,
            elapsed_ms: ctx.started.elapsed().as_millis() as i64,
            is_stream: info.is_stream,
            content,
        })
        .await;
}

async fn finish_task_submit(
    state: Arc<AppState>,
    authed: AuthedRequest,
    request: RelayRequest,
    info: RelayInfo,
    output: AdapterOutput,
    ctx: SettleContext,
) -> Result<RelayResponse, RelayError> {
    let AdapterOutput::Json { body, .. } = output else {
        return Err(RelayError::internal("task submit returned a stream"));
    };
    let (platform, task_id) = match &request {
        RelayRequest::MjSubmit { .. } => (
            TaskPlatform::Midjourney,
            body.get("result")
                .and_then(serde_json::Value::as_str)
                .unwrap_or_default()
                .to_string(),
        ),
        RelayRequest::SunoSubmit { .. } => (
            TaskPlatform::Suno,
            body.get("data")
                .and_then(serde_json::Value::as_str)
                .unwrap_or_default()
                .to_string(),
        ),
        _ => return Err(RelayError::internal("task submit with non-task request")),
    };
    if task_id.is_empty() {
        // Accepted but unidentifiable: nothing to poll, so give the money back.
        state
            .ledger
            .refund(&authed.token, ctx.pre_quota)
            .await
            .map_err(|err| RelayError::internal(format!("refund failed: {err}")))?;
        return Err(RelayError::new(
            RelayErrorKind::UpstreamFatal,
            "upstream accepted the task without an id",
        ));
    }

    if let Err(err) = state
        .storage
        .insert_task(TaskInsert {
            task_id: task_id.clone(),
            platform,
            user_id: authed.user.id,
            token_id: authed.token.id,
            channel_id: info.channel.id,
            action: info.task_action.clone().unwrap_or_default(),
            quota: ctx.pre_quota,
            data: body.to_string(),
        })
        .await
    {
        // No tracked row means the poller can never finalise; give the
        // reservation back rather than stranding it.
        if let Err(refund_err) = state.ledger.refund(&authed.token, ctx.pre_quota).await {
            warn!(
                event = "refund_failed",
                trace_id = %info.trace_id,
                user_id = authed.user.id,
                error = %refund_err
            );
        }
        return Err(RelayError::internal(format!("task insert failed: {err}")));
    }

    state
        .ledger
        .record_log(LogInsert {
            user_id: authed.user.id,
            token_id: authed.token.id,
            channel_id: info.channel.id,
            model: info.task_action.clone().unwrap_or_default(),
            kind: LogKind::Task,
            prompt_tokens: 0,
            completion_tokens: 0,
            quota: ctx.pre_quota,
            elapsed_ms: ctx.started.elapsed().as_millis() as i64,
            is_stream: false,
            content: format!("task {task_id} submitted, quota reserved"),
        })
        .await;

    Ok(RelayResponse::Json(body))
}

fn finalize_usage(
    state: &AppState,
    usage: Usage,
    prompt_estimate: i64,
    info: &RelayInfo,
    body: &serde_json::Value,
) -> Usage {
    if !usage.is_empty() {
        return usage;
    }
    // Providers that never report usage get estimator-based accounting.
    let completion_text = body
        .pointer("/choices/0/message/content")
        .and_then(serde_json::Value::as_str)
        .unwrap_or_default();
    Usage::new(
        prompt_estimate,
        state.estimator.count_text(&info.origin_model, completion_text),
    )
}

/// In-band error event for OpenAI-dialect streams, emitted after headers
/// have already been sent.
fn error_frame(error: &RelayError) -> Bytes {
    let envelope = error.to_envelope();
    let data = serde_json::to_string(&envelope).unwrap_or_else(|_| "{}".to_string());
    sse::encode_frame(None, &data)
}

fn request_model(request: &RelayRequest) -> String {
    match request {
        RelayRequest::Chat(req) => req.model.clone(),
        RelayRequest::Completion(req) => req.model.clone(),
        RelayRequest::Embedding(req) => req.model.clone(),
        RelayRequest::Image(req) => req.model.clone(),
        RelayRequest::Speech(req) => req.model.clone(),
        RelayRequest::AudioUpload { model, .. } => model.clone(),
        RelayRequest::Moderation(req) => req.model.clone(),
        RelayRequest::ClaudeMessages(req) => req.model.clone(),
        RelayRequest::MjSubmit { .. } => "midjourney".to_string(),
        RelayRequest::SunoSubmit { .. } => "suno".to_string(),
    }
}

fn task_action(request: &RelayRequest) -> Option<String> {
    match request {
        RelayRequest::MjSubmit { action, .. } => Some(action.clone()),
        RelayRequest::SunoSubmit { action, .. } => Some(action.clone()),
        _ => None,
    }
}

fn max_completion_tokens(request: &RelayRequest) -> Option<i64> {
    match request {
        RelayRequest::Chat(req) => req.max_output_tokens(),
        RelayRequest::Completion(req) => req.max_tokens,
        RelayRequest::ClaudeMessages(req) => Some(req.max_tokens),
        _ => None,
    }
}

fn estimate_prompt_tokens(state: &AppState, request: &RelayRequest, model: &str) -> i64 {
    match request {
        RelayRequest::Chat(req) => state.estimator.count_messages(model, &req.messages),
        RelayRequest::Completion(req) => state.estimator.count_text(model, &req.prompt_text()),
        RelayRequest::Embedding(req) => state.estimator.count_text(model, &req.input_text()),
        RelayRequest::Moderation(req) => state.estimator.count_text(model, &req.input_text()),
        RelayRequest::Speech(req) => state.estimator.count_text(model, &req.input),
        RelayRequest::ClaudeMessages(req) => {
            let mut total = 0;
            if let Some(system) = req.system_text() {
                total += state.estimator.count_text(model, &system);
            }
            for message in &req.messages {
                total += state.estimator.count_text(model, &message.content.text());
            }
            total
        }
        RelayRequest::Image(_) | RelayRequest::AudioUpload { .. } => 0,
        RelayRequest::MjSubmit { .. } | RelayRequest::SunoSubmit { .. } => 0,
    }
}
