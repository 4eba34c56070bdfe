//! Chat platform webhook.
//!
//! The platform posts one JSON event per user utterance and expects an answer in the same
//! HTTP response within a few seconds. Utterances starting with `/` are relay commands;
//! anything else is recorded and handed to the tenant's stream while this handler waits
//! for a reply.

use std::time::Duration;

use axum::{
    Json,
    body::{Body, Bytes, to_bytes},
    extract::State,
    http::{HeaderMap, Request},
    middleware::Next,
    response::{IntoResponse, Response},
};
use relay_core::{RelayError, Session, verify_signature};
use relay_messages::{NewInbound, ReplyOutcome};
use relay_ratelimit::RateKey;
use relay_session::SessionLookup;
use relay_telemetry::with_common_fields;
use serde::Deserialize;
use serde_json::{Value, json};
use time::OffsetDateTime;
use tokio::time::Instant;
use tracing::{Instrument, debug, field, info, info_span, warn};

use crate::{error::ApiError, state::AppState};

pub const MAX_WEBHOOK_BODY: usize = 64 * 1024;
pub const SIGNATURE_HEADER: &str = "x-relay-signature";
pub const EVENT_ID_HEADER: &str = "x-relay-event-id";

const PAIR_ATTEMPTS_PER_MINUTE: u32 = 5;
const MINUTE: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookEvent {
    pub user_request: UserRequest,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRequest {
    pub user: ChatUser,
    #[serde(default)]
    pub utterance: String,
    #[serde(default)]
    pub callback_url: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ChatUser {
    pub id: String,
}

/// Relay commands typed into the chat.
#[derive(Debug, PartialEq, Eq)]
enum Command<'a> {
    Pair(&'a str),
    Unpair,
    Status,
}

fn parse_command(utterance: &str) -> Option<Command<'_>> {
    let mut parts = utterance.trim().splitn(2, char::is_whitespace);
    let head = parts.next()?.to_ascii_lowercase();
    let rest = parts.next().unwrap_or_default().trim();
    match head.as_str() {
        "/pair" => Some(Command::Pair(rest)),
        "/unpair" => Some(Command::Unpair),
        "/status" => Some(Command::Status),
        _ => None,
    }
}

/// Platform "simple text" response.
pub fn text_reply(text: impl Into<String>) -> Json<Value> {
    Json(json!({
        "version": "2.0",
        "template": { "outputs": [ { "simpleText": { "text": text.into() } } ] }
    }))
}

/// Rejects webhook bodies whose HMAC signature does not match, when a secret is configured.
pub async fn verify_webhook_signature(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let Some(secret) = state.config.webhook_signature_secret.as_deref() else {
        return next.run(req).await;
    };
    let (parts, body) = req.into_parts();
    let body_bytes = match to_bytes(body, MAX_WEBHOOK_BODY).await {
        Ok(bytes) => bytes,
        Err(_) => return ApiError::PayloadTooLarge.into_response(),
    };
    let provided = parts
        .headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if provided.is_empty() || !verify_signature(secret, &body_bytes, provided) {
        warn!("webhook signature rejected");
        return ApiError::Unauthorized.into_response();
    }
    next.run(Request::from_parts(parts, Body::from(body_bytes))).await
}

pub async fn handle_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let raw: Value = serde_json::from_slice(&body)
        .map_err(|err| ApiError::bad_request(format!("invalid JSON: {err}")))?;
    let event: WebhookEvent = serde_json::from_value(raw.clone())
        .map_err(|err| ApiError::bad_request(format!("unexpected event shape: {err}")))?;
    let conversation_key = event.user_request.user.id.trim().to_string();
    if conversation_key.is_empty() {
        return Err(ApiError::bad_request("userRequest.user.id is empty"));
    }
    let source_event_id = headers
        .get(EVENT_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let span = info_span!(
        "webhook",
        conversation_key = %conversation_key,
        tenant = field::Empty,
        message_id = field::Empty,
    );
    let utterance = event.user_request.utterance.clone();
    async move {
        match parse_command(&utterance) {
            Some(command) => run_command(&state, command, &conversation_key).await,
            None => {
                relay_message(&state, raw, event.user_request, conversation_key, source_event_id)
                    .await
            }
        }
    }
    .instrument(span)
    .await
}

async fn run_command(
    state: &AppState,
    command: Command<'_>,
    conversation_key: &str,
) -> Result<Response, ApiError> {
    let text = match command {
        Command::Pair(code) => {
            let attempts = state
                .limiter
                .check_limit(
                    &RateKey::ip("pair_attempt", conversation_key),
                    PAIR_ATTEMPTS_PER_MINUTE,
                    MINUTE,
                )
                .await;
            if !attempts.allowed {
                "Too many pairing attempts. Try again in a minute.".to_string()
            } else if code.is_empty() {
                "Send /pair followed by the code shown by your relay client.".to_string()
            } else {
                match state.sessions.pair(code, conversation_key).await {
                    Ok(_) => "Connected. Messages in this chat now go to your relay client.".into(),
                    Err(RelayError::AlreadyPaired) => "That code has already been used.".into(),
                    Err(RelayError::Expired) => "That code has expired. Request a new one.".into(),
                    Err(RelayError::NotFound(_)) => "Unknown pairing code.".into(),
                    Err(err) => return Err(err.into()),
                }
            }
        }
        Command::Unpair => match paired_session(state, conversation_key).await? {
            Some(session) => {
                state.sessions.disconnect(&session.id).await?;
                "Disconnected. Send /pair with a new code to reconnect.".into()
            }
            None => not_connected_text(),
        },
        Command::Status => match paired_session(state, conversation_key).await? {
            Some(session) => {
                let account_id = session.account_id.unwrap_or_default();
                let stats = state.messages.get_quick_stats(&account_id).await?;
                format!(
                    "Connected.\nToday: {} received, {} replied.\nTotal: {} received, {} replied, {} failed.",
                    stats.inbound_today,
                    stats.outbound_today,
                    stats.inbound_total,
                    stats.outbound_total,
                    stats.outbound_failed,
                )
            }
            None => not_connected_text(),
        },
    };
    Ok(text_reply(text).into_response())
}

fn not_connected_text() -> String {
    "This chat is not connected. Send /pair CODE using the code from your relay client.".into()
}

/// Paired session for the conversation, or `None` when the chat is not connected.
async fn paired_session(
    state: &AppState,
    conversation_key: &str,
) -> Result<Option<Session>, ApiError> {
    match state
        .sessions
        .resolve(SessionLookup::Conversation(conversation_key))
        .await
    {
        Ok(session) => Ok(Some(session)),
        Err(RelayError::NotFound(_) | RelayError::Disconnected | RelayError::Expired) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

async fn relay_message(
    state: &AppState,
    raw: Value,
    request: UserRequest,
    conversation_key: String,
    source_event_id: Option<String>,
) -> Result<Response, ApiError> {
    let Some(session) = paired_session(state, &conversation_key).await? else {
        return Ok(text_reply(not_connected_text()).into_response());
    };
    let account_id = session.account_id.unwrap_or_default();
    let Some(account) = state.repos.accounts.get(&account_id).await.map_err(RelayError::from)?
    else {
        return Ok(text_reply(not_connected_text()).into_response());
    };
    with_common_fields(
        &tracing::Span::current(),
        &account.id,
        Some(&conversation_key),
        None,
    );

    let admission = state
        .limiter
        .check_limit(
            &RateKey::inbound(&account.id),
            account.rate_limit_per_minute,
            MINUTE,
        )
        .await;
    if !admission.allowed {
        info!("inbound message rejected by rate limit");
        return Ok(text_reply("Too many messages. Please wait a moment.").into_response());
    }

    let has_callback = request.callback_url.is_some();
    let callback_expires_at = request
        .callback_url
        .as_ref()
        .map(|_| OffsetDateTime::now_utc() + state.config.callback_ttl);
    let normalized = json!({
        "text": request.utterance,
        "userId": conversation_key,
        "hasCallback": has_callback,
    });
    let (created, waiter) = state
        .messages
        .create_inbound_awaiting(NewInbound {
            account_id: account.id.clone(),
            conversation_key: conversation_key.clone(),
            platform_payload: raw,
            normalized_payload: normalized,
            callback_url: request.callback_url,
            callback_expires_at,
            source_event_id,
        })
        .await?;
    tracing::Span::current().record("message_id", field::display(&created.message.id));
    if created.duplicate && !created.message.status.awaits_reply() {
        debug!(status = %created.message.status, "redelivered event already settled");
        return Ok(Json(json!({"queued": true})).into_response());
    }

    let deadline = Instant::now() + state.config.effective_reply_wait();
    match waiter.wait(deadline).await {
        ReplyOutcome::Reply(reply) => {
            debug!(outbound_id = %reply.id, "answering webhook inline");
            Ok(Json(reply.payload).into_response())
        }
        ReplyOutcome::TimedOut if has_callback => {
            debug!("reply deadline passed, switching to callback");
            Ok(Json(json!({"version": "2.0", "useCallback": true})).into_response())
        }
        ReplyOutcome::TimedOut => Ok(Json(json!({"queued": true})).into_response()),
    }
}
