use std::time::Duration;

use axum::{
    Json,
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
};
use relay_core::{Session, SessionStatus};
use relay_ratelimit::RateKey;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

use crate::{auth::ClientIp, error::ApiError, state::AppState};

const STATUS_POLLS_PER_MINUTE: u32 = 30;

#[derive(Debug, Default, Deserialize)]
struct CreateSessionRequest {
    #[serde(default)]
    metadata: Option<Value>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionResponse {
    pub session_id: String,
    /// Shown once; only its keyed hash is stored.
    pub token: String,
    pub pairing_code: String,
    pub status: SessionStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
}

pub async fn create_session(
    State(state): State<AppState>,
    ClientIp(ip): ClientIp,
    body: Bytes,
) -> Result<(StatusCode, Json<CreateSessionResponse>), ApiError> {
    let request: CreateSessionRequest = if body.is_empty() {
        CreateSessionRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|err| ApiError::bad_request(format!("invalid JSON: {err}")))?
    };
    let created = state.sessions.create_session(&ip).await?;
    if let Some(metadata) = request.metadata {
        state
            .sessions
            .update_metadata(&created.session.id, metadata)
            .await?;
    }
    Ok((
        StatusCode::CREATED,
        Json(CreateSessionResponse {
            session_id: created.session.id,
            token: created.token,
            pairing_code: created.session.pairing_code,
            status: created.session.status,
            expires_at: created.session.expires_at,
        }),
    ))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatusResponse {
    pub session_id: String,
    pub status: SessionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_key: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub paired_at: Option<OffsetDateTime>,
}

impl From<Session> for SessionStatusResponse {
    fn from(session: Session) -> Self {
        Self {
            session_id: session.id,
            status: session.status,
            account_id: session.account_id,
            conversation_key: session.conversation_key,
            expires_at: session.expires_at,
            paired_at: session.paired_at,
        }
    }
}

/// Pairing poll for clients that do not hold an event stream open.
pub async fn session_status(
    State(state): State<AppState>,
    ClientIp(ip): ClientIp,
    Path(token): Path<String>,
) -> Result<Json<SessionStatusResponse>, ApiError> {
    state
        .limiter
        .enforce(
            &RateKey::ip("session_status", &ip),
            STATUS_POLLS_PER_MINUTE,
            Duration::from_secs(60),
        )
        .await?;
    let session = state.sessions.status(&token).await?;
    Ok(Json(session.into()))
}
