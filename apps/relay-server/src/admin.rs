use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use relay_core::{
    Account, ConversationMapping, InboundMessage, InboundStatus, OutboundMessage, OverviewStats,
    QuickStats, RelayError, Session, SessionStatus,
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::info;

use crate::{error::ApiError, state::AppState};

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default = "default_list_limit")]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
}

fn default_list_limit() -> usize {
    50
}

const MAX_PAGE: usize = 100;
const FAILED_MESSAGES_LIMIT: usize = 50;

fn default_page_limit() -> usize {
    20
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    #[default]
    Inbound,
    Outbound,
}

#[derive(Debug, Deserialize)]
pub struct MessagesQuery {
    #[serde(default, rename = "type")]
    pub kind: MessageKind,
    #[serde(default = "default_page_limit")]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
}

#[derive(Debug, Serialize)]
pub struct AccountSummary {
    #[serde(flatten)]
    pub account: Account,
    #[serde(flatten)]
    pub stats: QuickStats,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum MessagePage {
    Inbound(Vec<InboundMessage>),
    Outbound(Vec<OutboundMessage>),
}

pub async fn list_sessions(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<Session>>, ApiError> {
    let sessions = state.sessions.find_recent(query.limit.clamp(1, 500)).await?;
    Ok(Json(sessions))
}

pub async fn disconnect_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.sessions.disconnect(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn delete_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.sessions.delete(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_accounts(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<AccountSummary>>, ApiError> {
    let accounts = state
        .repos
        .accounts
        .list(query.limit.clamp(1, MAX_PAGE), query.offset)
        .await
        .map_err(RelayError::from)?;
    let mut summaries = Vec::with_capacity(accounts.len());
    for account in accounts {
        let stats = state.messages.get_quick_stats(&account.id).await?;
        summaries.push(AccountSummary { account, stats });
    }
    Ok(Json(summaries))
}

pub async fn account_conversations(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<ConversationMapping>>, ApiError> {
    ensure_account(&state, &id).await?;
    let mappings = state
        .repos
        .conversations
        .list_for_account(&id)
        .await
        .map_err(RelayError::from)?;
    Ok(Json(mappings))
}

pub async fn delete_conversation(
    State(state): State<AppState>,
    Path((id, conversation_key)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    state
        .sessions
        .forget_conversation(&id, &conversation_key)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Message history of one tenant, newest first. `type=outbound` lists replies.
pub async fn account_messages(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<MessagesQuery>,
) -> Result<Json<MessagePage>, ApiError> {
    ensure_account(&state, &id).await?;
    let limit = query.limit.clamp(1, MAX_PAGE);
    let page = match query.kind {
        MessageKind::Inbound => MessagePage::Inbound(
            state
                .repos
                .inbound
                .list_for_account(&id, limit, query.offset)
                .await
                .map_err(RelayError::from)?,
        ),
        MessageKind::Outbound => MessagePage::Outbound(
            state
                .repos
                .outbound
                .list_for_account(&id, limit, query.offset)
                .await
                .map_err(RelayError::from)?,
        ),
    };
    Ok(Json(page))
}

pub async fn account_failed_messages(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<OutboundMessage>>, ApiError> {
    ensure_account(&state, &id).await?;
    let failed = state
        .repos
        .outbound
        .find_failed(&id, FAILED_MESSAGES_LIMIT)
        .await
        .map_err(RelayError::from)?;
    Ok(Json(failed))
}

pub async fn account_stats(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<QuickStats>, ApiError> {
    ensure_account(&state, &id).await?;
    Ok(Json(state.messages.get_quick_stats(&id).await?))
}

#[derive(Debug, Serialize)]
pub struct TokenResponse {
    pub token: String,
}

pub async fn rotate_account_token(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<TokenResponse>, ApiError> {
    let token = state.sessions.regenerate_token(&id).await?;
    Ok(Json(TokenResponse { token }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitRequest {
    pub rate_limit_per_minute: u32,
}

pub async fn set_account_rate_limit(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<RateLimitRequest>,
) -> Result<StatusCode, ApiError> {
    if request.rate_limit_per_minute == 0 {
        return Err(ApiError::bad_request("rateLimitPerMinute must be positive"));
    }
    let updated = state
        .repos
        .accounts
        .set_rate_limit(&id, request.rate_limit_per_minute, OffsetDateTime::now_utc())
        .await
        .map_err(RelayError::from)?;
    if !updated {
        return Err(RelayError::not_found("account").into());
    }
    info!(account_id = %id, per_minute = request.rate_limit_per_minute, "account rate limit changed");
    Ok(StatusCode::NO_CONTENT)
}

pub async fn delete_account(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.sessions.delete_account(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn overview(State(state): State<AppState>) -> Result<Json<OverviewStats>, ApiError> {
    let repos = &state.repos;
    let stats = OverviewStats {
        accounts: repos.accounts.count().await.map_err(RelayError::from)?,
        sessions_pending: repos
            .sessions
            .count_by_status(SessionStatus::PendingPairing)
            .await
            .map_err(RelayError::from)?,
        sessions_paired: repos
            .sessions
            .count_by_status(SessionStatus::Paired)
            .await
            .map_err(RelayError::from)?,
        inbound_queued: repos
            .inbound
            .count_by_status(InboundStatus::Queued)
            .await
            .map_err(RelayError::from)?,
        outbound_failed: repos
            .outbound
            .count_failed(None)
            .await
            .map_err(RelayError::from)?,
        connected_clients: state.broker.total_clients() as u64,
    };
    Ok(Json(stats))
}

async fn ensure_account(state: &AppState, id: &str) -> Result<(), ApiError> {
    match state.repos.accounts.get(id).await.map_err(RelayError::from)? {
        Some(_) => Ok(()),
        None => Err(RelayError::not_found("account").into()),
    }
}
