use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use relay_core::{Account, InboundMessage, MappingState, OutboundMessage, RelayError};
use relay_messages::NewOutbound;
use relay_session::Principal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use tracing::{info, warn};

use crate::{auth::paired_account, error::ApiError, state::AppState};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyRequest {
    pub conversation_key: String,
    pub payload: Value,
    /// Inbound message being answered; enables callback delivery once the webhook moved on.
    #[serde(default)]
    pub inbound_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Delivery {
    /// Handed to the webhook request still waiting on the conversation.
    Inline,
    Callback,
    /// Stored for a later poll.
    Pending,
    Failed,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyResponse {
    pub id: String,
    pub delivery: Delivery,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inbound_id: Option<String>,
}

async fn owned_conversation(
    state: &AppState,
    account: &Account,
    conversation_key: &str,
) -> Result<(), ApiError> {
    let mapping = state
        .repos
        .conversations
        .get(conversation_key)
        .await
        .map_err(RelayError::from)?;
    match mapping {
        Some(m) if m.account_id == account.id && m.state == MappingState::Paired => Ok(()),
        _ => Err(RelayError::not_found("conversation").into()),
    }
}

async fn owned_inbound(
    state: &AppState,
    account: &Account,
    id: &str,
) -> Result<InboundMessage, ApiError> {
    let message = state.messages.get_inbound(id).await?;
    if message.account_id != account.id {
        return Err(RelayError::not_found("inbound message").into());
    }
    Ok(message)
}

pub async fn create_reply(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Json(request): Json<ReplyRequest>,
) -> Result<Response, ApiError> {
    let account = paired_account(&principal)?;
    owned_conversation(&state, account, &request.conversation_key).await?;
    let callback_target = match request.inbound_id.as_deref() {
        Some(id) => {
            let inbound = owned_inbound(&state, account, id).await?;
            if inbound.conversation_key != request.conversation_key {
                return Err(RelayError::not_found("inbound message").into());
            }
            Some(inbound)
        }
        None => None,
    };

    let created = state
        .messages
        .create_outbound(NewOutbound {
            account_id: account.id.clone(),
            conversation_key: request.conversation_key,
            payload: request.payload,
        })
        .await?;

    if let Some(inbound_id) = created.matched_inbound {
        return Ok(Json(ReplyResponse {
            id: created.message.id,
            delivery: Delivery::Inline,
            inbound_id: Some(inbound_id),
        })
        .into_response());
    }

    let delivery = match callback_target {
        Some(inbound) if inbound.callback_open_at(OffsetDateTime::now_utc()) => {
            deliver_callback(&state, &inbound, &created.message).await?
        }
        _ => Delivery::Pending,
    };
    if delivery == Delivery::Pending {
        state.messages.offer_pending(&created.message).await;
    }
    let status = match delivery {
        Delivery::Pending => StatusCode::ACCEPTED,
        _ => StatusCode::OK,
    };
    let inbound_id = request.inbound_id;
    Ok((
        status,
        Json(ReplyResponse {
            id: created.message.id,
            delivery,
            inbound_id,
        }),
    )
        .into_response())
}

/// Pushes a late reply to the platform callback URL and records the result.
async fn deliver_callback(
    state: &AppState,
    inbound: &InboundMessage,
    outbound: &OutboundMessage,
) -> Result<Delivery, ApiError> {
    let Some(url) = inbound.callback_url.as_deref() else {
        return Ok(Delivery::Pending);
    };
    let result = state
        .http
        .post(url)
        .json(&outbound.payload)
        .send()
        .await
        .and_then(|response| response.error_for_status());
    match result {
        Ok(_) => {
            state.messages.mark_outbound_sent(&outbound.id).await?;
            state.messages.mark_acked(&inbound.id).await?;
            metrics::counter!("relay_callback_delivered_total").increment(1);
            info!(outbound_id = %outbound.id, inbound_id = %inbound.id, "reply delivered via callback");
            Ok(Delivery::Callback)
        }
        Err(err) => {
            warn!(error = %err, outbound_id = %outbound.id, "callback delivery failed");
            state
                .messages
                .mark_outbound_failed(&outbound.id, &err.to_string())
                .await?;
            Ok(Delivery::Failed)
        }
    }
}

pub async fn ack_message(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let account = paired_account(&principal)?;
    owned_inbound(&state, account, &id).await?;
    state.messages.mark_acked(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingQuery {
    pub conversation_key: String,
    #[serde(default = "default_pending_limit")]
    pub limit: usize,
}

fn default_pending_limit() -> usize {
    20
}

pub async fn pending_replies(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Query(query): Query<PendingQuery>,
) -> Result<Json<Vec<OutboundMessage>>, ApiError> {
    let account = paired_account(&principal)?;
    let limit = query.limit.clamp(1, 100);
    let pending = state
        .messages
        .pending_outbound(&account.id, &query.conversation_key, limit)
        .await?;
    Ok(Json(pending))
}
