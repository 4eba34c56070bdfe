use std::{collections::HashSet, convert::Infallible};

use axum::{
    Extension,
    extract::State,
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
};
use futures::Stream;
use relay_broker::{BrokerError, BrokerMessage, Subscription};
use relay_core::{InboundMessage, RelayError};
use relay_messages::{MESSAGE_EVENT, MessageCorrelator};
use relay_session::{PAIRING_COMPLETE_EVENT, Principal, SessionManager};
use tracing::{debug, info, warn};

use crate::{error::ApiError, state::AppState};

const BACKLOG_LIMIT: usize = 100;

fn broker_error(err: BrokerError) -> ApiError {
    ApiError::from(RelayError::BackendUnavailable(err.into()))
}

fn to_event(message: &BrokerMessage) -> Event {
    let mut event = Event::default()
        .event(message.event.as_str())
        .data(message.data.to_string());
    if let Some(id) = &message.id {
        event = event.id(id.as_str());
    }
    event
}

fn inbound_event(message: &InboundMessage) -> Option<Event> {
    let data = serde_json::to_string(message).ok()?;
    Some(
        Event::default()
            .event(MESSAGE_EVENT)
            .id(message.id.as_str())
            .data(data),
    )
}

/// Long-lived event stream for the caller.
///
/// A paired tenant first receives its queued backlog, then live `message` events; every
/// event written is marked delivered. A session still waiting for its code receives a
/// single `pairing_complete` event and the stream ends, after which the client reconnects
/// with the same token.
pub async fn stream_events(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
) -> Result<Response, ApiError> {
    let keep_alive = KeepAlive::new().interval(state.config.sse_keepalive);
    match principal {
        Principal::Account { account, .. } => {
            let subscription = state.broker.subscribe(&account.id).map_err(broker_error)?;
            let backlog = state.messages.queued_for(&account.id, BACKLOG_LIMIT).await?;
            info!(
                tenant = %account.id,
                backlog = backlog.len(),
                clients = state.broker.client_count(&account.id),
                "event stream opened"
            );
            let stream = tenant_stream(state.messages.clone(), backlog, subscription);
            Ok(Sse::new(stream).keep_alive(keep_alive).into_response())
        }
        Principal::PendingSession(session) => {
            let subscription = state
                .broker
                .subscribe(&SessionManager::pairing_channel(&session.id))
                .map_err(broker_error)?;
            debug!(session_id = %session.id, "waiting for pairing on event stream");
            Ok(Sse::new(pairing_stream(subscription))
                .keep_alive(keep_alive)
                .into_response())
        }
    }
}

fn tenant_stream(
    messages: MessageCorrelator,
    backlog: Vec<InboundMessage>,
    mut subscription: Subscription,
) -> impl Stream<Item = Result<Event, Infallible>> {
    async_stream::stream! {
        let tenant = subscription.tenant().to_string();
        // Subscribed before the backlog query; events present in both are sent once.
        let replayed: HashSet<String> = backlog.iter().map(|m| m.id.clone()).collect();
        for message in backlog {
            let Some(event) = inbound_event(&message) else { continue };
            yield Ok(event);
            if let Err(err) = messages.mark_delivered(&message.id).await {
                warn!(error = %err, message_id = %message.id, "failed to mark backlog delivered");
            }
        }
        while let Some(message) = subscription.recv().await {
            if message.id.as_ref().is_some_and(|id| replayed.contains(id)) {
                continue;
            }
            yield Ok(to_event(&message));
            if message.event == MESSAGE_EVENT {
                if let Some(id) = &message.id {
                    if let Err(err) = messages.mark_delivered(id).await {
                        warn!(error = %err, message_id = %id, "failed to mark message delivered");
                    }
                }
            }
        }
        info!(tenant = %tenant, dropped = subscription.dropped(), "event stream closed");
    }
}

fn pairing_stream(mut subscription: Subscription) -> impl Stream<Item = Result<Event, Infallible>> {
    async_stream::stream! {
        while let Some(message) = subscription.recv().await {
            if message.event == PAIRING_COMPLETE_EVENT {
                yield Ok(to_event(&message));
                break;
            }
        }
    }
}
