use std::{future::Future, net::SocketAddr};

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    middleware,
    routing::{delete, get, post, put},
};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tower_http::{limit::RequestBodyLimitLayer, trace::TraceLayer};
use tracing::info;

use crate::{
    admin,
    auth::{require_admin, require_tenant},
    events, replies, sessions,
    state::AppState,
    webhook::{self, MAX_WEBHOOK_BODY},
};

pub fn build_router(state: AppState) -> Router {
    let webhook_routes = Router::new()
        .route("/webhook", post(webhook::handle_webhook))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            webhook::verify_webhook_signature,
        ));

    let tenant_routes = Router::new()
        .route("/v1/events", get(events::stream_events))
        .route("/v1/messages/{id}/ack", post(replies::ack_message))
        .route("/v1/replies", post(replies::create_reply))
        .route("/v1/replies/pending", get(replies::pending_replies))
        .layer(middleware::from_fn_with_state(state.clone(), require_tenant));

    let session_routes = Router::new()
        .route("/v1/sessions", post(sessions::create_session))
        .route("/v1/sessions/{token}/status", get(sessions::session_status));

    let admin_routes = Router::new()
        .route("/admin/sessions", get(admin::list_sessions))
        .route(
            "/admin/sessions/{id}/disconnect",
            post(admin::disconnect_session),
        )
        .route("/admin/sessions/{id}", delete(admin::delete_session))
        .route("/admin/accounts", get(admin::list_accounts))
        .route("/admin/accounts/{id}", delete(admin::delete_account))
        .route("/admin/accounts/{id}/stats", get(admin::account_stats))
        .route(
            "/admin/accounts/{id}/conversations",
            get(admin::account_conversations),
        )
        .route(
            "/admin/accounts/{id}/conversations/{key}",
            delete(admin::delete_conversation),
        )
        .route("/admin/accounts/{id}/messages", get(admin::account_messages))
        .route(
            "/admin/accounts/{id}/failed-messages",
            get(admin::account_failed_messages),
        )
        .route("/admin/accounts/{id}/token", post(admin::rotate_account_token))
        .route(
            "/admin/accounts/{id}/rate-limit",
            put(admin::set_account_rate_limit),
        )
        .route("/admin/overview", get(admin::overview))
        .layer(middleware::from_fn_with_state(state.clone(), require_admin));

    Router::new()
        .route("/healthz", get(healthz))
        .merge(webhook_routes)
        .merge(tenant_routes)
        .merge(session_routes)
        .merge(admin_routes)
        .layer(RequestBodyLimitLayer::new(MAX_WEBHOOK_BODY))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serves the relay until `signal` resolves, then closes the event broker so open event
/// streams end and in-flight requests can drain.
pub async fn serve_with_shutdown<F>(
    listener: TcpListener,
    state: AppState,
    signal: F,
) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let broker = state.broker.clone();
    let router = build_router(state);
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        signal.await;
        info!(streams = broker.total_clients(), "shutdown signal received, closing event streams");
        broker.close().await;
    })
    .await
}

async fn healthz(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let broker = if state.broker.is_closed() {
        "closed"
    } else if state.broker.is_online() {
        "online"
    } else {
        "reconnecting"
    };
    if broker == "online" {
        (StatusCode::OK, Json(json!({ "status": "ok", "broker": broker })))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "degraded", "broker": broker })),
        )
    }
}
