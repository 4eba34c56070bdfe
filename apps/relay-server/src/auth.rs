use std::{net::SocketAddr, time::Duration};

use axum::{
    body::Body,
    extract::{ConnectInfo, FromRequestParts, State},
    http::{HeaderMap, Request, header::AUTHORIZATION, request::Parts},
    middleware::Next,
    response::{IntoResponse, Response},
};
use relay_core::Account;
use relay_ratelimit::RateKey;
use relay_session::Principal;
use subtle::ConstantTimeEq;
use tracing::debug;

use crate::{error::ApiError, state::AppState};

const ACCOUNT_WINDOW: Duration = Duration::from_secs(60);

pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// Resolves the bearer credential into a [`Principal`] and applies the tenant's
/// per-minute request ceiling.
pub async fn require_tenant(
    State(state): State<AppState>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    let Some(token) = bearer_token(req.headers()) else {
        return ApiError::Unauthorized.into_response();
    };
    let principal = match state.sessions.authenticate(token).await {
        Ok(principal) => principal,
        Err(err) if err.is_internal() => return ApiError::from(err).into_response(),
        Err(err) => {
            debug!(error = %err, "bearer credential rejected");
            return ApiError::Unauthorized.into_response();
        }
    };
    if let Principal::Account { account, .. } = &principal {
        if let Err(err) = state
            .limiter
            .enforce(
                &RateKey::account(&account.id),
                account.rate_limit_per_minute,
                ACCOUNT_WINDOW,
            )
            .await
        {
            return ApiError::from(err).into_response();
        }
    }
    req.extensions_mut().insert(principal);
    next.run(req).await
}

/// Admin routes require `ADMIN_TOKEN` when one is configured.
pub async fn require_admin(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    if let Some(expected) = state.config.admin_token.as_deref() {
        let ok = bearer_token(req.headers())
            .is_some_and(|token| bool::from(token.as_bytes().ct_eq(expected.as_bytes())));
        if !ok {
            return ApiError::Unauthorized.into_response();
        }
    }
    next.run(req).await
}

/// Paired tenant behind the request; pending sessions may only open the event stream.
pub fn paired_account(principal: &Principal) -> Result<&Account, ApiError> {
    match principal {
        Principal::Account { account, .. } => Ok(account),
        Principal::PendingSession(_) => Err(ApiError::Forbidden("session is not paired yet")),
    }
}

/// Caller address: first `x-forwarded-for` hop, then `x-real-ip`, then the socket peer.
#[derive(Debug, Clone)]
pub struct ClientIp(pub String);

impl<S: Send + Sync> FromRequestParts<S> for ClientIp {
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = |name: &str| {
            parts
                .headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.split(',').next().unwrap_or_default().trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let ip = header("x-forwarded-for")
            .or_else(|| header("x-real-ip"))
            .or_else(|| {
                parts
                    .extensions
                    .get::<ConnectInfo<SocketAddr>>()
                    .map(|ConnectInfo(addr)| addr.ip().to_string())
            })
            .unwrap_or_else(|| "unknown".to_string());
        Ok(ClientIp(ip))
    }
}
