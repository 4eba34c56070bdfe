//! HTTP surface of the chat relay.
//!
//! Chat platform webhooks come in on `/webhook`; tenant clients hold an SSE stream on
//! `/v1/events` and answer through `/v1/replies`. Pairing starts at `/v1/sessions`.

pub mod admin;
pub mod auth;
pub mod config;
pub mod error;
pub mod events;
pub mod http;
pub mod replies;
pub mod sessions;
pub mod state;
pub mod webhook;

pub use config::{Environment, RelayConfig};
pub use error::ApiError;
pub use http::{build_router, serve_with_shutdown};
pub use state::AppState;
