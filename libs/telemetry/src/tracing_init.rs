use std::sync::OnceLock;

use anyhow::Result;
use tracing::{Span, info};
use tracing_subscriber::layer::Layer;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::TelemetryConfig;

static INIT: OnceLock<()> = OnceLock::new();

/// Installs the global subscriber once; later calls are no-ops.
pub fn init_telemetry(cfg: TelemetryConfig) -> Result<()> {
    if INIT.get().is_some() {
        return Ok(());
    }

    let fmt_layer = if cfg.json_logs {
        tracing_subscriber::fmt::layer()
            .json()
            .flatten_event(true)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer().boxed()
    };
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cfg.default_filter));

    // A subscriber installed by a test harness wins; that is not an error.
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .ok();

    INIT.set(()).ok();
    info!(service = %cfg.service_name, json = cfg.json_logs, "telemetry installed");
    Ok(())
}

/// Records the tenant and conversation identifiers on a span declared with empty fields.
pub fn with_common_fields(
    span: &Span,
    tenant: &str,
    conversation_key: Option<&str>,
    message_id: Option<&str>,
) {
    span.record("tenant", tracing::field::display(tenant));
    if let Some(conversation_key) = conversation_key {
        span.record("conversation_key", tracing::field::display(conversation_key));
    }
    if let Some(message_id) = message_id {
        span.record("message_id", tracing::field::display(message_id));
    }
}
