//! Logging setup for the relay binaries.
//!
//! Output is JSON by default so log shippers can index the span fields; set
//! `LOG_FORMAT=text` for human-readable lines while developing.

use anyhow::Result;

mod config;
mod tracing_init;

pub use config::TelemetryConfig;
pub use tracing_init::{init_telemetry, with_common_fields};

/// Installs the subscriber configured from `LOG_FORMAT` and `RUST_LOG`.
pub fn install(service_name: &str) -> Result<()> {
    init_telemetry(TelemetryConfig::from_env(service_name))
}
