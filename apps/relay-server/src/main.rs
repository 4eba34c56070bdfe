use anyhow::Result;
use relay_server::{AppState, RelayConfig, serve_with_shutdown};
use relay_telemetry::install as init_telemetry;
use tokio::net::TcpListener;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    init_telemetry("relay-server")?;

    let config = RelayConfig::from_env()?;
    for warning in config.warnings() {
        warn!("{warning}");
    }
    let addr = config.addr;
    let state = AppState::connect(config).await?;
    let reaper = state.reaper().start();

    let listener = TcpListener::bind(addr).await?;
    info!("relay-server listening on {}", addr);

    serve_with_shutdown(listener, state, async {
        tokio::signal::ctrl_c().await.ok();
    })
    .await?;

    reaper.stop().await;
    info!("relay-server stopped");
    Ok(())
}
