//! Listener binary that tails the configured chains and logs every block,
//! receipt and error until interrupted.

use std::io;

use tx_listener::{build_client, run_listener, BootstrapError};
use tx_listener_domain::services::{init_telemetry, TelemetryConfig};
use tx_listener_domain::BootstrapConfig;

#[tokio::main]
async fn main() -> io::Result<()> {
    if let Err(err) = bootstrap().await {
        eprintln!("[tx-listener] bootstrap failed: {err}");
        return Err(io::Error::other(err.to_string()));
    }

    Ok(())
}

async fn bootstrap() -> Result<(), BootstrapError> {
    let config = BootstrapConfig::load_from_env()?;
    let telemetry_config = TelemetryConfig::from_env("LISTENER");
    let _telemetry = init_telemetry(&telemetry_config)?;
    let client = build_client(&config)?;
    run_listener(config, client).await
}
