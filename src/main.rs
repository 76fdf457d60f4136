use anyhow::Result;
use tokio::signal;
use tracing::{error, info};

use intranet_messaging::settings::Settings;

mod server;

#[tokio::main]
async fn main() -> Result<()> {
    // stdout carries the MCP transport.
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    info!("starting intranet-messaging-mcp");

    let config = Settings::load()?;
    let server = server::Server::new(config).await?;

    tokio::select! {
        result = server.run() => {
            if let Err(err) = result {
                error!(?err, "server terminated with error");
            }
        }
        _ = signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }

    server.shutdown().await;
    Ok(())
}
