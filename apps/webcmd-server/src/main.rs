//! Broker server: agents connect on `/events`, operators send commands over
//! HTTP.
//!
//! Run with: cargo run -p webcmd-server -- --listen 0.0.0.0:8080
//!
//! Then: curl 'http://localhost:8080/node/<agent-ip>/cmd/echo?args=hi'

use std::{net::SocketAddr, time::Duration};

use anyhow::Context as _;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use webcmd_broker::{Broker, BrokerConfig};

#[derive(Debug, Parser)]
#[command(version, about = "Route shell commands to connected agents")]
struct Args {
    /// Address to listen on.
    #[arg(long, env = "WEBCMD_LISTEN", default_value = "0.0.0.0:8080")]
    listen: SocketAddr,
    /// Timeout for requests that do not name one, in seconds.
    #[arg(long, env = "WEBCMD_DEFAULT_TIMEOUT", default_value_t = 10)]
    default_timeout_secs: u64,
    /// Per-node outbound queue capacity.
    #[arg(long, env = "WEBCMD_NODE_QUEUE", default_value_t = 64)]
    node_queue: usize,
    /// Log filter used when RUST_LOG is unset.
    #[arg(long, env = "WEBCMD_LOG", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .init();

    let broker = Broker::start(BrokerConfig {
        default_timeout: Duration::from_secs(args.default_timeout_secs),
        pump_queue_capacity: args.node_queue,
        ..BrokerConfig::default()
    });

    let listener = tokio::net::TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("Failed to bind {}", args.listen))?;
    tracing::info!("Server listening on http://{}", args.listen);

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Shutting down");
            }
            shutdown.cancel();
        }
    });

    let server = tokio::spawn(webcmd_transport::serve(
        listener,
        broker.handle(),
        shutdown.clone().cancelled_owned(),
    ));

    shutdown.cancelled().await;
    broker.shutdown().await;
    server.await.context("Server task failed")??;
    Ok(())
}
