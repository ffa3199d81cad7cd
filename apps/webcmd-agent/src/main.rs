//! Agent: connects to a broker and runs the commands it sends.
//!
//! Run with: cargo run -p webcmd-agent-bin -- 127.0.0.1:8080

use std::{sync::Arc, time::Duration};

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use webcmd_agent::{AgentClient, AgentConfig};
use webcmd_executor::ShellExecutor;

#[derive(Debug, Parser)]
#[command(version, about = "Execute commands sent by a webcmd broker")]
struct Args {
    /// Broker address (`host:port`) or full WebSocket URL.
    #[arg(env = "WEBCMD_BROKER")]
    broker: String,
    /// Seconds to wait before reconnecting.
    #[arg(long, env = "WEBCMD_RECONNECT_DELAY", default_value_t = 5)]
    reconnect_delay_secs: u64,
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

    let config = AgentConfig::new(&args.broker)
        .with_reconnect_delay(Duration::from_secs(args.reconnect_delay_secs));
    let agent = AgentClient::new(config, Arc::new(ShellExecutor::new()));

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Shutting down");
            }
            cancel.cancel();
        }
    });

    agent.run(cancel).await;
    Ok(())
}
