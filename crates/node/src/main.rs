//! tidemark: entry point for the document store server.
//!
//! Parses CLI flags into a `ServerConfig`, wires the WebSocket server
//! and the optional metrics endpoint, then serves until Ctrl+C. A final
//! flush runs before exit so the flush interval never loses more than
//! one tick of dirty state on a clean shutdown.

use clap::Parser;
use std::path::PathBuf;
use tidemark_config::ServerConfig;
use tidemark_server::Server;

#[derive(Parser, Debug)]
#[command(name = "tidemark", version, about = "In-memory, time-indexed document store over WebSockets")]
struct Cli {
    /// Master API key for the server.
    #[arg(short = 's', long = "secret-key")]
    secret_key: String,

    /// Folder for persistent data (omit to run purely in memory).
    #[arg(short = 'd', long = "data")]
    data: Option<PathBuf>,

    /// Seconds between flushes of dirty state to disk.
    #[arg(short = 'f', long = "flush-interval", default_value_t = 15)]
    flush_interval: u64,

    /// TCP port to listen on.
    #[arg(short = 'p', long = "port", default_value_t = 8080)]
    port: u16,

    /// Optional Prometheus metrics HTTP port.
    #[arg(long = "metrics-port")]
    metrics_port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tidemark_metrics::init_tracing();

    let cli = Cli::parse();
    let config = ServerConfig {
        secret_key: cli.secret_key,
        port: cli.port,
        data_dir: cli.data,
        flush_interval_secs: cli.flush_interval,
        metrics_port: cli.metrics_port,
    };
    config.validate()?;

    if let Some(metrics_port) = config.metrics_port {
        let metrics_addr: std::net::SocketAddr = format!("0.0.0.0:{}", metrics_port).parse()?;
        tokio::spawn(async move {
            if let Err(e) = tidemark_metrics::serve_metrics(metrics_addr).await {
                tracing::warn!("metrics server failed: {}", e);
            }
        });
    }

    let server = Server::new(config)?;
    let state = server.state();

    tokio::select! {
        result = server.run() => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received Ctrl+C, shutting down");
        }
    }

    state.lock().await.flush_all();
    Ok(())
}
