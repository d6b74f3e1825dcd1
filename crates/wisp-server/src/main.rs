//! wisp-server: presence and neighbor discovery for wisps.
//!
//! Accepts signaling WebSocket connections, keeps one anonymous identity per
//! socket and answers `scout` requests with a random neighbor sample.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use wisp_server::{ServerConfig, SignalingServer};

#[derive(Parser, Debug)]
#[command(name = "wisp-server")]
#[command(about = "Wisp presence and signaling server")]
struct Args {
    /// Address to listen on for signaling connections
    #[arg(short, long, env = "WISP_LISTEN", default_value = "0.0.0.0:8080")]
    listen: String,

    /// Path to a JSON config file
    #[arg(short, long, env = "WISP_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Respects RUST_LOG, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,wisp_server=debug,wisp_core=debug"
    } else {
        "info,wisp_server=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting wisp-server");
    info!("Listen address: {}", args.listen);

    let config = ServerConfig::load(args.config.as_deref())?;
    info!(
        "Sample size: {}, max message size: {} bytes",
        config.sample_size, config.max_message_size
    );

    let mut server = SignalingServer::in_memory(&config);
    let listener = SignalingServer::bind(&args.listen).await?;

    info!("Server running. Press Ctrl+C to stop.");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => server.accept_connection(stream, addr),
                    Err(e) => error!("Failed to accept connection: {}", e),
                }
            }

            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down");
                break;
            }
        }
    }

    server.shutdown().await;
    Ok(())
}
