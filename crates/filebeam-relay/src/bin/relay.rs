//! Filebeam Relay
//!
//! WebSocket signaling relay plus static file server for the Filebeam client.
//!
//! # Usage
//!
//! ```bash
//! # Defaults: port 5000 (or $PORT), all interfaces, ./public
//! filebeam-relay
//!
//! # Explicit settings
//! filebeam-relay --port 8080 --public-dir /srv/filebeam
//!
//! # From a TOML file, with CLI flags taking priority
//! filebeam-relay --config /etc/filebeam/relay.toml
//! ```

use std::net::IpAddr;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tokio::signal;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use filebeam_relay::{RelayConfig, RelayError, RelayServer};

#[derive(Parser, Debug)]
#[command(name = "filebeam-relay")]
#[command(about = "Filebeam signaling relay and static file server")]
#[command(version)]
struct Args {
    /// Port to listen on [default: 5000]
    #[arg(short, long, env = "PORT")]
    port: Option<u16>,

    /// Bind address [default: 0.0.0.0]
    #[arg(short, long, env = "BIND")]
    bind: Option<IpAddr>,

    /// Directory of client assets served over HTTP [default: public]
    #[arg(long, env = "PUBLIC_DIR")]
    public_dir: Option<PathBuf>,

    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Print a sample configuration file and exit
    #[arg(long)]
    print_config: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    if args.print_config {
        print!("{}", RelayConfig::sample());
        return ExitCode::SUCCESS;
    }

    let default_level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(default_level.into())
                .from_env_lossy(),
        )
        .init();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(RelayError::PortInUse { port }) => {
            error!(
                "Port {} is already in use. Please use a different port.",
                port
            );
            ExitCode::FAILURE
        }
        Err(e) => {
            error!("Server error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<(), RelayError> {
    let config = match &args.config {
        Some(path) => RelayConfig::load_from(path)?,
        None => RelayConfig::default(),
    }
    .with_overrides(args.port, args.bind, args.public_dir);

    info!("Server is starting...");

    let server = RelayServer::bind(config).await?;
    if let Ok(addr) = server.local_addr() {
        info!("Server is running on http://{}", addr);
    }

    server
        .serve_with_shutdown(async {
            if let Err(e) = signal::ctrl_c().await {
                error!("Failed to listen for Ctrl+C: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await;

    Ok(())
}
