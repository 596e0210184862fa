//! Gravitag Session Server
//!
//! Binds the WebSocket endpoint and runs until Ctrl-C or SIGTERM.

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use gravitag::{GameServer, ServerConfig, DEFAULT_PORT, SESSION_CAPACITY, TICK_RATE};

/// Command line arguments.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// WebSocket address to bind to
    #[arg(long, env = "GRAVITAG_BIND", default_value_t = SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)))]
    bind: SocketAddr,

    /// Optional address for the read-only status endpoint (GET /players)
    #[arg(long, env = "GRAVITAG_HTTP_BIND")]
    http_bind: Option<SocketAddr>,

    /// Session updates per second
    #[arg(short, long, env = "GRAVITAG_TICK_RATE", default_value_t = TICK_RATE)]
    tick_rate: u32,

    /// Players per session
    #[arg(short, long, env = "GRAVITAG_CAPACITY", default_value_t = SESSION_CAPACITY)]
    capacity: usize,

    /// Maximum concurrent connections
    #[arg(long, env = "GRAVITAG_MAX_CONNECTIONS", default_value_t = 1000)]
    max_connections: usize,
}

impl From<Args> for ServerConfig {
    fn from(args: Args) -> Self {
        Self {
            bind_addr: args.bind,
            http_addr: args.http_bind,
            max_connections: args.max_connections,
            tick_rate: args.tick_rate,
            session_capacity: args.capacity,
            ..Default::default()
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = ServerConfig::from(Args::parse());
    config.validate()?;
    print_banner(&config);

    let server = Arc::new(GameServer::new(config));

    let signal_server = server.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_server.shutdown();
    });

    server.run().await?;
    Ok(())
}

/// Resolves on Ctrl-C or SIGTERM. A handler that fails to install is logged
/// and never fires, so the server keeps running.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl-C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Ctrl-C received, shutting down"),
        _ = terminate => info!("SIGTERM received, shutting down"),
    }
}

fn print_banner(config: &ServerConfig) {
    info!("--------------------------------");
    info!("Gravitag Server v{}", config.version);
    info!("Started at: {}", chrono::Local::now().format("%Y-%m-%d %H:%M:%S"));
    info!("OS: {} ({})", std::env::consts::OS, std::env::consts::ARCH);
    info!(
        "Cores: {}",
        std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
    );
    info!("Bind: {}", config.bind_addr);
    info!("Tick Rate: {} Hz", config.tick_rate);
    info!("Session Capacity: {}", config.session_capacity);
    info!("--------------------------------");
}
