mod api;
mod broadcast;
mod claims;
mod config;
mod error;
mod git;
mod gitlock;
mod ids;
mod loop_detect;
mod orchestrator;
mod persistence;
mod providers;
mod sandbox;
mod state;
mod watcher;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use config::ServerConfig;
use orchestrator::Orchestrator;
use providers::ProviderRegistry;

#[derive(Parser)]
#[command(name = "autodev-orchestrator", about = "Orchestrate autonomous coding agents across projects")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the orchestrator's HTTP + WebSocket server
    Serve {
        /// Bind address (overrides forge-server.toml)
        #[arg(long)]
        bind: Option<String>,
        /// Port (overrides forge-server.toml)
        #[arg(long)]
        port: Option<u16>,
        /// Data directory for project/feature/session/log storage
        #[arg(long)]
        data_dir: Option<PathBuf>,
        /// Path to the server config file
        #[arg(long, default_value = "forge-server.toml")]
        config: PathBuf,
        /// Bearer/query auth token (overrides forge-server.toml and AUTODEV_TOKEN)
        #[arg(long)]
        token: Option<String>,
        /// Enable verbose (debug) logging
        #[arg(short, long)]
        verbose: bool,
    },
}

fn main() {
    let cli = Cli::parse();
    match cli.command {
        Commands::Serve { bind, port, data_dir, config, token, verbose } => {
            init_tracing(verbose);
            cmd_serve(bind, port, data_dir, config, token);
        }
    }
}

fn init_tracing(verbose: bool) {
    let default_filter = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()))
        .init();
}

fn cmd_serve(
    bind: Option<String>,
    port: Option<u16>,
    data_dir: Option<PathBuf>,
    config_path: PathBuf,
    token: Option<String>,
) {
    let runtime = tokio::runtime::Runtime::new().expect("failed to start tokio runtime");
    runtime.block_on(async move {
        let mut config = ServerConfig::load_or_default(&config_path).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "failed to load server config, using defaults");
            ServerConfig::default()
        });
        if let Some(bind) = bind {
            config.bind = bind;
        }
        if let Some(port) = port {
            config.port = port;
        }
        if let Some(data_dir) = data_dir {
            config.data_dir = data_dir;
        }
        if let Some(token) = token {
            config.token = Some(token);
        }

        let persistence = Arc::new(persistence::Persistence::new(config.data_dir.clone()));
        let hub = Arc::new(broadcast::BroadcastHub::new());
        let providers = Arc::new(ProviderRegistry::with_builtin_adapters());
        let orchestrator = Orchestrator::new(
            Arc::clone(&persistence),
            Arc::clone(&hub),
            Arc::clone(&providers),
            config.orchestrator.clone(),
        );

        if let Err(e) = orchestrator.init_recovery().await {
            tracing::error!(error = %e, "orphan recovery failed");
        }

        let addr: SocketAddr = format!("{}:{}", config.bind, config.port)
            .parse()
            .expect("invalid bind address/port");
        let state = Arc::new(api::AppState { orchestrator, token: config.token.clone() });
        let app = api::router(state);

        tracing::info!(%addr, data_dir = %config.data_dir.display(), "autodev-orchestrator listening");
        let listener = tokio::net::TcpListener::bind(addr).await.expect("failed to bind address");

        let (shutdown_tx, mut shutdown_rx) = tokio::sync::watch::channel(false);
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            let _ = shutdown_tx.send(true);
        });

        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.wait_for(|v| *v).await;
            })
            .await
        {
            tracing::error!(error = %e, "server exited with error");
        }
    });
}
