//! Experiment flow controller (expflow-ctl) - Main entry point
//!
//! Loads the TOML configuration, builds the configured config source, starts
//! the flow controller against an in-memory trial runner and serves the
//! operator API until interrupted.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use expflow_common::config::{resolve_config_path, SourceConfig, TomlConfig, CONFIG_ENV_VAR};
use expflow_common::events::EventBus;
use expflow_ctl::bridge::TrialCountConfigurator;
use expflow_ctl::runner::{InMemoryRunner, SessionParams};
use expflow_ctl::source::build_source;
use expflow_ctl::{AppState, ControllerOptions, FlowController};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Command-line arguments for expflow-ctl
#[derive(Parser, Debug)]
#[command(name = "expflow-ctl")]
#[command(about = "Experiment flow controller")]
#[command(version)]
struct Args {
    /// Path to the TOML config file
    #[arg(short, long, env = "EXPFLOW_CONFIG")]
    config: Option<PathBuf>,

    /// Port for the operator API (overrides the configured bind address port)
    #[arg(short, long, env = "EXPFLOW_PORT")]
    port: Option<u16>,

    /// Experiment server URL (remote source only)
    #[arg(long, env = "EXPFLOW_SERVER_URL")]
    server_url: Option<String>,

    /// Log level used when RUST_LOG is not set
    #[arg(long, env = "EXPFLOW_LOG_LEVEL")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Config is read before tracing starts so the configured level applies;
    // its own log lines are emitted once the subscriber is up
    let config = TomlConfig::load(args.config.as_deref());
    let level = args
        .log_level
        .clone()
        .or_else(|| config.as_ref().ok().map(|c| c.logging.level.clone()))
        .unwrap_or_else(|| "info".to_string());

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!(
                    "expflow_ctl={level},expflow_common={level},tower_http={level}",
                    level = level
                )
                .into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = config.context("Failed to load configuration")?;
    apply_overrides(&mut config, &args);

    info!("Starting expflow-ctl v{}", env!("CARGO_PKG_VERSION"));

    let event_bus = EventBus::new(config.api.event_capacity);
    let base_dir = config_base_dir(resolve_config_path(args.config.as_deref(), CONFIG_ENV_VAR));
    let source = build_source(&config.source, &event_bus, &base_dir)
        .context("Failed to build config source")?;
    info!(source = source.kind(), "Config source ready");

    let runner = InMemoryRunner::new();
    let options = ControllerOptions::default()
        .with_session_params(SessionParams::from(&config.session))
        .with_configurator(Arc::new(TrialCountConfigurator::new(
            config.runner.default_trials_per_block as usize,
        )))
        .with_event_bus(event_bus);
    let controller = FlowController::spawn(source, Arc::new(runner.clone()), options);

    let app = expflow_ctl::build_router(AppState::new(controller.clone(), runner));

    let addr: SocketAddr = config
        .api
        .bind_addr
        .parse()
        .with_context(|| format!("Invalid bind address {}", config.api.bind_addr))?;
    info!("Starting HTTP server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    controller.shutdown();
    info!("Server shutdown complete");
    Ok(())
}

/// CLI values take precedence over the config file
fn apply_overrides(config: &mut TomlConfig, args: &Args) {
    if let Some(port) = args.port {
        let host = config
            .api
            .bind_addr
            .rsplit_once(':')
            .map(|(host, _)| host.to_string())
            .unwrap_or_else(|| "127.0.0.1".to_string());
        config.api.bind_addr = format!("{}:{}", host, port);
    }

    if let Some(url) = &args.server_url {
        match &mut config.source {
            SourceConfig::Remote { server_url, .. } => *server_url = url.clone(),
            SourceConfig::Local { .. } => {
                warn!("--server-url ignored: config source is local");
            }
        }
    }

    if let Some(level) = &args.log_level {
        config.logging.level = level.clone();
    }
}

/// Directory that relative paths in the config file are resolved against
fn config_base_dir(config_path: Option<PathBuf>) -> PathBuf {
    config_path
        .as_deref()
        .and_then(Path::parent)
        .filter(|dir| !dir.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("Failed to install terminate handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}
