//! jobcast - analysis job server
//!
//! Accepts analysis requests over HTTP, runs each one as an external
//! process, and streams the process output to any number of WebSocket
//! subscribers. Late subscribers get the full history replayed first.

use clap::Parser as ClapParser;
use jobcast::{
    api, browser,
    config::{self, Config, ConfigError},
    job::JobRunner,
    session::SessionRegistry,
    shutdown::ShutdownCoordinator,
};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// How long running jobs get to record their final state at shutdown.
const RUNNER_GRACE: Duration = Duration::from_secs(5);

/// jobcast - run analysis jobs and stream their output over WebSockets
#[derive(ClapParser, Debug)]
#[command(name = "jobcast", version, about, long_about = None)]
struct Cli {
    /// Address to bind the HTTP/WebSocket server [default: 127.0.0.1:8080]
    #[arg(long, env = "JOBCAST_BIND")]
    bind: Option<SocketAddr>,

    /// Port to listen on when --bind is not given
    #[arg(long, env = "PORT")]
    port: Option<u16>,

    /// Path to the TOML config file
    #[arg(long, env = "JOBCAST_CONFIG")]
    config: Option<PathBuf>,

    /// Open the web UI in the default browser once listening
    #[arg(long)]
    open: bool,

    /// Interpreter to try before the configured candidates
    #[arg(long)]
    python: Option<String>,

    /// Analysis script to try before the configured candidates
    #[arg(long)]
    script: Option<PathBuf>,
}

#[derive(Error, Debug)]
pub enum JobcastError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("task join error: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[tokio::main]
async fn main() -> Result<(), JobcastError> {
    let cli = Cli::parse();
    init_tracing();

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(config::default_config_path);
    let mut config = Config::load_or_default(&config_path)?;
    tracing::debug!(path = %config_path.display(), "loaded config");
    apply_cli(&mut config, &cli);

    run_server(config).await
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "jobcast=info,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Command-line values take precedence over the config file.
fn apply_cli(config: &mut Config, cli: &Cli) {
    if let Some(bind) = cli.bind {
        config.server.bind = bind;
    } else if let Some(port) = cli.port {
        config.server.bind.set_port(port);
    }
    if cli.open {
        config.server.open_browser = true;
    }
    if let Some(python) = &cli.python {
        config.job.interpreters.insert(0, python.clone());
    }
    if let Some(script) = &cli.script {
        config.job.scripts.insert(0, script.clone());
    }
}

/// URL a local browser can reach the server on.
fn browse_url(local: SocketAddr) -> String {
    let host = match local.ip() {
        ip if ip.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
        ip => ip,
    };
    format!("http://{}/", SocketAddr::new(host, local.port()))
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => tracing::info!("received Ctrl+C"),
                    _ = term.recv() => tracing::info!("received SIGTERM"),
                }
                return;
            }
            Err(e) => tracing::warn!(error = %e, "cannot listen for SIGTERM"),
        }
    }
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("received Ctrl+C"),
        Err(e) => tracing::error!(error = %e, "cannot listen for Ctrl+C, shutting down"),
    }
}

// ── Server ─────────────────────────────────────────────────────────

async fn run_server(config: Config) -> Result<(), JobcastError> {
    tracing::info!("jobcast server starting");

    let bind = config.server.bind;
    let sessions = SessionRegistry::with_limits(config.sessions.limits());
    let state = api::AppState {
        sessions: sessions.clone(),
        runner: JobRunner::new(config.job.clone()),
        shutdown: ShutdownCoordinator::new(),
    };

    let app = api::router(
        state.clone(),
        api::RouterConfig {
            bind,
            cors_origins: config.server.cors_origins.clone(),
            rate_limit: Some(config.server.rate_limit),
        },
    );

    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .map_err(|source| JobcastError::Bind { addr: bind, source })?;
    let local = listener.local_addr()?;
    if !local.ip().is_loopback() {
        tracing::warn!(addr = %local, "listening on a non-loopback address without authentication");
    }
    tracing::info!(addr = %local, "HTTP/WS server listening");

    let sweeper_stop = CancellationToken::new();
    let sweeper = config.sessions.ttl().map(|ttl| {
        sessions.spawn_sweeper(ttl, config.sessions.sweep_interval(), sweeper_stop.clone())
    });

    if config.server.open_browser {
        browser::spawn_open(browse_url(local));
    }

    let (server_shutdown_tx, server_shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let http_handle = tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async {
            server_shutdown_rx.await.ok();
        })
        .await
    });

    tracing::info!(url = %browse_url(local), "jobcast server ready");
    shutdown_signal().await;

    // Stop every job and let subscribers see its final event, then close them.
    state.wind_down(RUNNER_GRACE).await;
    // Give handlers a moment to flush close frames before stopping the server
    tokio::time::sleep(Duration::from_millis(100)).await;

    let _ = server_shutdown_tx.send(());
    if let Err(e) = http_handle.await? {
        tracing::warn!(error = %e, "HTTP server stopped with error");
    }

    sweeper_stop.cancel();
    if let Some(sweeper) = sweeper {
        sweeper.await?;
    }
    tracing::info!("jobcast server exiting");
    Ok(())
}
