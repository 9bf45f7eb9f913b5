mod auth;
mod cli;
mod config;
mod daemon;
mod engine;
mod router;
mod websocket;

use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use daemon::timer::Timer;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tracing::Level;

use engine::{DockerEngine, Engine};
use websocket::host::ProcHost;
use websocket::{StreamSettings, StreamState};

/// Sweep interval for expired session keys.
const SESSION_SWEEP_SECS: u64 = 300;

#[derive(Parser)]
#[command(name = "deckhand")]
#[command(about = "Streaming session daemon for a container engine", long_about = None)]
struct Cli {
    #[arg(long = "config", default_value = "config.json")]
    config: String,

    /// Overrides server.host and server.port, e.g. 0.0.0.0:3876
    #[arg(long = "listen")]
    listen: Option<String>,

    /// Engine socket path, overrides docker.socket_path
    #[arg(long = "docker")]
    docker: Option<String>,

    #[arg(long = "dev")]
    dev: bool,

    /// Read a password from stdin and print its bcrypt hash
    #[arg(long = "generate-hash")]
    generate_hash: bool,
}

#[tokio::main]
async fn main() {
    let timer = Timer::start();
    let cli = Cli::parse();

    if cli.generate_hash {
        cli::hash::handle_generate_hash();
        return;
    }

    tracing_subscriber::fmt()
        .with_max_level(if cli.dev { Level::DEBUG } else { Level::INFO })
        .init();

    if let Err(e) = run(cli, timer).await {
        tracing::error!("{:#}", e);
        std::process::exit(1);
    }
}

fn apply_overrides(config: &mut config::config::Config, cli: &Cli) -> anyhow::Result<()> {
    if let Some(listen) = &cli.listen {
        let (host, port) = listen
            .rsplit_once(':')
            .ok_or_else(|| anyhow::anyhow!("--listen expects host:port, got {}", listen))?;
        config.server.host = host.to_string();
        config.server.port = port.parse()?;
    }
    if let Some(socket) = &cli.docker {
        config.docker.socket_path = socket.clone();
    }
    Ok(())
}

async fn run(cli: Cli, timer: Timer) -> anyhow::Result<()> {
    let mut config = config::config::Config::load_or_default(&cli.config)?;
    apply_overrides(&mut config, &cli)?;

    daemon::start::print_banner(&config);
    if let Err(e) = daemon::start::check_storage(&config.storage.base_path).await {
        anyhow::bail!("Storage error! Please double check {}: {:#}", cli.config, e);
    }
    if config.authorization.password_hash.is_empty() {
        tracing::warn!("No password hash configured, logins will be refused. Run with --generate-hash");
    }

    let sessions_db = Path::new(&config.storage.base_path).join("sessions.db");
    let sessions = Arc::new(
        auth::tokens::SessionStore::open(&sessions_db, config.authorization.session_ttl_secs)
            .map_err(|e| anyhow::anyhow!("failed to open session store: {}", e))?,
    );

    let shutdown = CancellationToken::new();

    let sweeper = sessions.clone();
    let sweep_stop = shutdown.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(SESSION_SWEEP_SECS));
        interval.tick().await;
        loop {
            tokio::select! {
                _ = sweep_stop.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = sweeper.cleanup_expired() {
                        tracing::error!("Failed to clean up expired session keys: {}", e);
                    }
                }
            }
        }
    });

    let socket_path = Some(config.docker.socket_path.as_str()).filter(|path| !path.is_empty());
    let engine: Arc<dyn Engine> = Arc::new(DockerEngine::connect(socket_path)?);
    match engine.version().await {
        Ok(version) => tracing::info!("Connected to container engine {}", version),
        Err(e) => {
            eprintln!("✗ Engine Error: {}", e);
            eprintln!("  Please ensure the container engine is running and try again.");
            anyhow::bail!("container engine unreachable");
        }
    }

    let state = StreamState {
        engine,
        host: Arc::new(ProcHost),
        sessions: sessions.clone(),
        settings: StreamSettings::from(&config.streaming),
        shutdown: shutdown.clone(),
    };

    let app = router::public::public_router()
        .merge(router::auth::auth_router(sessions, config.authorization.clone()))
        .merge(websocket::websocket_router(state))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    let addr = config.listen_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| anyhow::anyhow!("failed to bind {}: {}", addr, e))?;
    println!("Total startup time: {}ms\n", timer.elapsed_ms());
    tracing::info!("Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown))
        .await?;

    tracing::info!("Daemon stopped");
    Ok(())
}

/// Resolves on SIGINT or SIGTERM and cancels every streaming connection.
async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for ctrl-c: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutting down");
    shutdown.cancel();
}
