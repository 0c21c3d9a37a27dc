use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use canopy_hub::{
    AppState, api,
    config::{Config, RepositoryConfig},
    events::ChangeEventBus,
    maintenance,
    registry::{DeviceRepository, InMemoryDeviceRepository, SqliteDeviceRepository},
    transport::TracingTransport,
};
use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "canopy-hub")]
#[command(about = "Canopy device registration and twin sync hub")]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "canopy-hub.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;

    let filter =
        std::env::var("RUST_LOG").unwrap_or_else(|_| "tracing=info,canopy_hub=info".to_owned());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_span_events(tracing_subscriber::fmt::format::FmtSpan::CLOSE)
        .init();

    let cli = Cli::parse();

    let config = if cli.config.exists() {
        info!(path = ?cli.config, "Loading configuration");
        Config::load(&cli.config)?
    } else {
        info!("No configuration file found, using defaults");
        Config::default()
    };

    info!(http_addr = %config.server.http_addr, "Starting hub");

    match &config.repository {
        RepositoryConfig::Memory => {
            info!("Using in-memory device repository");
            run_hub(InMemoryDeviceRepository::new(), &config).await?;
        }
        RepositoryConfig::Sqlite { path } => {
            info!(path = ?path, "Using SQLite device repository");
            let repository = SqliteDeviceRepository::new(path).await?;
            run_hub(repository, &config).await?;
        }
    }

    Ok(())
}

async fn run_hub<R>(repository: R, config: &Config) -> color_eyre::Result<()>
where
    R: DeviceRepository,
{
    let events = ChangeEventBus::new(config.events.capacity);
    let event_stream = events.subscribe();
    let state = AppState::new(repository, TracingTransport, config.sync.policy(), events);

    let registered = state.ledger.refresh_cache().await;
    info!(registered, "Registration cache loaded");

    let cancel = CancellationToken::new();

    let sweep = tokio::spawn(maintenance::run_sync_sweep(
        Arc::clone(&state.synchronizer),
        config.sync.sweep_interval(),
        cancel.clone(),
    ));
    let refresh = tokio::spawn(maintenance::run_cache_refresh(
        Arc::clone(&state.ledger),
        config.ledger.refresh_interval(),
        cancel.clone(),
    ));
    let event_log = tokio::spawn(maintenance::run_event_log(event_stream, cancel.clone()));

    serve_http(state, config.server.http_addr, cancel.clone()).await?;

    cancel.cancel();
    let tasks = [
        ("sync sweep", sweep),
        ("cache refresh", refresh),
        ("event log", event_log),
    ];
    for (name, task) in tasks {
        if let Err(e) = task.await {
            error!(task = name, error = ?e, "Background task failed");
        }
    }

    Ok(())
}

async fn serve_http<R>(
    state: AppState<R, TracingTransport>,
    http_addr: SocketAddr,
    cancel: CancellationToken,
) -> color_eyre::Result<()>
where
    R: DeviceRepository,
{
    let axum_app = api::router().with_state(state);
    let axum_listener = TcpListener::bind(http_addr).await?;
    info!(%http_addr, "HTTP server listening");

    let cancel_for_http = cancel.clone();

    tokio::select! {
        result = axum::serve(axum_listener, axum_app).with_graceful_shutdown(async move {
            cancel_for_http.cancelled().await;
        }) => {
            if let Err(e) = result {
                error!(error = ?e, "HTTP server error");
            }
            info!("HTTP server shut down");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
            cancel.cancel();
        }
    }

    Ok(())
}
