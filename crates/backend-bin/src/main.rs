use anyhow::Context;
use backend_lib::{
    config::{LogFormat, Settings, StorageBackend, DEFAULT_CONFIG_FILE},
    storage::{FlatFileStorage, MemoryStorage, Storage},
    ws_router, AppState,
};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

/// Chat relay WebSocket server
#[derive(Debug, Parser)]
#[command(version)]
struct Args {
    /// TOML config file
    #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Address to listen on, overrides `bind_addr`
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Data directory for the file backend, overrides `storage.path`
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut settings = Settings::load_from(&args.config)
        .with_context(|| format!("loading settings from {}", args.config.display()))?;
    if let Some(bind) = args.bind {
        settings.bind_addr = bind;
    }
    if let Some(data_dir) = args.data_dir {
        settings.storage.path = data_dir;
    }

    init_tracing(&settings);

    match settings.storage.backend {
        StorageBackend::File => {
            let storage = FlatFileStorage::new(&settings.storage.path).with_context(|| {
                format!("opening data directory {}", settings.storage.path.display())
            })?;
            serve(storage, settings).await
        },
        StorageBackend::Memory => {
            tracing::warn!("Using in-memory storage; messages are lost on restart");
            serve(MemoryStorage::new(), settings).await
        },
    }
}

fn init_tracing(settings: &Settings) {
    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(settings.log_level.to_lowercase()));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match settings.log_format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.init(),
    }
}

async fn serve<S: Storage + Clone + 'static>(storage: S, settings: Settings) -> anyhow::Result<()> {
    let addr = settings.bind_addr;
    let state = Arc::new(AppState::new(storage, settings)?);
    let connections = state.connections.clone();

    let app = ws_router::create_router(state);

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    tracing::info!("Listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {e}");
                std::future::pending::<()>().await;
            }
            tracing::info!("Shutdown requested");
            connections.shutdown();
        })
        .await?;

    tracing::info!("Server stopped");
    Ok(())
}
