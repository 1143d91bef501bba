use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::{Mutex, broadcast};
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use gridwalk::api;
use gridwalk::backend::HttpBackend;
use gridwalk::config::Config;
use gridwalk::state::{AppState, AppStateInner};

/// Events buffered per `/events` subscriber before it starts missing some.
const EVENT_BUFFER: usize = 256;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,gridwalk=info")),
        )
        .init();

    let config = Config::from_env().context("failed to load configuration")?;

    tracing::info!(
        "gridwalk starting, backend: {}, listen: {}",
        config.backend_url,
        config.listen_addr,
    );
    if let Some(track) = &config.track_file {
        tracing::info!("positions will be replayed from {}", track.display());
    }

    let backend = HttpBackend::new(&config).context("failed to build backend client")?;
    let (events, _) = broadcast::channel(EVENT_BUFFER);

    let state: AppState<HttpBackend> = Arc::new(Mutex::new(AppStateInner::new(
        config.clone(),
        Arc::new(backend),
        events,
    )));

    let app = api::router(state).layer(TraceLayer::new_for_http());

    let listener = TcpListener::bind(&config.listen_addr)
        .await
        .context(format!("failed to bind to {}", config.listen_addr))?;

    tracing::info!("listening on {}", config.listen_addr);

    axum::serve(listener, app)
        .await
        .context("server error")?;

    Ok(())
}
