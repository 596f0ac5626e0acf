use std::{net::SocketAddr, sync::Arc};

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod api;
mod app_state;
mod config;

use app_state::AppState;
use config::load_settings;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = load_settings()?;
    let state = AppState::open(&settings).await.map_err(|error| {
        error!(
            alignment_database_url = %settings.alignment_database_url,
            review_database_url = %settings.review_database_url,
            %error,
            "failed to open stores; verify parent directories exist and permissions are correct"
        );
        error
    })?;
    let app = api::build_router(Arc::new(state));

    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(%addr, "curation server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
