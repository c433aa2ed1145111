use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use sori_server::{AppState, ServerConfig, create_app};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = ServerConfig::from_env()?;
    let bind_addr = config.bind_addr;
    tracing::info!(
        %bind_addr,
        provider_base = %config.provider_base,
        token_rpm = config.token_requests_per_minute,
        "starting sori token server"
    );

    let app = create_app(Arc::new(AppState::new(config)));
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
