use apuntador_server::{api, config::AppConfig, AppState};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::load()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone())),
        )
        .init();

    info!(
        "Starting Apuntador control plane on {}:{}",
        config.host, config.port
    );

    let state = AppState::from_config(config.clone()).await?;
    state
        .ca
        .ensure_provisioned(config.auto_create_resources)
        .await?;

    let app = api::build_router(state);
    let listener = tokio::net::TcpListener::bind((config.host.as_str(), config.port)).await?;
    info!("Listening on {}", listener.local_addr()?);

    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}
