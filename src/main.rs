use std::sync::Arc;

use edchat::chat::registry::ConnectionRegistry;
use edchat::chat::store::SqliteStore;
use edchat::config::Config;
use edchat::AppState;
use sqlx::sqlite::SqlitePoolOptions;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("edchat=info")),
        )
        .init();

    let config = Config::from_env()?;

    let pool = SqlitePoolOptions::new()
        .max_connections(16)
        .connect(&config.database_url)
        .await?;
    let store = SqliteStore::new(pool);
    store.migrate().await?;

    let state = AppState {
        store: Arc::new(store),
        registry: ConnectionRegistry::new(),
        config: Arc::new(config.clone()),
    };

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    tracing::info!(addr = %config.bind_addr, fanout = ?config.fanout, "edchat listening");

    let registry = state.registry.clone();
    axum::serve(listener, edchat::app(state))
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down, closing live channels");
            registry.disconnect_all();
        })
        .await?;

    Ok(())
}
