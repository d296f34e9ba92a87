use refill_server::config::Config;
use refill_server::handlers::{self, AppState};
use refill_server::store::PgStore;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env().map_err(anyhow::Error::msg)?;

    // Database connection
    let pool = PgPoolOptions::new()
        .max_connections(config.db.max_connections)
        .connect(&config.db.connection_string())
        .await?;

    let store = PgStore::new(pool);
    store.migrate().await?;

    let app = handlers::router(AppState::new(Arc::new(store)));

    // Run the server
    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    tracing::info!("Refill server running on http://{}", config.bind_addr);

    axum::serve(listener, app).await?;

    Ok(())
}
