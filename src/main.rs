use axum::Router;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use embedserve::auth::BearerSecret;
use embedserve::config::ServiceConfig;
use embedserve::embeddings;
use embedserve::manager::ModelManager;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // -----------------------------
    // Logging
    // -----------------------------
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("embedserve=info,tower_http=info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ServiceConfig::from_env()?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        families = ?config.families,
        device = ?config.device,
        "starting embedserve"
    );

    let secret = BearerSecret::new(config.auth_token.clone());
    if !secret.is_configured() {
        warn!("AUTH_TOKEN is not set; batch endpoints will answer 500");
    }

    // -----------------------------
    // Models (loaded once, shared read-only)
    // -----------------------------
    let models = ModelManager::load(&config).await?;

    // -----------------------------
    // Routers
    // -----------------------------
    let app: Router = embeddings::router(&models, secret)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_headers(Any)
                .allow_methods(Any),
        );

    let listener = TcpListener::bind(config.bind_addr).await?;
    info!("🌐 HTTP listening on http://{}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await?;

    Ok(())
}
