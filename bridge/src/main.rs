//! Parcel Bridge server binary.

use parcel_bridge::config::Config;
use parcel_bridge::{router, spawn_event_forwarder, AppState};
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "parcel_bridge=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    dotenvy::dotenv().ok();
    let config = Config::from_env()?;
    let addr = format!("{}:{}", config.host, config.port);

    tracing::info!("Starting Parcel Bridge on {}", addr);
    let state = AppState::from_config(config).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker = tokio::spawn(state.queue.clone().run(shutdown_rx));
    let forwarder = spawn_event_forwarder(&state);

    let app = router(state);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Bridge listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
            }
        })
        .await?;

    tracing::info!("Shutting down");
    let _ = shutdown_tx.send(true);
    if let Err(e) = worker.await {
        tracing::error!("Drain worker panicked: {}", e);
    }
    forwarder.abort();

    Ok(())
}
