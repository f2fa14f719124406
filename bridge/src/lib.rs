//! Parcel Bridge - durable offline writes for Parse-compatible backends.
//!
//! Clients reach the bridge over HTTP (`POST /call/{method}`) or a
//! WebSocket (`/ws`). Writes queued with `saveEventually` and
//! `deleteEventually` survive restarts and are replayed against the backend
//! by a background worker until they commit or fail for good.

pub mod auth;
pub mod backend;
pub mod config;
pub mod db;
pub mod dispatcher;
pub mod error;
pub mod executor;
pub mod handlers;
pub mod identities;
pub mod queue;
pub mod routes;
pub mod session;
pub mod websocket;

use crate::backend::{Backend, MemoryBackend, RestBackend};
use crate::config::{BackendKind, Config};
use crate::db::Pool;
use crate::dispatcher::Dispatcher;
use crate::error::{AppError, Result};
use crate::executor::CommandExecutor;
use crate::identities::Identities;
use crate::queue::EventuallyQueue;
use crate::session::Session;
use crate::websocket::{ConnectionManager, ServerMessage};
use axum::Router;
use parcel_engine::LocalHandle;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub pool: Pool,
    pub config: Arc<Config>,
    pub dispatcher: Arc<Dispatcher>,
    pub queue: Arc<EventuallyQueue>,
    pub conn_manager: Arc<ConnectionManager>,
}

impl AppState {
    /// Open the database and wire every component against `backend`.
    pub async fn build(config: Config, backend: Arc<dyn Backend>) -> Result<Self> {
        let pool = db::create_pool(&config.database_url).await?;
        tracing::info!("Running database migrations...");
        db::run_migrations(&pool).await?;

        // Every persisted handle is reserved before anything new is allocated.
        let identities = Arc::new(Identities::load(pool.clone()).await?);
        if let Some(max) = db::max_command_target(&pool).await? {
            LocalHandle::reserve_through(max);
        }
        let session = Arc::new(Session::load(pool.clone()).await?);

        let executor = Arc::new(CommandExecutor::new(
            backend,
            identities.clone(),
            session.clone(),
            config.request_timeout,
        ));
        let queue = Arc::new(
            EventuallyQueue::load(
                pool.clone(),
                identities.clone(),
                executor.clone(),
                config.retry.clone(),
                config.drain_parallelism,
                config.drain_interval,
            )
            .await?,
        );
        let dispatcher = Arc::new(Dispatcher::new(
            executor,
            queue.clone(),
            identities,
            session,
            config.device_type.clone(),
        ));

        Ok(Self {
            pool,
            config: Arc::new(config),
            dispatcher,
            queue,
            conn_manager: ConnectionManager::new_shared(),
        })
    }

    /// Build with the backend named by the configuration.
    pub async fn from_config(config: Config) -> Result<Self> {
        let backend: Arc<dyn Backend> = match config.backend {
            BackendKind::Rest => {
                let server_url = config
                    .server_url
                    .clone()
                    .ok_or_else(|| AppError::Internal("PARSE_SERVER_URL is not set".into()))?;
                let application_id = config
                    .application_id
                    .clone()
                    .ok_or_else(|| AppError::Internal("PARSE_APPLICATION_ID is not set".into()))?;
                tracing::info!(server_url = %server_url, "Using REST backend");
                Arc::new(RestBackend::new(
                    server_url,
                    application_id,
                    config.client_key.clone(),
                    config.request_timeout,
                )?)
            }
            BackendKind::Memory => {
                tracing::warn!("Using in-memory backend; nothing leaves this process");
                Arc::new(MemoryBackend::new())
            }
        };
        Self::build(config, backend).await
    }
}

/// The HTTP application.
pub fn router(state: AppState) -> Router {
    Router::new()
        .merge(routes::create_routes())
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Push every queue event to the open WebSocket connections.
pub fn spawn_event_forwarder(state: &AppState) -> JoinHandle<()> {
    let mut events = state.queue.subscribe();
    let conn_manager = state.conn_manager.clone();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    let sent = conn_manager.broadcast_all(ServerMessage::QueueEvent(event));
                    tracing::trace!(sent_to = sent, "Forwarded queue event");
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event forwarder lagged behind");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}
