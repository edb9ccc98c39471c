mod asr;
mod billing;
mod clock;
mod config;
mod db;
mod errors;
mod export;
mod extract;
mod identity;
mod interview;
mod invitations;
mod models;
mod response;
mod routes;
mod scheduler;
mod state;
mod tasks;
mod workflow;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::asr::client::AsrClient;
use crate::clock::SystemClock;
use crate::config::Config;
use crate::db::{create_pool, run_migrations};
use crate::export::renderer::RendererClient;
use crate::routes::build_router;
use crate::state::AppState;
use crate::tasks::dispatcher::{self, Dispatcher};
use crate::workflow::client::WorkflowClient;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first (fails on missing required env vars)
    let config = Config::from_env()?;

    // Initialize structured logging
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("{}={}", env!("CARGO_PKG_NAME"), &config.rust_log))
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Hirebase API v{}", env!("CARGO_PKG_VERSION"));

    // Initialize PostgreSQL and bring the schema up to date
    let db = create_pool(&config.database_url).await?;
    run_migrations(&db).await?;

    // Outbound clients
    let asr = AsrClient::new(&config.asr)?;
    let workflow = WorkflowClient::new(
        config.workflow_api_url.clone(),
        config.workers.workflow_timeout,
    )?;
    let renderer = RendererClient::new(
        config.renderer_url.clone(),
        config.workers.renderer_timeout,
    )?;
    info!("Outbound clients initialized");

    let (task_dispatcher, queue) = Dispatcher::channel(config.workers.queue_capacity);

    // Build app state
    let state = AppState {
        db,
        config: config.clone(),
        clock: Arc::new(SystemClock),
        asr,
        workflow,
        renderer,
        dispatcher: task_dispatcher,
    };

    // Background work: task workers plus periodic jobs (sweep, ASR refresh, rescan)
    let workers = dispatcher::start(state.clone(), queue, config.workers.task_workers);
    let periodic = scheduler::spawn_all(&state);

    // Build router
    let app = build_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr: SocketAddr = format!("0.0.0.0:{}", config.port).parse()?;
    info!("Listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // In-flight jobs get a short grace period. Pending rows left behind are
    // rescanned on the next start.
    for handle in periodic {
        handle.abort();
    }
    if tokio::time::timeout(SHUTDOWN_GRACE, workers.wait_for_shutdown())
        .await
        .is_err()
    {
        info!("Task workers still busy after {SHUTDOWN_GRACE:?}, exiting");
    }

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
