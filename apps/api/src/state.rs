use std::sync::Arc;

use sqlx::PgPool;

use crate::asr::client::AsrClient;
use crate::clock::Clock;
use crate::config::Config;
use crate::export::renderer::RendererClient;
use crate::tasks::dispatcher::Dispatcher;
use crate::workflow::client::WorkflowClient;

/// Shared application state injected into all route handlers via Axum extractors.
#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub config: Config,
    pub clock: Arc<dyn Clock>,
    pub asr: AsrClient,
    pub workflow: WorkflowClient,
    pub renderer: RendererClient,
    /// Wakes the task workers. The task tables remain the source of truth.
    pub dispatcher: Dispatcher,
}

/// State over a lazily-connected pool; nothing touches the network until a
/// query runs.
#[cfg(test)]
pub fn test_state() -> AppState {
    let config = Config::for_tests();
    let db = sqlx::postgres::PgPoolOptions::new()
        .connect_lazy(&config.database_url)
        .expect("lazy pool");
    test_state_with(db)
}

/// State over a caller-supplied pool, for tests that run real queries.
#[cfg(test)]
pub fn test_state_with(db: PgPool) -> AppState {
    use crate::clock::FixedClock;
    use chrono::TimeZone;

    let config = Config::for_tests();
    let (dispatcher, _queue) = Dispatcher::channel(config.workers.queue_capacity);

    AppState {
        db,
        asr: AsrClient::new(&config.asr).expect("asr client"),
        workflow: WorkflowClient::new(config.workflow_api_url.clone(), config.workers.workflow_timeout)
            .expect("workflow client"),
        renderer: RendererClient::new(config.renderer_url.clone(), config.workers.renderer_timeout)
            .expect("renderer client"),
        clock: Arc::new(FixedClock(
            chrono::Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
        )),
        dispatcher,
        config,
    }
}
