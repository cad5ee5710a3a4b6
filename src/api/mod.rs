pub mod executions;
pub mod flows;
pub mod middleware;
mod routes;
pub mod scheduler;

use std::fmt::Display;
use std::sync::Arc;

use axum::{Json, Router};
use hyper::StatusCode;
use serde_json::{Value, json};
use tokio::sync::broadcast;

use crate::flows::events::RunEvent;
use crate::flows::repository::FlowRepository;
use crate::flows::runner::FlowRunner;
use crate::flows::scheduler::FlowScheduler;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn FlowRepository>,
    pub runner: FlowRunner,
    pub scheduler: Arc<FlowScheduler>,
    pub events_tx: broadcast::Sender<RunEvent>,
}

pub fn create_app(state: AppState) -> Router {
    routes::build_router(state)
}

pub(crate) type ApiError = (StatusCode, Json<Value>);

pub(crate) fn api_error(status: StatusCode, message: impl Display) -> ApiError {
    (status, Json(json!({ "error": message.to_string() })))
}

pub(crate) fn internal_error(context: &str, e: anyhow::Error) -> ApiError {
    tracing::error!(error = %e, "{context}");
    api_error(
        StatusCode::INTERNAL_SERVER_ERROR,
        format!("{context}: {e}"),
    )
}

#[cfg(test)]
pub(crate) fn test_state(scratch_dir: &std::path::Path) -> AppState {
    use crate::flows::events::EVENT_CHANNEL_CAPACITY;
    use crate::flows::process::ProcessRunner;
    use crate::flows::sqlite_repository::SqliteFlowRepository;
    use std::time::Duration;

    let store: Arc<dyn FlowRepository> = Arc::new(SqliteFlowRepository::in_memory().unwrap());
    let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
    let runner = FlowRunner::new(
        store.clone(),
        Arc::new(ProcessRunner::new(Some(Duration::from_secs(10)))),
        scratch_dir.to_path_buf(),
    )
    .with_events(events_tx.clone());
    let scheduler = Arc::new(FlowScheduler::new(
        store.clone(),
        runner.clone(),
        Duration::from_secs(60),
    ));
    AppState {
        store,
        runner,
        scheduler,
        events_tx,
    }
}
