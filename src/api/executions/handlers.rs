use std::convert::Infallible;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::Stream;
use hyper::StatusCode;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::broadcast::error::RecvError;

use crate::api::{ApiError, AppState, api_error, internal_error};
use crate::flows::history::{DEFAULT_LIST_LIMIT, Execution};

const MAX_LIST_LIMIT: usize = 1000;

#[derive(Deserialize)]
pub(crate) struct ListQuery {
    limit: Option<usize>,
}

impl ListQuery {
    fn limit(&self) -> usize {
        self.limit
            .filter(|l| *l > 0)
            .unwrap_or(DEFAULT_LIST_LIMIT)
            .min(MAX_LIST_LIMIT)
    }
}

pub(crate) async fn list_executions(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Value>, ApiError> {
    let executions = state
        .store
        .list_executions(query.limit())
        .await
        .map_err(|e| internal_error("failed to list executions", e))?;

    Ok(Json(json!({ "executions": executions })))
}

/// Executions outlive their flow, so an unknown flow id is an empty list.
pub(crate) async fn list_flow_executions(
    State(state): State<AppState>,
    Path(flow_id): Path<String>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Value>, ApiError> {
    let executions = state
        .store
        .list_flow_executions(&flow_id, query.limit())
        .await
        .map_err(|e| internal_error("failed to list executions", e))?;

    Ok(Json(json!({
        "flow_id": flow_id,
        "executions": executions,
    })))
}

pub(crate) async fn get_execution(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Execution>, ApiError> {
    let execution = load_execution(&state, &id).await?;
    Ok(Json(execution))
}

pub(crate) async fn delete_execution(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let execution = load_execution(&state, &id).await?;
    if !execution.status.is_terminal() {
        return Err(api_error(
            StatusCode::CONFLICT,
            "execution is still running",
        ));
    }

    let existed = state
        .store
        .delete_execution(&id)
        .await
        .map_err(|e| internal_error("failed to delete execution", e))?;
    if !existed {
        return Err(api_error(StatusCode::NOT_FOUND, "execution not found"));
    }

    tracing::info!(execution_id = %id, "Deleted execution");
    Ok(Json(json!({ "deleted": true })))
}

#[derive(Deserialize)]
pub(crate) struct LiveQuery {
    flow_id: Option<String>,
}

/// SSE feed of run lifecycle events, optionally narrowed to one flow.
pub(crate) async fn stream_executions(
    State(state): State<AppState>,
    Query(query): Query<LiveQuery>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut rx = state.events_tx.subscribe();
    let flow_filter = query.flow_id;
    let stream = async_stream::stream! {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if flow_filter.as_ref().is_some_and(|id| *id != event.flow_id) {
                        continue;
                    }
                    let sse_event_name = event.event_type.as_sse_event();
                    let data = serde_json::to_string(&event).unwrap_or_default();
                    yield Ok(Event::default().event(sse_event_name).data(data));
                }
                Err(RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "SSE subscriber lagged");
                    continue;
                }
                Err(RecvError::Closed) => {
                    break;
                }
            }
        }
    };
    Sse::new(stream).keep_alive(KeepAlive::new().interval(std::time::Duration::from_secs(15)))
}

async fn load_execution(state: &AppState, id: &str) -> Result<Execution, ApiError> {
    state
        .store
        .get_execution(id)
        .await
        .map_err(|e| internal_error("failed to load execution", e))?
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "execution not found"))
}
