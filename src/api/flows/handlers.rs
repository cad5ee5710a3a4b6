use axum::Json;
use axum::extract::{Path, State};
use chrono::Utc;
use hyper::StatusCode;
use serde::{Deserialize, Deserializer};
use serde_json::{Value, json};

use crate::api::{ApiError, AppState, api_error, internal_error};
use crate::flows::history::RunTrigger;
use crate::flows::repository::DuplicateFlowName;
use crate::flows::runner::RunError;
use crate::flows::{Flow, parse_schedule};

pub(crate) async fn list_flows(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let flows = state
        .store
        .list_flows()
        .await
        .map_err(|e| internal_error("failed to list flows", e))?;

    Ok(Json(json!({ "flows": flows })))
}

pub(crate) async fn get_flow(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Flow>, ApiError> {
    let flow = load_flow(&state, &id).await?;
    Ok(Json(flow))
}

#[derive(Deserialize)]
pub(crate) struct CreateFlowRequest {
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(alias = "binaryPath")]
    binary_path: String,
    #[serde(default)]
    schedule: Option<String>,
}

#[tracing::instrument(skip_all)]
pub(crate) async fn create_flow(
    State(state): State<AppState>,
    Json(body): Json<CreateFlowRequest>,
) -> Result<(StatusCode, Json<Flow>), ApiError> {
    let name = required("name", &body.name)?;
    let binary_path = required("binary_path", &body.binary_path)?;
    check_schedule(body.schedule.as_deref())?;

    let flow = Flow::new(
        name,
        binary_path,
        non_blank(body.description),
        body.schedule,
    );
    state
        .store
        .create_flow(flow.clone())
        .await
        .map_err(write_error)?;

    Ok((StatusCode::CREATED, Json(flow)))
}

/// Distinguishes an absent field (`None`) from an explicit `null`
/// (`Some(None)`).
fn double_option<'de, T, D>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

#[derive(Deserialize)]
pub(crate) struct UpdateFlowRequest {
    #[serde(default)]
    name: Option<String>,
    #[serde(default, deserialize_with = "double_option")]
    description: Option<Option<String>>,
    #[serde(default, alias = "binaryPath")]
    binary_path: Option<String>,
    #[serde(default, deserialize_with = "double_option")]
    schedule: Option<Option<String>>,
}

#[tracing::instrument(skip_all)]
pub(crate) async fn update_flow(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<UpdateFlowRequest>,
) -> Result<Json<Flow>, ApiError> {
    let mut flow = load_flow(&state, &id).await?;
    let now = Utc::now();

    if let Some(name) = &body.name {
        flow.name = required("name", name)?.to_string();
    }
    if let Some(binary_path) = &body.binary_path {
        flow.binary_path = required("binary_path", binary_path)?.to_string();
    }
    if let Some(description) = body.description {
        flow.description = non_blank(description);
    }
    if let Some(schedule) = body.schedule {
        check_schedule(schedule.as_deref())?;
        flow.set_schedule(schedule, now);
    }
    flow.updated_at = now;

    state.store.save_flow(flow).await.map_err(write_error)?;

    // The stored row may carry a next run the scheduler advanced meanwhile.
    let saved = load_flow(&state, &id).await?;
    Ok(Json(saved))
}

pub(crate) async fn delete_flow(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let existed = state
        .store
        .delete_flow(&id)
        .await
        .map_err(|e| internal_error("failed to delete flow", e))?;

    if !existed {
        return Err(api_error(StatusCode::NOT_FOUND, "flow not found"));
    }

    tracing::info!(flow_id = %id, "Deleted flow");
    Ok(Json(json!({ "deleted": true })))
}

#[tracing::instrument(skip_all)]
pub(crate) async fn execute_flow(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    match state.runner.start(&id, RunTrigger::Manual).await {
        Ok(execution) => Ok(Json(json!({
            "message": "Flow execution started",
            "execution_id": execution.id,
        }))),
        Err(e @ RunError::FlowNotFound(_)) => Err(api_error(StatusCode::NOT_FOUND, e)),
        Err(e @ RunError::AlreadyRunning(_)) => Err(api_error(StatusCode::CONFLICT, e)),
        Err(RunError::Store(e)) => Err(internal_error("failed to start flow", e)),
    }
}

async fn load_flow(state: &AppState, id: &str) -> Result<Flow, ApiError> {
    state
        .store
        .get_flow(id)
        .await
        .map_err(|e| internal_error("failed to load flow", e))?
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "flow not found"))
}

fn required<'a>(field: &str, value: &'a str) -> Result<&'a str, ApiError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            format!("{field} must not be empty"),
        ));
    }
    Ok(value)
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn check_schedule(schedule: Option<&str>) -> Result<(), ApiError> {
    match schedule.map(str::trim).filter(|s| !s.is_empty()) {
        Some(expr) => parse_schedule(expr)
            .map(|_| ())
            .map_err(|e| api_error(StatusCode::BAD_REQUEST, e)),
        None => Ok(()),
    }
}

fn write_error(e: anyhow::Error) -> ApiError {
    if let Some(dup) = e.downcast_ref::<DuplicateFlowName>() {
        return api_error(StatusCode::CONFLICT, dup);
    }
    internal_error("failed to save flow", e)
}
