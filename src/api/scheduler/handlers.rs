use axum::Json;
use axum::extract::{Path, State};
use chrono::Utc;
use hyper::StatusCode;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::api::{ApiError, AppState, api_error, internal_error};
use crate::flows::upcoming_runs;

const PREVIEW_RUNS: usize = 5;

/// GET /flows/{id}/schedule: stored next run plus the next five fire times
pub(crate) async fn get_schedule(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let flow = state
        .store
        .get_flow(&id)
        .await
        .map_err(|e| internal_error("failed to load flow", e))?
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "flow not found"))?;

    let Some(schedule) = flow.schedule.as_deref() else {
        return Ok(Json(json!({
            "flow_id": id,
            "schedule": null,
            "next_run": null,
            "next_runs": [],
        })));
    };

    let next_runs = upcoming_runs(schedule, &Utc::now(), PREVIEW_RUNS).unwrap_or_default();

    Ok(Json(json!({
        "flow_id": id,
        "schedule": schedule,
        "next_run": flow.next_run,
        "next_runs": next_runs,
        "error": flow.schedule_error,
    })))
}

/// GET /scheduler/status: timer state, in-flight runs and per-flow next runs
pub(crate) async fn scheduler_status(
    State(state): State<AppState>,
) -> Result<Json<Value>, ApiError> {
    let flows = state
        .store
        .list_flows()
        .await
        .map_err(|e| internal_error("failed to list flows", e))?;
    let active_runs = state.runner.active_runs().await;

    let flow_statuses: Vec<Value> = flows
        .iter()
        .map(|f| {
            json!({
                "flow_id": f.id,
                "name": f.name,
                "status": f.status,
                "schedule": f.schedule,
                "next_run": f.next_run,
                "last_run": f.last_run,
            })
        })
        .collect();

    Ok(Json(json!({
        "running": state.scheduler.is_running().await,
        "interval_secs": state.scheduler.interval().as_secs(),
        "last_tick": state.scheduler.last_tick().await,
        "active_runs": active_runs,
        "total_flows": flows.len(),
        "flows": flow_statuses,
    })))
}

#[derive(Deserialize)]
pub(crate) struct ValidateCronRequest {
    expression: String,
}

/// POST /validate/cron: validate a cron expression and return next 5 fire times
pub(crate) async fn validate_cron(Json(body): Json<ValidateCronRequest>) -> Json<Value> {
    let expr = body.expression.trim();

    if expr.is_empty() {
        return Json(json!({
            "valid": false,
            "error": "empty expression",
            "next_runs": [],
        }));
    }

    match upcoming_runs(expr, &Utc::now(), PREVIEW_RUNS) {
        Ok(next_runs) => Json(json!({
            "valid": true,
            "expression": expr,
            "next_runs": next_runs,
        })),
        Err(e) => Json(json!({
            "valid": false,
            "expression": expr,
            "error": format!("{e}"),
            "next_runs": [],
        })),
    }
}
