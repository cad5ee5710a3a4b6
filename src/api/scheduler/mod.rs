pub mod handlers;

use axum::Router;
use axum::routing::{get, post};

use crate::api::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/flows/{id}/schedule", get(handlers::get_schedule))
        .route("/scheduler/status", get(handlers::scheduler_status))
        .route("/validate/cron", post(handlers::validate_cron))
}
