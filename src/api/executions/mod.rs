pub mod handlers;

use axum::Router;
use axum::routing::get;

use crate::api::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/executions", get(handlers::list_executions))
        // Static segments take precedence over `{id}`.
        .route("/executions/live", get(handlers::stream_executions))
        .route(
            "/executions/flow/{flow_id}",
            get(handlers::list_flow_executions),
        )
        .route(
            "/executions/{id}",
            get(handlers::get_execution).delete(handlers::delete_execution),
        )
}
