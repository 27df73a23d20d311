use std::sync::Arc;

use axum::routing::{get, patch, post};
use axum::Router;

use crate::rest;
use crate::AppState;

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        // Health check
        .route("/", get(|| async { "ok" }))
        // Jobs
        .route("/api/jobs", get(rest::api_jobs).post(rest::api_submit_job))
        .route("/api/jobs/{id}", get(rest::api_job_detail))
        // Registry
        .route("/api/results", get(rest::api_results))
        .route("/api/deltas", get(rest::api_deltas))
        // Schedules
        .route("/api/schedules", post(rest::schedules::api_create_schedule))
        .route(
            "/api/schedules/upcoming",
            get(rest::schedules::api_upcoming_schedules),
        )
        .route(
            "/api/schedules/{id}",
            patch(rest::schedules::api_update_schedule)
                .delete(rest::schedules::api_delete_schedule),
        )
        .with_state(state)
        .layer(
            tower_http::cors::CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
        // Method + path only, no query params
        .layer(
            tower_http::trace::TraceLayer::new_for_http().make_span_with(
                |request: &axum::http::Request<_>| {
                    tracing::info_span!(
                        "http_request",
                        method = %request.method(),
                        path = %request.uri().path(),
                    )
                },
            ),
        )
}
