use std::sync::Arc;

use axum::{
    Router,
    routing::{get, post},
};
use pipewatch_jobs::JobSys;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::Level;

use crate::handlers;

pub fn api_router(jobs: Arc<JobSys>) -> Router {
    Router::new()
        .route("/health/live", get(handlers::health::health_live))
        .route(
            "/api/v1/jobs",
            get(handlers::jobs::list_jobs).post(handlers::jobs::submit_job),
        )
        .route(
            "/api/v1/jobs/{job_id}",
            get(handlers::jobs::get_job).delete(handlers::jobs::delete_job),
        )
        .route(
            "/api/v1/jobs/{job_id}/cancel",
            post(handlers::jobs::cancel_job),
        )
        .route("/api/v1/jobs/{job_id}/log", get(handlers::jobs::job_log))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .with_state(jobs)
}
