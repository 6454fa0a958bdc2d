use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use pipewatch_common::Job;
use pipewatch_jobs::{JobSys, launcher::LaunchRequest};

use crate::{
    handlers::ApiError,
    types::{CancelResponse, DeleteResponse, LogQuery, LogResponse},
};

pub async fn list_jobs(State(jobs): State<Arc<JobSys>>) -> Result<Json<Vec<Job>>, ApiError> {
    Ok(Json(jobs.list().await?))
}

pub async fn submit_job(
    State(jobs): State<Arc<JobSys>>,
    Json(payload): Json<LaunchRequest>,
) -> Result<(StatusCode, Json<Job>), ApiError> {
    let job = jobs.submit(payload).await?;
    Ok((StatusCode::CREATED, Json(job)))
}

pub async fn get_job(
    State(jobs): State<Arc<JobSys>>,
    Path(job_id): Path<String>,
) -> Result<Json<Job>, ApiError> {
    Ok(Json(jobs.get(&job_id).await?))
}

pub async fn delete_job(
    State(jobs): State<Arc<JobSys>>,
    Path(job_id): Path<String>,
) -> Result<Json<DeleteResponse>, ApiError> {
    let deleted = jobs.delete(&job_id).await?;
    Ok(Json(DeleteResponse { deleted }))
}

pub async fn cancel_job(
    State(jobs): State<Arc<JobSys>>,
    Path(job_id): Path<String>,
) -> Result<Json<CancelResponse>, ApiError> {
    let cancelled = jobs.cancel(&job_id).await?;
    Ok(Json(CancelResponse { cancelled }))
}

pub async fn job_log(
    State(jobs): State<Arc<JobSys>>,
    Path(job_id): Path<String>,
    Query(query): Query<LogQuery>,
) -> Result<Json<LogResponse>, ApiError> {
    let lines = jobs.log_excerpt(&job_id, query.lines).await?;
    Ok(Json(LogResponse { lines }))
}
