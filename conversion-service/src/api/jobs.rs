//! Job API endpoints.
//!
//! Submit, poll, fetch the result of, and cancel asynchronous conversions.

use axum::{
    Json,
    extract::{Multipart, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

use crate::engine::ConversionOutput;
use crate::error::ApiError;
use crate::jobs::{JobError, JobRecord, JobStatus};
use crate::service::{ConvertResponse, JobOutcome};

use super::{AppState, read_upload};

/// Response for a submitted job
#[derive(Serialize)]
pub struct SubmitJobResponse {
    pub job_id: String,
    pub status: JobStatus,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

/// Polling snapshot of a job
#[derive(Serialize)]
pub struct JobStatusResponse {
    pub job_id: String,
    pub status: JobStatus,
    pub progress: u8,
    pub current_step: Option<u32>,
    pub total_steps: Option<u32>,
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub attempt: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
}

impl From<JobRecord> for JobStatusResponse {
    fn from(record: JobRecord) -> Self {
        Self {
            job_id: record.id,
            status: record.status,
            progress: record.progress,
            current_step: record.current_step,
            total_steps: record.total_steps,
            message: record.message,
            created_at: record.created_at,
            started_at: record.started_at,
            completed_at: record.completed_at,
            attempt: record.attempt,
            error: record.error,
        }
    }
}

/// Result of a finished job
#[derive(Serialize)]
pub struct JobResultResponse {
    pub job_id: String,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
}

#[derive(Serialize)]
struct NotReadyResponse {
    job_id: String,
    status: JobStatus,
    progress: u8,
    message: String,
}

/// Response for delete operations
#[derive(Serialize)]
pub struct DeleteJobResponse {
    pub job_id: String,
    pub deleted: bool,
    pub message: String,
}

/// Submit a file for background conversion
pub async fn submit_job_handler(
    State(state): State<Arc<AppState>>,
    multipart: Multipart,
) -> Result<Json<SubmitJobResponse>, ApiError> {
    let upload = read_upload(&state, multipart).await?;
    let record = state
        .service
        .submit_job(upload)
        .map_err(|e| state.api_error(e))?;

    Ok(Json(SubmitJobResponse {
        job_id: record.id,
        status: record.status,
        message: "Job submitted. Poll /jobs/{job_id} for status.".to_string(),
        created_at: record.created_at,
    }))
}

/// Get the status of a job
pub async fn get_job_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<JobStatusResponse>, ApiError> {
    let record = state
        .service
        .job_status(&id)
        .map_err(|e| state.api_error(e))?;
    Ok(Json(record.into()))
}

/// Get the result of a job: 202 until it finishes
pub async fn get_job_result_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let outcome = state
        .service
        .job_result(&id)
        .map_err(|e| state.api_error(e))?;

    let response = match outcome {
        JobOutcome::NotReady(record) => {
            let message = match record.status {
                JobStatus::Pending => "Job is still pending. Please wait and check status.",
                _ => "Job is still processing. Please wait and check status.",
            };
            (
                StatusCode::ACCEPTED,
                Json(NotReadyResponse {
                    job_id: record.id,
                    status: record.status,
                    progress: record.progress,
                    message: message.to_string(),
                }),
            )
                .into_response()
        }
        JobOutcome::Completed { record, result } => {
            // Engine output is shaped like a synchronous conversion; anything
            // else is passed through untouched
            let result = match serde_json::from_value::<ConversionOutput>(result.clone()) {
                Ok(output) => serde_json::to_value(ConvertResponse::from_output(output))
                    .unwrap_or(result),
                Err(_) => result,
            };
            Json(JobResultResponse {
                job_id: record.id,
                status: record.status,
                result: Some(result),
                error: None,
            })
            .into_response()
        }
        JobOutcome::Failed { record, error } | JobOutcome::Cancelled { record, error } => {
            Json(JobResultResponse {
                job_id: record.id,
                status: record.status,
                result: None,
                error: Some(error),
            })
            .into_response()
        }
    };

    Ok(response)
}

/// Cancel a running job or delete a finished one
pub async fn cancel_job_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<DeleteJobResponse>, ApiError> {
    let outcome = state
        .service
        .cancel_job(&id)
        .await
        .map_err(|e| state.api_error(e))?;

    Ok(Json(DeleteJobResponse {
        job_id: id,
        deleted: true,
        message: outcome.message().to_string(),
    }))
}
