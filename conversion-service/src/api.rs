//! HTTP API for the conversion service.
//!
//! This module provides the REST API endpoints for:
//! - Health and metrics monitoring
//! - Synchronous conversion
//! - Asynchronous conversion jobs

use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, Multipart, State},
    http::{StatusCode, header},
    response::IntoResponse,
    routing::{get, post},
};
use chrono::Utc;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::engine::ConversionOptions;
use crate::error::{ApiError, ServiceError};
use crate::jobs::{JobStatus, WorkerPool};
use crate::service::validation::{parse_flag, parse_output_format};
use crate::service::{ConversionService, Upload};

pub mod convert;
pub mod jobs;
use convert::convert_handler;
use jobs::{cancel_job_handler, get_job_handler, get_job_result_handler, submit_job_handler};

/// Headroom over the upload limit for multipart framing and form fields
const MULTIPART_OVERHEAD_BYTES: usize = 1024 * 1024;

/// Application state
pub struct AppState {
    pub service: Arc<ConversionService>,
    pub start_time: Instant,
    pub pool: Option<Arc<WorkerPool>>,
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(
        service: Arc<ConversionService>,
        pool: Option<Arc<WorkerPool>>,
        metrics: Option<PrometheusHandle>,
    ) -> Self {
        Self {
            service,
            start_time: Instant::now(),
            pool,
            metrics,
        }
    }

    /// Wrap a service error with the configured debug flag
    pub fn api_error(&self, error: ServiceError) -> ApiError {
        ApiError::new(error, self.service.config.server.debug)
    }

    fn workers_alive(&self) -> usize {
        self.pool.as_ref().map_or(0, |pool| pool.workers_alive())
    }
}

/// Build the API router
pub fn router(state: AppState) -> Router {
    let max_body_size =
        state.service.config.limits.max_file_size_bytes() as usize + MULTIPART_OVERHEAD_BYTES;
    let state = Arc::new(state);

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route(
            "/convert",
            post(convert_handler).layer(DefaultBodyLimit::max(max_body_size)),
        )
        .route(
            "/jobs",
            post(submit_job_handler).layer(DefaultBodyLimit::max(max_body_size)),
        )
        .route("/jobs/{id}", get(get_job_handler).delete(cancel_job_handler))
        .route("/jobs/{id}/result", get(get_job_result_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Read the shared multipart form of `/convert` and `/jobs`
pub(crate) async fn read_upload(state: &AppState, mut multipart: Multipart) -> Result<Upload, ApiError> {
    let max_mb = state.service.config.limits.max_file_size_mb;
    let multipart_error = |e: axum::extract::multipart::MultipartError| {
        let error = if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
            ServiceError::UploadTooLarge { max_mb }
        } else {
            ServiceError::InvalidRequest {
                message: e.body_text(),
            }
        };
        state.api_error(error)
    };

    let mut file: Option<(String, bytes::Bytes)> = None;
    let mut options = ConversionOptions {
        output_format: state.service.config.engine.default_output_format,
        ..ConversionOptions::default()
    };

    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        let name = field.name().unwrap_or("").to_string();

        match name.as_str() {
            "file" => {
                let filename = field.file_name().unwrap_or("").to_string();
                let data = field.bytes().await.map_err(multipart_error)?;
                file = Some((filename, data));
            }
            "use_llm" | "use_external_augmentation" => {
                let value = field.text().await.map_err(multipart_error)?;
                options.use_external_augmentation =
                    parse_flag(&name, &value).map_err(|e| state.api_error(e))?;
            }
            "force_ocr" | "force_full_reprocessing" => {
                let value = field.text().await.map_err(multipart_error)?;
                options.force_full_reprocessing =
                    parse_flag(&name, &value).map_err(|e| state.api_error(e))?;
            }
            "extract_images" | "extract_side_artifacts" => {
                let value = field.text().await.map_err(multipart_error)?;
                options.extract_side_artifacts =
                    parse_flag(&name, &value).map_err(|e| state.api_error(e))?;
            }
            "output_format" => {
                let value = field.text().await.map_err(multipart_error)?;
                options.output_format = parse_output_format(Some(&value), options.output_format)
                    .map_err(|e| state.api_error(e))?;
            }
            _ => {}
        }
    }

    let (filename, content) = file.ok_or_else(|| {
        state.api_error(ServiceError::InvalidRequest {
            message: "No file provided".to_string(),
        })
    })?;

    Ok(Upload {
        filename,
        content,
        options,
    })
}

// === Health & Metrics ===

#[derive(Serialize)]
struct RootResponse {
    name: &'static str,
    version: &'static str,
    health: &'static str,
}

async fn root_handler() -> Json<RootResponse> {
    Json(RootResponse {
        name: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
        health: "/health",
    })
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    uptime_seconds: u64,
    store_connected: bool,
    queue_depth: Option<usize>,
    jobs_processing: Option<usize>,
    workers_alive: usize,
    augmentation: String,
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let store_connected = state.service.store_connected();
    let queue_depth = state.service.queue.depth().ok();
    let jobs_processing = state
        .service
        .db
        .count_jobs_with_status(JobStatus::Processing, Utc::now())
        .ok();
    let workers_alive = state.workers_alive();

    let status = if store_connected && queue_depth.is_some() && workers_alive > 0 {
        "ok"
    } else {
        "degraded"
    };

    Json(HealthResponse {
        status,
        version: env!("CARGO_PKG_VERSION"),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        store_connected,
        queue_depth,
        jobs_processing,
        workers_alive,
        augmentation: state.service.augmentation.describe(),
    })
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let body = state
        .metrics
        .as_ref()
        .map(|handle| handle.render())
        .unwrap_or_default();

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
}
