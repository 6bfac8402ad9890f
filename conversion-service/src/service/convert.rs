//! Synchronous conversion for small inputs.

use std::collections::BTreeMap;
use std::time::Instant;

use serde::Serialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use super::validation::validate_upload;
use super::{ConversionService, Upload};
use crate::engine::{ConversionOutput, ConversionRequest, EngineError, OutputFormat};
use crate::error::{ServiceError, ServiceResult};
use crate::jobs::ProgressReporter;

/// Body of a synchronous conversion, also used to shape stored job results
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConvertResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub markdown: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub html: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub json_content: Option<serde_json::Value>,
    pub images: BTreeMap<String, String>,
    pub metadata: serde_json::Value,
    pub pages: u32,
    /// Seconds
    pub processing_time: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ConvertResponse {
    pub fn from_output(output: ConversionOutput) -> Self {
        let mut response = Self {
            success: true,
            markdown: None,
            html: None,
            json_content: None,
            images: output.images,
            metadata: output.metadata,
            pages: output.pages.unwrap_or(0),
            processing_time: output.processing_time_secs,
            error: None,
        };
        match output.output_format {
            OutputFormat::Markdown => response.markdown = Some(output.content),
            OutputFormat::Html => response.html = Some(output.content),
            OutputFormat::Json => response.json_content = Some(json!({ "content": output.content })),
        }
        response
    }

    pub fn failure(error: impl Into<String>, processing_time: f64) -> Self {
        Self {
            success: false,
            markdown: None,
            html: None,
            json_content: None,
            images: BTreeMap::new(),
            metadata: json!({}),
            pages: 0,
            processing_time,
            error: Some(error.into()),
        }
    }
}

impl ConversionService {
    /// Convert inline, one request at a time. Validation problems are
    /// errors; engine problems are reported in the response body.
    ///
    /// Runs on the service's own engine handle, not a worker slot, so it
    /// does not count against the pool's resource units.
    pub async fn convert_sync(&self, upload: Upload) -> ServiceResult<ConvertResponse> {
        validate_upload(
            &upload.filename,
            upload.content.len(),
            self.config.limits.max_file_size_mb,
        )?;

        let _slot = self.sync_slot.acquire().await.map_err(|_| ServiceError::Internal {
            message: "Synchronous conversion slot closed".to_string(),
        })?;

        let request = ConversionRequest {
            job_id: Uuid::new_v4().to_string(),
            filename: upload.filename,
            content: upload.content,
            options: upload.options,
        };
        let filename = request.filename.clone();
        let cancel = CancellationToken::new();
        let progress = ProgressReporter::discard(cancel.clone());
        let limit = self.config.jobs.hard_time_limit();
        let started = Instant::now();

        let result = tokio::time::timeout(limit, self.sync_engine.convert(request, progress, cancel.clone()))
            .await
            .unwrap_or(Err(EngineError::TimeLimitExceeded));
        cancel.cancel();
        let elapsed = started.elapsed().as_secs_f64();

        match result {
            Ok(output) => {
                info!(
                    filename = %filename,
                    pages = output.pages.unwrap_or(0),
                    elapsed_secs = elapsed,
                    "Synchronous conversion completed"
                );
                Ok(ConvertResponse::from_output(output))
            }
            Err(e) => {
                warn!(filename = %filename, error = %e, "Synchronous conversion failed");
                Ok(ConvertResponse::failure(e.to_string(), elapsed))
            }
        }
    }
}
