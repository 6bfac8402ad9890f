//! Delegated conversion engine contract.
//!
//! The orchestration core never looks inside a conversion: it hands an
//! engine the staged input, a progress reporter and a cancellation token,
//! and classifies whatever error comes back.

pub mod augmentation;
pub mod marker;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::jobs::ProgressReporter;

/// Rendering requested from the engine
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Markdown,
    Json,
    Html,
}

impl OutputFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputFormat::Markdown => "markdown",
            OutputFormat::Json => "json",
            OutputFormat::Html => "html",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "markdown" | "md" => Some(OutputFormat::Markdown),
            "json" => Some(OutputFormat::Json),
            "html" => Some(OutputFormat::Html),
            _ => None,
        }
    }

    /// Extension of the main output file the engine writes
    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Markdown => "md",
            OutputFormat::Json => "json",
            OutputFormat::Html => "html",
        }
    }
}

/// Per-request conversion options
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversionOptions {
    #[serde(default)]
    pub use_external_augmentation: bool,
    #[serde(default)]
    pub force_full_reprocessing: bool,
    #[serde(default)]
    pub output_format: OutputFormat,
    #[serde(default = "default_extract_side_artifacts")]
    pub extract_side_artifacts: bool,
}

fn default_extract_side_artifacts() -> bool {
    true
}

impl Default for ConversionOptions {
    fn default() -> Self {
        Self {
            use_external_augmentation: false,
            force_full_reprocessing: false,
            output_format: OutputFormat::default(),
            extract_side_artifacts: default_extract_side_artifacts(),
        }
    }
}

/// One unit of input for the engine
#[derive(Debug, Clone)]
pub struct ConversionRequest {
    pub job_id: String,
    pub filename: String,
    pub content: Bytes,
    pub options: ConversionOptions,
}

/// What a successful conversion produced. Stored verbatim as the job result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversionOutput {
    pub content: String,
    /// Image file name to base64-encoded bytes
    #[serde(default)]
    pub images: BTreeMap<String, String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub pages: Option<u32>,
    pub processing_time_secs: f64,
    pub output_format: OutputFormat,
    pub completed_at: DateTime<Utc>,
}

/// Classified engine failure
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Transient exhaustion of the scarce resource (e.g. accelerator memory)
    #[error("Resource exhausted: {message}")]
    ResourceExhausted { message: String },

    #[error("Conversion failed: {message}")]
    Failed { message: String },

    #[error("Conversion cancelled")]
    Cancelled,

    #[error("Conversion exceeded its time limit")]
    TimeLimitExceeded,
}

impl EngineError {
    pub fn resource_exhausted(message: impl Into<String>) -> Self {
        EngineError::ResourceExhausted {
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        EngineError::Failed {
            message: message.into(),
        }
    }

    /// Only resource exhaustion is worth another attempt
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::ResourceExhausted { .. })
    }
}

/// A conversion backend.
///
/// Implementations should call `progress.report(..)` at coarse milestones
/// and stop early when it returns an error or `cancel` fires. Callers may
/// also drop the returned future at any await point, so a backend holding
/// external processes must release them on drop.
#[async_trait]
pub trait ConversionEngine: Send + Sync {
    async fn convert(
        &self,
        request: ConversionRequest,
        progress: ProgressReporter,
        cancel: CancellationToken,
    ) -> Result<ConversionOutput, EngineError>;
}

/// Builds the engine handle owned by one worker generation
pub trait EngineFactory: Send + Sync {
    fn create(&self) -> Result<Arc<dyn ConversionEngine>, EngineError>;
}

impl<F> EngineFactory for F
where
    F: Fn() -> Result<Arc<dyn ConversionEngine>, EngineError> + Send + Sync,
{
    fn create(&self) -> Result<Arc<dyn ConversionEngine>, EngineError> {
        self()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted engine used by the worker, pool and API tests.

    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::jobs::ProgressUpdate;

    /// What one call to the scripted engine does
    #[derive(Debug, Clone)]
    pub enum Step {
        /// Report the given milestones, then succeed
        Succeed(Vec<u8>),
        /// Fail with the given error after reporting 0%
        Fail(EngineError),
        /// Report 20% and then wait for cancellation, ignoring it for `stall`
        Block { stall: Duration },
    }

    pub struct ScriptedEngine {
        steps: Mutex<VecDeque<Step>>,
        pub calls: AtomicUsize,
    }

    impl ScriptedEngine {
        pub fn new(steps: impl IntoIterator<Item = Step>) -> Arc<Self> {
            Arc::new(Self {
                steps: Mutex::new(steps.into_iter().collect()),
                calls: AtomicUsize::new(0),
            })
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    pub fn output(pages: u32) -> ConversionOutput {
        ConversionOutput {
            content: format!("# Converted\n\n{pages} pages"),
            images: BTreeMap::new(),
            metadata: serde_json::json!({"pages": pages}),
            pages: Some(pages),
            processing_time_secs: 0.01,
            output_format: OutputFormat::Markdown,
            completed_at: Utc::now(),
        }
    }

    #[async_trait]
    impl ConversionEngine for ScriptedEngine {
        async fn convert(
            &self,
            _request: ConversionRequest,
            progress: ProgressReporter,
            cancel: CancellationToken,
        ) -> Result<ConversionOutput, EngineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let step = self
                .steps
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Step::Succeed(vec![0, 20, 80, 100]));

            match step {
                Step::Succeed(milestones) => {
                    for percent in milestones {
                        progress.report(ProgressUpdate::new(percent, format!("At {percent}%")))?;
                        tokio::time::sleep(Duration::from_millis(5)).await;
                    }
                    Ok(output(5))
                }
                Step::Fail(error) => {
                    progress.report(ProgressUpdate::new(0, "Starting conversion"))?;
                    Err(error)
                }
                Step::Block { stall } => {
                    progress.report(ProgressUpdate::new(20, "Converting document"))?;
                    cancel.cancelled().await;
                    tokio::time::sleep(stall).await;
                    // A late report after cancellation must be refused
                    progress.report(ProgressUpdate::new(90, "Too late"))?;
                    Ok(output(1))
                }
            }
        }
    }

    /// Factory handing out the same scripted engine every generation
    pub fn factory(engine: Arc<ScriptedEngine>) -> Arc<dyn EngineFactory> {
        let factory = move || -> Result<Arc<dyn ConversionEngine>, EngineError> {
            Ok(engine.clone() as Arc<dyn ConversionEngine>)
        };
        Arc::new(factory)
    }
}
