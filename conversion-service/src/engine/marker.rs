//! Subprocess engine driving the `marker_single` converter.
//!
//! Each call stages the upload in a private temp directory, runs the
//! converter against it and reads back the rendered document, its metadata
//! and any extracted images. The child is killed whenever the call future
//! is dropped, so a forced cancel or hard time limit always releases the
//! accelerator it was holding.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::Utc;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::augmentation::AugmentationRegistry;
use super::{
    ConversionEngine, ConversionOutput, ConversionRequest, EngineError, EngineFactory, OutputFormat,
};
use crate::config::EngineConfig;
use crate::jobs::{ProgressReporter, ProgressUpdate};

/// Name the staged input is written under; outputs are named after it
const STAGED_STEM: &str = "document";

/// Trailing stderr kept in failure messages
const STDERR_TAIL_BYTES: usize = 2000;

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "webp", "gif"];

pub struct MarkerEngine {
    command: String,
    extra_args: Vec<String>,
    force_ocr: bool,
    augmentation: Arc<AugmentationRegistry>,
}

impl MarkerEngine {
    pub fn new(config: &EngineConfig, augmentation: Arc<AugmentationRegistry>) -> Self {
        Self {
            command: config.command.clone(),
            extra_args: config.extra_args.clone(),
            force_ocr: config.force_ocr,
            augmentation,
        }
    }

    /// Factory creating one engine handle per worker generation
    pub fn factory(
        config: &EngineConfig,
        augmentation: Arc<AugmentationRegistry>,
    ) -> Arc<dyn EngineFactory> {
        let config = config.clone();
        let factory = move || -> Result<Arc<dyn ConversionEngine>, EngineError> {
            Ok(Arc::new(MarkerEngine::new(&config, augmentation.clone())))
        };
        Arc::new(factory)
    }

    fn build_command(&self, request: &ConversionRequest, input: &Path, output_dir: &Path) -> Command {
        let options = &request.options;
        let mut cmd = Command::new(&self.command);
        cmd.args(&self.extra_args)
            .arg(input)
            .arg("--output_dir")
            .arg(output_dir)
            .arg("--output_format")
            .arg(options.output_format.as_str());

        if self.force_ocr || options.force_full_reprocessing {
            cmd.arg("--force_ocr");
        }
        if !options.extract_side_artifacts {
            cmd.arg("--disable_image_extraction");
        }
        if let Some(service) = self.augmentation.for_request(options.use_external_augmentation) {
            cmd.args(&service.args);
            cmd.envs(service.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        }

        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

fn staging_error(e: std::io::Error) -> EngineError {
    EngineError::failed(format!("Failed to stage input: {e}"))
}

/// Extension of the uploaded file, defaulting to `.pdf`
fn input_extension(filename: &str) -> String {
    Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| format!(".{}", ext.to_ascii_lowercase()))
        .unwrap_or_else(|| ".pdf".to_string())
}

/// Map a failed run to a classified error
fn classify_failure(code: Option<i32>, stderr: &str) -> EngineError {
    let lowered = stderr.to_ascii_lowercase();
    let tail = tail(stderr.trim(), STDERR_TAIL_BYTES);

    if lowered.contains("out of memory") {
        return EngineError::resource_exhausted(tail);
    }
    match code {
        Some(code) if tail.is_empty() => {
            EngineError::failed(format!("converter exited with status {code}"))
        }
        Some(code) => EngineError::failed(format!("converter exited with status {code}: {tail}")),
        None => EngineError::failed(format!("converter terminated by signal: {tail}")),
    }
}

fn tail(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let mut start = text.len() - max_bytes;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_string()
}

/// Page count from converter metadata
fn page_count(metadata: &serde_json::Value) -> Option<u32> {
    if let Some(stats) = metadata.get("page_stats").and_then(|v| v.as_array()) {
        return u32::try_from(stats.len()).ok();
    }
    metadata
        .get("pages")
        .and_then(|v| v.as_u64())
        .and_then(|p| u32::try_from(p).ok())
}

/// Everything the converter left in its output directory
#[derive(Debug, Default)]
struct CollectedOutput {
    content: Option<String>,
    metadata: Option<serde_json::Value>,
    images: BTreeMap<String, String>,
}

/// Files under `dir`, one level of subdirectories deep
async fn output_files(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut pending = vec![(dir.to_path_buf(), 0u8)];

    while let Some((current, depth)) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&current).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if entry.file_type().await?.is_dir() {
                if depth < 1 {
                    pending.push((path, depth + 1));
                }
            } else {
                files.push(path);
            }
        }
    }
    files.sort();
    Ok(files)
}

async fn collect_output(
    dir: &Path,
    format: OutputFormat,
    extract_images: bool,
) -> Result<CollectedOutput, EngineError> {
    let read_error = |e: std::io::Error| EngineError::failed(format!("Failed to read converter output: {e}"));
    let content_name = format!("{STAGED_STEM}.{}", format.extension());
    let meta_name = format!("{STAGED_STEM}_meta.json");

    let mut collected = CollectedOutput::default();
    for path in output_files(dir).await.map_err(read_error)? {
        let Some(name) = path.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
            continue;
        };
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();

        if name == content_name {
            collected.content = Some(tokio::fs::read_to_string(&path).await.map_err(read_error)?);
        } else if name == meta_name {
            let raw = tokio::fs::read(&path).await.map_err(read_error)?;
            collected.metadata = serde_json::from_slice(&raw).ok();
        } else if extract_images && IMAGE_EXTENSIONS.contains(&extension.as_str()) {
            let bytes = tokio::fs::read(&path).await.map_err(read_error)?;
            collected.images.insert(name, BASE64.encode(bytes));
        }
    }
    Ok(collected)
}

#[async_trait]
impl ConversionEngine for MarkerEngine {
    async fn convert(
        &self,
        request: ConversionRequest,
        progress: ProgressReporter,
        cancel: CancellationToken,
    ) -> Result<ConversionOutput, EngineError> {
        let started = Instant::now();
        progress.report(ProgressUpdate::new(0, "Starting conversion..."))?;

        let staging = tempfile::tempdir().map_err(staging_error)?;
        let input = staging
            .path()
            .join(format!("{STAGED_STEM}{}", input_extension(&request.filename)));
        let output_dir = staging.path().join("out");
        tokio::fs::write(&input, &request.content)
            .await
            .map_err(staging_error)?;
        tokio::fs::create_dir_all(&output_dir)
            .await
            .map_err(staging_error)?;
        progress.report(ProgressUpdate::new(10, "File staged"))?;

        let mut cmd = self.build_command(&request, &input, &output_dir);
        let child = cmd
            .spawn()
            .map_err(|e| EngineError::failed(format!("Failed to start {}: {e}", self.command)))?;
        debug!(job_id = %request.job_id, command = %self.command, "Converter started");
        progress.report(ProgressUpdate::new(20, "Converting document..."))?;

        // Dropping the wait future drops the child, which kills it
        let output = tokio::select! {
            output = child.wait_with_output() => output
                .map_err(|e| EngineError::failed(format!("Failed to wait for converter: {e}")))?,
            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_failure(output.status.code(), &stderr));
        }
        progress.report(ProgressUpdate::new(80, "Extracting content..."))?;

        let format = request.options.output_format;
        let collected =
            collect_output(&output_dir, format, request.options.extract_side_artifacts).await?;
        let content = collected.content.ok_or_else(|| {
            EngineError::failed(format!(
                "Converter produced no {} output",
                format.as_str()
            ))
        })?;

        let mut metadata = collected
            .metadata
            .unwrap_or_else(|| serde_json::json!({}));
        let pages = page_count(&metadata);
        if let Some(map) = metadata.as_object_mut() {
            map.insert("filename".to_string(), request.filename.clone().into());
            if let Some(pages) = pages {
                map.insert("pages".to_string(), pages.into());
            }
        }

        let done = match pages {
            Some(pages) if pages > 0 => ProgressUpdate::steps(pages, pages, "Completed"),
            _ => ProgressUpdate::new(100, "Completed"),
        };
        progress.report(done)?;
        let processing_time_secs = started.elapsed().as_secs_f64();
        info!(
            job_id = %request.job_id,
            pages = pages.unwrap_or(0),
            images = collected.images.len(),
            seconds = processing_time_secs,
            "Conversion finished"
        );

        Ok(ConversionOutput {
            content,
            images: collected.images,
            metadata,
            pages,
            processing_time_secs,
            output_format: format,
            completed_at: Utc::now(),
        })
    }
}
