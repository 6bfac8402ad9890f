//! Upload validation shared by the synchronous and job endpoints.

use std::path::Path;

use crate::engine::OutputFormat;
use crate::error::{ServiceError, ServiceResult};

/// Accepted input file extensions (lowercase, with dot)
pub const ALLOWED_EXTENSIONS: &[&str] = &[".pdf", ".png", ".jpg", ".jpeg", ".tiff", ".bmp", ".webp"];

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Lowercased extension of `filename`, including the dot. Empty if none.
pub fn file_extension(filename: &str) -> String {
    Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| format!(".{}", ext.to_ascii_lowercase()))
        .unwrap_or_default()
}

/// Check the filename and size of an upload before any work is queued
pub fn validate_upload(filename: &str, size_bytes: usize, max_file_size_mb: u64) -> ServiceResult<()> {
    if filename.trim().is_empty() {
        return Err(ServiceError::InvalidRequest {
            message: "No filename provided".to_string(),
        });
    }

    let extension = file_extension(filename);
    if !ALLOWED_EXTENSIONS.contains(&extension.as_str()) {
        return Err(ServiceError::UnsupportedFormat {
            extension: if extension.is_empty() {
                "(none)".to_string()
            } else {
                extension
            },
            allowed: ALLOWED_EXTENSIONS.join(", "),
        });
    }

    let size_mb = size_bytes as f64 / BYTES_PER_MB;
    if size_mb > max_file_size_mb as f64 {
        return Err(ServiceError::FileTooLarge {
            size_mb,
            max_mb: max_file_size_mb,
        });
    }

    Ok(())
}

/// Parse an optional `output_format` form value
pub fn parse_output_format(value: Option<&str>, default: OutputFormat) -> ServiceResult<OutputFormat> {
    match value.map(str::trim).filter(|v| !v.is_empty()) {
        None => Ok(default),
        Some(raw) => OutputFormat::parse(raw).ok_or_else(|| ServiceError::InvalidRequest {
            message: format!("Unknown output format '{raw}'. Expected markdown, json or html"),
        }),
    }
}

/// Parse a boolean form value
pub fn parse_flag(name: &str, value: &str) -> ServiceResult<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" | "" => Ok(false),
        _ => Err(ServiceError::InvalidRequest {
            message: format!("Field '{name}' must be a boolean, got '{value}'"),
        }),
    }
}
