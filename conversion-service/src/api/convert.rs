//! Synchronous conversion endpoint.

use axum::{
    Json,
    extract::{Multipart, State},
};
use std::sync::Arc;

use crate::error::ApiError;
use crate::service::ConvertResponse;

use super::{AppState, read_upload};

/// Convert a file and wait for the result
pub async fn convert_handler(
    State(state): State<Arc<AppState>>,
    multipart: Multipart,
) -> Result<Json<ConvertResponse>, ApiError> {
    let upload = read_upload(&state, multipart).await?;
    let response = state
        .service
        .convert_sync(upload)
        .await
        .map_err(|e| state.api_error(e))?;
    Ok(Json(response))
}
