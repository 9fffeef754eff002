use axum::extract::{Multipart, Path, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::task_error;
use crate::api::response::{ApiError, AppQuery, JSend, JSendPaginated, Pagination};
use crate::storage::models::{FileFilter, FileRecord, FileStatus};
use crate::tasks::{DeleteOutcome, UploadOutcome};
use crate::AppState;

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Serialize)]
pub struct FileResponse {
    pub checksum: String,
    pub creation_date: String,
    pub file_id: String,
    pub file_name: String,
    pub status: FileStatus,
}

#[derive(Debug, Serialize)]
pub struct VersionResponse {
    pub file_id: String,
    pub version: u64,
}

#[derive(Debug, Deserialize)]
pub struct ListFilesParams {
    #[serde(default = "default_limit")]
    pub limit: u32,
    #[serde(default)]
    pub offset: u32,
}

fn default_limit() -> u32 {
    20
}

// ============================================================================
// Handlers
// ============================================================================

pub async fn create_file(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Result<Json<JSend<UploadOutcome>>, ApiError> {
    let mut upload = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(format!("Invalid multipart data: {e}")))?
    {
        if field.name() != Some("file") {
            continue;
        }

        let file_name = field
            .file_name()
            .map(|s| s.to_string())
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| ApiError::bad_request("file field must carry a file name"))?;

        let data = field
            .bytes()
            .await
            .map_err(|e| ApiError::bad_request(format!("Failed to read file: {e}")))?;

        if data.len() as u64 > state.config.max_upload_size {
            return Err(ApiError::payload_too_large(format!(
                "File exceeds maximum upload size of {} bytes",
                state.config.max_upload_size
            )));
        }

        upload = Some((file_name, data));
    }

    let (file_name, data) = upload.ok_or_else(|| ApiError::bad_request("file field is required"))?;

    let outcome = state
        .pool
        .submit_upload(data, file_name)
        .await
        .map_err(task_error)?;

    tracing::debug!(file_id = %outcome.file_id, is_new = outcome.is_new, "Upload handled");
    Ok(JSend::success(outcome))
}

pub async fn get_file(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<JSend<FileResponse>>, ApiError> {
    let file = state
        .metadata
        .find_one(&FileFilter::id(id))
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?
        .ok_or_else(|| ApiError::not_found("File not found"))?;

    Ok(JSend::success(file_to_response(&file)))
}

pub async fn get_file_version(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<JSend<VersionResponse>>, ApiError> {
    let version = state
        .versions
        .current(&id)
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?;

    Ok(JSend::success(VersionResponse {
        file_id: id,
        version,
    }))
}

pub async fn delete_file(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<JSend<DeleteOutcome>>, ApiError> {
    let outcome = state.pool.submit_delete(id).await.map_err(task_error)?;

    tracing::debug!(file_id = %outcome.file_id, "Delete handled");
    Ok(JSend::success(outcome))
}

pub async fn list_files(
    State(state): State<Arc<AppState>>,
    AppQuery(params): AppQuery<ListFilesParams>,
) -> Result<Json<JSendPaginated<FileResponse>>, ApiError> {
    if params.limit == 0 {
        return Err(ApiError::bad_request("limit must be greater than 0"));
    }

    let mut files = state
        .metadata
        .find_all()
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?;
    files.sort_by(|a, b| {
        a.file_name
            .cmp(&b.file_name)
            .then_with(|| a.file_id.cmp(&b.file_id))
    });

    let total = files.len() as u64;
    let items: Vec<FileResponse> = files
        .iter()
        .skip(params.offset as usize)
        .take(params.limit as usize)
        .map(file_to_response)
        .collect();

    Ok(JSendPaginated::success(
        items,
        Pagination {
            limit: params.limit,
            offset: params.offset,
            total,
        },
    ))
}

// ============================================================================
// Helpers
// ============================================================================

fn file_to_response(file: &FileRecord) -> FileResponse {
    FileResponse {
        checksum: file.checksum.clone(),
        creation_date: file.creation_date.to_rfc3339(),
        file_id: file.file_id.clone(),
        file_name: file.file_name.clone(),
        status: file.status,
    }
}
