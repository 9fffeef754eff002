mod admin;
mod files;
mod static_files;

use crate::api::response::ApiError;
use crate::reconcile::ReconcileError;
use crate::tasks::TaskError;

pub use admin::{admin_purge, health, pool_status, reconcile_now};
pub use files::{create_file, delete_file, get_file, get_file_version, list_files};
pub use static_files::serve_static;

/// Map a TaskError to an ApiError
fn task_error(e: TaskError) -> ApiError {
    match e {
        TaskError::ResourceLocked { .. } => ApiError::conflict(e.to_string()),
        TaskError::NotFound(_) => ApiError::not_found("File not found"),
        TaskError::InvalidName(_) => ApiError::bad_request(e.to_string()),
        TaskError::Timeout(_) => ApiError::timeout(e.to_string()),
        TaskError::LockServiceUnavailable(_) | TaskError::PoolClosed => {
            ApiError::unavailable(e.to_string())
        }
        _ => ApiError::internal(e.to_string()),
    }
}

/// Map a ReconcileError to an ApiError
fn reconcile_error(e: ReconcileError) -> ApiError {
    match e {
        ReconcileError::InProgress => ApiError::conflict(e.to_string()),
        ReconcileError::Timeout(_) => ApiError::timeout(e.to_string()),
        _ => ApiError::internal(e.to_string()),
    }
}
