use axum::extract::State;
use axum::Json;
use serde::Serialize;
use std::sync::Arc;

use super::{reconcile_error, task_error};
use crate::api::response::{ApiError, JSend};
use crate::reconcile::ReconciliationReport;
use crate::tasks::PoolStats;
use crate::AppState;

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub node_id: String,
    pub pool: PoolStats,
    pub single_node: bool,
}

#[derive(Debug, Serialize)]
pub struct PurgeResponse {
    pub files_deleted: u64,
}

// ============================================================================
// Handlers
// ============================================================================

pub async fn health() -> Json<JSend<HealthResponse>> {
    JSend::success(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

pub async fn pool_status(State(state): State<Arc<AppState>>) -> Json<JSend<StatusResponse>> {
    JSend::success(StatusResponse {
        node_id: state.config.node.id.clone(),
        pool: state.pool.stats(),
        single_node: state.config.is_single_node(),
    })
}

pub async fn reconcile_now(
    State(state): State<Arc<AppState>>,
) -> Result<Json<JSend<ReconciliationReport>>, ApiError> {
    let report = state
        .reconciler
        .reconcile()
        .await
        .map_err(reconcile_error)?;

    tracing::info!(
        inserted = report.inserted,
        updated = report.updated,
        deleted = report.deleted,
        skipped = report.skipped,
        partial_writes_removed = report.partial_writes_removed,
        "On-demand reconciliation finished"
    );
    Ok(JSend::success(report))
}

pub async fn admin_purge(
    State(state): State<Arc<AppState>>,
) -> Result<Json<JSend<PurgeResponse>>, ApiError> {
    let stats = state.ops.purge().await.map_err(task_error)?;

    tracing::warn!(files = stats.files, "Purged all data");

    Ok(JSend::success(PurgeResponse {
        files_deleted: stats.files,
    }))
}
