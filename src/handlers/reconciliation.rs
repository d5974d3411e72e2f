//! Handlers for the reconciliation endpoints.

use crate::error::AppError;
use crate::services::reconciliation::{BatchReport, BatchStatusReport, UnmatchedSnapshot};
use crate::startup::AppState;
use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::json;

#[derive(Debug, Deserialize)]
pub struct StartBatchRequest {
    #[serde(default)]
    pub from_date: String,
    #[serde(default)]
    pub to_date: String,
}

pub async fn start_reconciliation(
    State(state): State<AppState>,
    Json(request): Json<StartBatchRequest>,
) -> Result<Json<BatchReport>, AppError> {
    let report = state
        .reconciliation
        .start_batch(&request.from_date, &request.to_date)
        .await?;
    Ok(Json(report))
}

pub async fn get_batch_status(
    State(state): State<AppState>,
    Path(batch_id): Path<String>,
) -> Result<Json<BatchStatusReport>, AppError> {
    Ok(Json(state.reconciliation.batch_status(&batch_id).await?))
}

pub async fn resolve_dispute(
    State(state): State<AppState>,
    Path(batch_id): Path<String>,
    Json(resolution): Json<serde_json::Value>,
) -> Result<Json<serde_json::Value>, AppError> {
    state
        .reconciliation
        .resolve_dispute(&batch_id, resolution)
        .await?;
    Ok(Json(json!({
        "message": "Dispute resolved successfully",
        "batch_id": batch_id,
    })))
}

#[derive(Debug, Deserialize)]
pub struct WindowParams {
    #[serde(default)]
    pub from_date: String,
    #[serde(default)]
    pub to_date: String,
}

pub async fn get_unmatched_records(
    State(state): State<AppState>,
    Query(params): Query<WindowParams>,
) -> Result<Json<UnmatchedSnapshot>, AppError> {
    Ok(Json(
        state
            .reconciliation
            .unmatched_records(&params.from_date, &params.to_date)
            .await?,
    ))
}
