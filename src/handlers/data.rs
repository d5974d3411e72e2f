//! Handlers for the feed ingestion endpoints.

use crate::error::AppError;
use crate::services::ingestion::{AccountingEntryInput, BankTransactionInput, IngestionReport};
use crate::startup::AppState;
use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;

fn report_status(report: &IngestionReport) -> StatusCode {
    if report.success {
        StatusCode::OK
    } else {
        StatusCode::PARTIAL_CONTENT
    }
}

pub async fn ingest_bank_transactions(
    State(state): State<AppState>,
    Json(inputs): Json<Vec<BankTransactionInput>>,
) -> Result<(StatusCode, Json<IngestionReport>), AppError> {
    let report = state.ingestion.ingest_bank_transactions(&inputs).await?;
    Ok((report_status(&report), Json(report)))
}

pub async fn ingest_accounting_entries(
    State(state): State<AppState>,
    Json(inputs): Json<Vec<AccountingEntryInput>>,
) -> Result<(StatusCode, Json<IngestionReport>), AppError> {
    let report = state.ingestion.ingest_accounting_entries(&inputs).await?;
    Ok((report_status(&report), Json(report)))
}
