//! Batch coordinator: date-window validation, single-flight admission,
//! loader → engine → persister orchestration and report assembly.

use crate::error::AppError;
use crate::matching::{propose_matches, MatchCriterion, MatchProposal, MatchTolerances};
use crate::services::database::{
    Database, PersistedBatch, UnmatchedBankRecord, UnmatchedEntryRecord,
};
use crate::services::metrics::{record_batch_operation, record_match_proposal};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tracing::{info, instrument};

const DATE_FORMAT: &str = "%Y-%m-%d";

// ============================================================================
// Single-flight Window Registry
// ============================================================================

/// Process-wide set of date windows with a reconciliation in flight.
#[derive(Default)]
pub struct WindowRegistry {
    active: Mutex<HashSet<String>>,
}

impl WindowRegistry {
    /// Claim a window, failing with `AlreadyRunning` when it is taken.
    pub fn acquire(self: &Arc<Self>, key: String) -> Result<WindowGuard, AppError> {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        if !active.insert(key.clone()) {
            return Err(AppError::AlreadyRunning(key));
        }
        Ok(WindowGuard {
            registry: Arc::clone(self),
            key,
        })
    }
}

/// Releases the claimed window when dropped, on every exit path including
/// unwinds.
pub struct WindowGuard {
    registry: Arc<WindowRegistry>,
    key: String,
}

impl Drop for WindowGuard {
    fn drop(&mut self) {
        let mut active = self
            .registry
            .active
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        active.remove(&self.key);
    }
}

fn window_key(from_date: &str, to_date: &str) -> String {
    format!("{from_date}|{to_date}")
}

/// Validate window presence and format; both bounds are inclusive dates.
fn parse_window(from_date: &str, to_date: &str) -> Result<(NaiveDate, NaiveDate), AppError> {
    if from_date.is_empty() {
        return Err(AppError::DateMissing("from_date"));
    }
    if to_date.is_empty() {
        return Err(AppError::DateMissing("to_date"));
    }
    let from = NaiveDate::parse_from_str(from_date, DATE_FORMAT)
        .map_err(|_| AppError::DateFormatInvalid(from_date.to_string()))?;
    let to = NaiveDate::parse_from_str(to_date, DATE_FORMAT)
        .map_err(|_| AppError::DateFormatInvalid(to_date.to_string()))?;
    Ok((from, to))
}

// ============================================================================
// Report Types
// ============================================================================

#[derive(Debug, Serialize)]
pub struct BatchReport {
    pub batch_key: String,
    pub status: String,
    pub matches: Vec<MatchReport>,
    pub unmatched_bank: Vec<UnmatchedRecordReport>,
    pub unmatched_accounting: Vec<UnmatchedRecordReport>,
    pub summary: BatchSummary,
}

#[derive(Debug, Serialize)]
pub struct MatchReport {
    pub match_type: String,
    pub confidence: f64,
    pub bank_transaction: String,
    pub accounting_entries: Vec<String>,
    pub amount_difference: Decimal,
    pub criteria: Vec<MatchCriterion>,
}

#[derive(Debug, Serialize)]
pub struct UnmatchedRecordReport {
    pub id: i64,
    pub external_id: String,
    pub amount: Decimal,
    pub date: NaiveDate,
}

#[derive(Debug, Serialize)]
pub struct BatchSummary {
    pub total_processed: usize,
    pub matched: usize,
    pub unmatched_bank: usize,
    pub unmatched_accounting: usize,
}

/// Status lookup response; the wire field is `batch_id` even though the
/// value is the batch key.
#[derive(Debug, Serialize)]
pub struct BatchStatusReport {
    pub batch_id: String,
    pub status: String,
}

#[derive(Debug, Serialize)]
pub struct UnmatchedSnapshot {
    pub unmatched_bank_transactions: Vec<UnmatchedBankRecord>,
    pub unmatched_accounting_entries: Vec<UnmatchedEntryRecord>,
}

// ============================================================================
// Coordinator
// ============================================================================

pub struct ReconciliationService {
    db: Arc<Database>,
    tolerances: MatchTolerances,
    windows: Arc<WindowRegistry>,
}

impl ReconciliationService {
    pub fn new(db: Arc<Database>, tolerances: MatchTolerances) -> Self {
        Self {
            db,
            tolerances,
            windows: Arc::new(WindowRegistry::default()),
        }
    }

    /// Run one reconciliation batch over the inclusive date window.
    ///
    /// At most one batch per window is admitted at a time; the loser fails
    /// fast with `AlreadyRunning` before touching the store.
    #[instrument(skip(self))]
    pub async fn start_batch(
        &self,
        from_date: &str,
        to_date: &str,
    ) -> Result<BatchReport, AppError> {
        let (from, to) = parse_window(from_date, to_date)?;
        let _guard = self.windows.acquire(window_key(from_date, to_date))?;

        let (bank, entries) = tokio::try_join!(
            self.db.unreconciled_bank_transactions(from, to),
            self.db.unreconciled_accounting_entries(from, to),
        )?;

        let proposals = propose_matches(&bank, &entries, &self.tolerances);
        for proposal in &proposals {
            record_match_proposal(proposal.kind.as_str());
        }

        let persisted = self.db.persist_batch(&proposals, &bank, &entries).await?;
        record_batch_operation("start", &persisted.batch.status);

        let total_processed = bank.len() + entries.len();
        Ok(assemble_report(persisted, proposals, total_processed))
    }

    /// Read-through status lookup for a committed batch.
    #[instrument(skip(self))]
    pub async fn batch_status(&self, batch_key: &str) -> Result<BatchStatusReport, AppError> {
        if batch_key.is_empty() {
            return Err(AppError::BadRequest(anyhow::anyhow!("batch id is required")));
        }
        let batch = self
            .db
            .get_batch_by_key(batch_key)
            .await?
            .ok_or_else(|| AppError::BatchNotFound(batch_key.to_string()))?;
        Ok(BatchStatusReport {
            batch_id: batch.batch_key,
            status: batch.status,
        })
    }

    /// Resolve a disputed batch, carrying the resolution payload verbatim
    /// into the audit trail.
    #[instrument(skip(self, resolution))]
    pub async fn resolve_dispute(
        &self,
        batch_key: &str,
        resolution: serde_json::Value,
    ) -> Result<(), AppError> {
        if batch_key.is_empty() {
            return Err(AppError::BadRequest(anyhow::anyhow!("batch id is required")));
        }
        self.db
            .resolve_dispute(batch_key, &resolution)
            .await?
            .ok_or_else(|| AppError::BatchNotFound(batch_key.to_string()))?;
        record_batch_operation("resolve", "ok");
        Ok(())
    }

    /// Snapshot of unreconciled rows in the window, independent of any batch.
    #[instrument(skip(self))]
    pub async fn unmatched_records(
        &self,
        from_date: &str,
        to_date: &str,
    ) -> Result<UnmatchedSnapshot, AppError> {
        let (from, to) = parse_window(from_date, to_date)?;
        let (bank, accounting) = self.db.unmatched_snapshot(from, to).await?;
        Ok(UnmatchedSnapshot {
            unmatched_bank_transactions: bank,
            unmatched_accounting_entries: accounting,
        })
    }
}

fn assemble_report(
    persisted: PersistedBatch,
    proposals: Vec<MatchProposal>,
    total_processed: usize,
) -> BatchReport {
    let matches: Vec<MatchReport> = proposals
        .into_iter()
        .map(|p| MatchReport {
            match_type: p.kind.as_str().to_string(),
            confidence: p.confidence,
            bank_transaction: p.bank.external_id,
            accounting_entries: p.entries.into_iter().map(|ae| ae.external_id).collect(),
            amount_difference: p.amount_difference,
            criteria: p.criteria,
        })
        .collect();

    let unmatched_bank: Vec<UnmatchedRecordReport> = persisted
        .unmatched_bank
        .into_iter()
        .map(|bt| UnmatchedRecordReport {
            id: bt.id,
            external_id: bt.external_id,
            amount: bt.amount,
            date: bt.transaction_date,
        })
        .collect();
    let unmatched_accounting: Vec<UnmatchedRecordReport> = persisted
        .unmatched_accounting
        .into_iter()
        .map(|ae| UnmatchedRecordReport {
            id: ae.id,
            external_id: ae.external_id,
            amount: ae.amount,
            date: ae.entry_date,
        })
        .collect();

    info!(
        batch_key = %persisted.batch.batch_key,
        matched = matches.len(),
        unmatched_bank = unmatched_bank.len(),
        unmatched_accounting = unmatched_accounting.len(),
        "Batch report assembled"
    );

    BatchReport {
        batch_key: persisted.batch.batch_key,
        status: persisted.batch.status,
        summary: BatchSummary {
            total_processed,
            matched: matches.len(),
            unmatched_bank: unmatched_bank.len(),
            unmatched_accounting: unmatched_accounting.len(),
        },
        matches,
        unmatched_bank,
        unmatched_accounting,
    }
}
