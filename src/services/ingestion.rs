//! Feed ingestion: per-row validation and insertion of bank transactions
//! and accounting entries.
//!
//! Unlike batch persistence, ingestion is deliberately not atomic: valid
//! rows land even when neighbours fail, and every failure is recorded per
//! row in the response.

use crate::error::AppError;
use crate::services::database::{Database, NewAccountingEntry, NewBankTransaction};
use crate::services::metrics::record_ingested_record;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{info, instrument};
use validator::Validate;

const DATE_FORMAT: &str = "%Y-%m-%d";

/// Wire format of one bank feed row; field names follow the feed contract.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct BankTransactionInput {
    #[validate(length(min = 1, message = "transaction_id is required"))]
    pub transaction_id: String,
    #[validate(length(min = 1, message = "account_number is required"))]
    pub account_number: String,
    pub amount: Decimal,
    pub transaction_date: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub reference_number: Option<String>,
}

/// Wire format of one accounting feed row.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct AccountingEntryInput {
    #[validate(length(min = 1, message = "entry_id is required"))]
    pub entry_id: String,
    #[validate(length(min = 1, message = "account_code is required"))]
    pub account_code: String,
    pub amount: Decimal,
    pub entry_date: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub invoice_number: Option<String>,
}

/// Field checks the derive cannot express: a zero amount and a date that
/// does not parse are both per-row rejections.
fn validate_row(amount: Decimal, date: &str) -> Result<NaiveDate, String> {
    if amount.is_zero() {
        return Err("amount is required and must be non-zero".to_string());
    }
    NaiveDate::parse_from_str(date, DATE_FORMAT)
        .map_err(|_| "date must be YYYY-MM-DD".to_string())
}

#[derive(Debug, Serialize)]
pub struct IngestionReport {
    pub success: bool,
    pub records_count: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
    pub details: serde_json::Value,
}

pub struct IngestionService {
    db: Arc<Database>,
}

impl IngestionService {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    #[instrument(skip_all, fields(records = inputs.len()))]
    pub async fn ingest_bank_transactions(
        &self,
        inputs: &[BankTransactionInput],
    ) -> Result<IngestionReport, AppError> {
        if inputs.is_empty() {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "no transactions provided"
            )));
        }

        let mut errors = Vec::new();
        let mut inserted = 0usize;

        for input in inputs {
            if let Err(e) = input.validate() {
                record_ingested_record("bank", "invalid");
                errors.push(format!(
                    "Invalid transaction {}: {}",
                    input.transaction_id, e
                ));
                continue;
            }
            let transaction_date = match validate_row(input.amount, &input.transaction_date) {
                Ok(date) => date,
                Err(e) => {
                    record_ingested_record("bank", "invalid");
                    errors.push(format!(
                        "Invalid transaction {}: {}",
                        input.transaction_id, e
                    ));
                    continue;
                }
            };

            let row = NewBankTransaction {
                external_id: input.transaction_id.clone(),
                account_number: input.account_number.clone(),
                amount: input.amount,
                transaction_date,
                description: input.description.clone(),
                reference_number: input.reference_number.clone(),
            };
            match self.db.insert_bank_transaction(&row).await {
                Ok(_) => {
                    inserted += 1;
                    record_ingested_record("bank", "ok");
                }
                Err(e) => {
                    record_ingested_record("bank", "failed");
                    errors.push(format!(
                        "Failed to insert transaction {}: {}",
                        input.transaction_id, e
                    ));
                }
            }
        }

        self.finish_feed("bank transactions", inputs.len(), inserted, errors)
            .await
    }

    #[instrument(skip_all, fields(records = inputs.len()))]
    pub async fn ingest_accounting_entries(
        &self,
        inputs: &[AccountingEntryInput],
    ) -> Result<IngestionReport, AppError> {
        if inputs.is_empty() {
            return Err(AppError::BadRequest(anyhow::anyhow!("no entries provided")));
        }

        let mut errors = Vec::new();
        let mut inserted = 0usize;

        for input in inputs {
            if let Err(e) = input.validate() {
                record_ingested_record("accounting", "invalid");
                errors.push(format!("Invalid entry {}: {}", input.entry_id, e));
                continue;
            }
            let entry_date = match validate_row(input.amount, &input.entry_date) {
                Ok(date) => date,
                Err(e) => {
                    record_ingested_record("accounting", "invalid");
                    errors.push(format!("Invalid entry {}: {}", input.entry_id, e));
                    continue;
                }
            };

            let row = NewAccountingEntry {
                external_id: input.entry_id.clone(),
                account_code: input.account_code.clone(),
                amount: input.amount,
                entry_date,
                description: input.description.clone(),
                invoice_number: input.invoice_number.clone(),
            };
            match self.db.insert_accounting_entry(&row).await {
                Ok(_) => {
                    inserted += 1;
                    record_ingested_record("accounting", "ok");
                }
                Err(e) => {
                    record_ingested_record("accounting", "failed");
                    errors.push(format!("Failed to insert entry {}: {}", input.entry_id, e));
                }
            }
        }

        self.finish_feed("accounting entries", inputs.len(), inserted, errors)
            .await
    }

    async fn finish_feed(
        &self,
        feed: &str,
        total: usize,
        inserted: usize,
        errors: Vec<String>,
    ) -> Result<IngestionReport, AppError> {
        let details = json!({
            "total_records": total,
            "successful": inserted,
            "failed": errors.len(),
        });

        if inserted > 0 {
            self.db.insert_feed_audit(&details).await?;
        }

        info!(
            feed = feed,
            total = total,
            successful = inserted,
            failed = errors.len(),
            "Feed ingestion finished"
        );

        Ok(IngestionReport {
            success: errors.is_empty(),
            records_count: inserted,
            errors,
            details,
        })
    }
}
