//! Domain models for the reconciliation batch service.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use sqlx::FromRow;

// ============================================================================
// Source Feed Models
// ============================================================================

/// A bank statement transaction, immutable after ingest.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct BankTransaction {
    pub id: i64,
    pub external_id: String,
    pub account_number: String,
    pub amount: Decimal,
    pub transaction_date: NaiveDate,
    pub description: String,
    pub reference_number: Option<String>,
    #[serde(skip)]
    pub created_utc: DateTime<Utc>,
    #[serde(skip)]
    pub updated_utc: DateTime<Utc>,
}

impl BankTransaction {
    /// Reference number, treating empty strings as absent.
    pub fn reference(&self) -> Option<&str> {
        self.reference_number.as_deref().filter(|r| !r.is_empty())
    }
}

/// An internal accounting ledger entry, immutable after ingest.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct AccountingEntry {
    pub id: i64,
    pub external_id: String,
    pub account_code: String,
    pub amount: Decimal,
    pub entry_date: NaiveDate,
    pub description: String,
    pub invoice_number: Option<String>,
    #[serde(skip)]
    pub created_utc: DateTime<Utc>,
    #[serde(skip)]
    pub updated_utc: DateTime<Utc>,
}

impl AccountingEntry {
    /// Invoice number, treating empty strings as absent.
    pub fn invoice(&self) -> Option<&str> {
        self.invoice_number.as_deref().filter(|i| !i.is_empty())
    }
}

// ============================================================================
// Batch Models
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchStatus {
    Matched,
    UnmatchedBank,
    UnmatchedAccounting,
    Disputed,
    Resolved,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Matched => "matched",
            Self::UnmatchedBank => "unmatched_bank",
            Self::UnmatchedAccounting => "unmatched_accounting",
            Self::Disputed => "disputed",
            Self::Resolved => "resolved",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "matched" => Self::Matched,
            "unmatched_bank" => Self::UnmatchedBank,
            "unmatched_accounting" => Self::UnmatchedAccounting,
            "disputed" => Self::Disputed,
            "resolved" => Self::Resolved,
            _ => Self::Matched,
        }
    }
}

/// One reconciliation run over a date window.
#[derive(Debug, Clone, FromRow)]
pub struct Batch {
    pub id: i64,
    pub batch_key: String,
    pub status: String,
    pub match_confidence: f64,
    pub amount_difference: Decimal,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

// ============================================================================
// Mapping Models
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingKind {
    OneToOne,
    OneToMany,
    ManyToOne,
}

impl MappingKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OneToOne => "one_to_one",
            Self::OneToMany => "one_to_many",
            Self::ManyToOne => "many_to_one",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "one_to_one" => Self::OneToOne,
            "one_to_many" => Self::OneToMany,
            "many_to_one" => Self::ManyToOne,
            _ => Self::OneToOne,
        }
    }
}

/// An edge linking a bank transaction to an accounting entry under a batch.
#[derive(Debug, Clone, FromRow)]
pub struct Mapping {
    pub id: i64,
    pub batch_id: i64,
    pub bank_transaction_id: Option<i64>,
    pub accounting_entry_id: Option<i64>,
    pub mapping_type: String,
    pub created_utc: DateTime<Utc>,
}

// ============================================================================
// Audit Models
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditAction {
    Created,
    Matched,
    Unmatched,
    Disputed,
    Resolved,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Matched => "matched",
            Self::Unmatched => "unmatched",
            Self::Disputed => "disputed",
            Self::Resolved => "resolved",
        }
    }
}

/// Append-only audit trail entry. Ingest-time events carry no batch id.
#[derive(Debug, Clone, FromRow)]
pub struct AuditEvent {
    pub id: i64,
    pub batch_id: Option<i64>,
    pub action: String,
    pub details: serde_json::Value,
    pub actor: String,
    pub created_utc: DateTime<Utc>,
}
