//! Database service: connection pool, candidate loading, batch persistence
//! and the surrounding CRUD operations.

use crate::error::AppError;
use crate::matching::MatchProposal;
use crate::models::{AccountingEntry, AuditAction, BankTransaction, Batch, BatchStatus};
use crate::services::metrics::DB_QUERY_DURATION;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::json;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::FromRow;
use std::collections::HashSet;
use std::time::Duration;
use tracing::{info, instrument};

/// Actor recorded on audit events not attributable to a user.
pub const SYSTEM_ACTOR: &str = "system";

/// Batch key for a run started at `now`, e.g. `REC-20240115-093000`.
///
/// Keys are minted in UTC so that replicas in different zones agree.
pub fn batch_key_for(now: DateTime<Utc>) -> String {
    format!("REC-{}", now.format("%Y%m%d-%H%M%S"))
}

/// A bank transaction accepted for insert by the ingestion service.
#[derive(Debug, Clone)]
pub struct NewBankTransaction {
    pub external_id: String,
    pub account_number: String,
    pub amount: Decimal,
    pub transaction_date: NaiveDate,
    pub description: String,
    pub reference_number: Option<String>,
}

/// An accounting entry accepted for insert by the ingestion service.
#[derive(Debug, Clone)]
pub struct NewAccountingEntry {
    pub external_id: String,
    pub account_code: String,
    pub amount: Decimal,
    pub entry_date: NaiveDate,
    pub description: String,
    pub invoice_number: Option<String>,
}

/// Slim projection returned by the unmatched-records snapshot.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct UnmatchedBankRecord {
    pub id: i64,
    pub external_id: String,
    pub amount: Decimal,
    pub transaction_date: NaiveDate,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct UnmatchedEntryRecord {
    pub id: i64,
    pub external_id: String,
    pub amount: Decimal,
    pub entry_date: NaiveDate,
}

/// Outcome of a committed batch.
#[derive(Debug)]
pub struct PersistedBatch {
    pub batch: Batch,
    pub unmatched_bank: Vec<BankTransaction>,
    pub unmatched_accounting: Vec<AccountingEntry>,
}

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(database_url))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .max_lifetime(Duration::from_secs(300))
            .connect(database_url)
            .await
            .map_err(|e| {
                AppError::StoreUnavailable(anyhow::anyhow!("Failed to connect: {}", e))
            })?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Check database health.
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["health_check"])
            .start_timer();

        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| {
                AppError::StoreUnavailable(anyhow::anyhow!("Health check failed: {}", e))
            })?;

        timer.observe_duration();
        Ok(())
    }

    /// Run database migrations: from `migration_dir` when configured, from
    /// the embedded set otherwise.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self, migration_dir: Option<&str>) -> Result<(), AppError> {
        info!(migration_dir = migration_dir, "Running database migrations");
        match migration_dir {
            Some(dir) => {
                let migrator = sqlx::migrate::Migrator::new(std::path::PathBuf::from(dir))
                    .await
                    .map_err(|e| {
                        AppError::ConfigError(anyhow::anyhow!(
                            "Failed to load migrations from {}: {}",
                            dir,
                            e
                        ))
                    })?;
                migrator.run(&self.pool).await.map_err(|e| {
                    AppError::StoreUnavailable(anyhow::anyhow!("Migration failed: {}", e))
                })?;
            }
            None => {
                sqlx::migrate!("./migrations").run(&self.pool).await.map_err(|e| {
                    AppError::StoreUnavailable(anyhow::anyhow!("Migration failed: {}", e))
                })?;
            }
        }
        info!("Database migrations completed");
        Ok(())
    }

    // =========================================================================
    // Candidate Loading
    // =========================================================================

    /// Bank transactions in the inclusive window that no mapping references,
    /// ordered by `(transaction_date, id)`.
    #[instrument(skip(self))]
    pub async fn unreconciled_bank_transactions(
        &self,
        from_date: NaiveDate,
        to_date: NaiveDate,
    ) -> Result<Vec<BankTransaction>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["unreconciled_bank_transactions"])
            .start_timer();

        let transactions = sqlx::query_as::<_, BankTransaction>(
            r#"
            SELECT bt.id, bt.external_id, bt.account_number, bt.amount,
                   bt.transaction_date, bt.description, bt.reference_number,
                   bt.created_utc, bt.updated_utc
            FROM bank_transactions bt
            LEFT JOIN reconciliation_mappings rm ON rm.bank_transaction_id = bt.id
            WHERE rm.id IS NULL
              AND bt.transaction_date BETWEEN $1 AND $2
            ORDER BY bt.transaction_date, bt.id
            "#,
        )
        .bind(from_date)
        .bind(to_date)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::StoreUnavailable(anyhow::anyhow!(
                "Failed to load unreconciled bank transactions: {}",
                e
            ))
        })?;

        timer.observe_duration();
        Ok(transactions)
    }

    /// Accounting entries in the inclusive window that no mapping references,
    /// ordered by `(entry_date, id)`.
    #[instrument(skip(self))]
    pub async fn unreconciled_accounting_entries(
        &self,
        from_date: NaiveDate,
        to_date: NaiveDate,
    ) -> Result<Vec<AccountingEntry>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["unreconciled_accounting_entries"])
            .start_timer();

        let entries = sqlx::query_as::<_, AccountingEntry>(
            r#"
            SELECT ae.id, ae.external_id, ae.account_code, ae.amount,
                   ae.entry_date, ae.description, ae.invoice_number,
                   ae.created_utc, ae.updated_utc
            FROM accounting_entries ae
            LEFT JOIN reconciliation_mappings rm ON rm.accounting_entry_id = ae.id
            WHERE rm.id IS NULL
              AND ae.entry_date BETWEEN $1 AND $2
            ORDER BY ae.entry_date, ae.id
            "#,
        )
        .bind(from_date)
        .bind(to_date)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::StoreUnavailable(anyhow::anyhow!(
                "Failed to load unreconciled accounting entries: {}",
                e
            ))
        })?;

        timer.observe_duration();
        Ok(entries)
    }

    // =========================================================================
    // Batch Persistence
    // =========================================================================

    /// Persist one reconciliation run: the batch row, its mappings, its
    /// audit trail and the residual bookkeeping, in a single transaction.
    /// Nothing is observable unless the commit succeeds.
    #[instrument(skip_all, fields(proposals = proposals.len()))]
    pub async fn persist_batch(
        &self,
        proposals: &[MatchProposal],
        bank: &[BankTransaction],
        entries: &[AccountingEntry],
    ) -> Result<PersistedBatch, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["persist_batch"])
            .start_timer();

        let match_confidence = if proposals.is_empty() {
            0.0
        } else {
            proposals.iter().map(|p| p.confidence).sum::<f64>() / proposals.len() as f64
        };
        let amount_difference: Decimal = proposals.iter().map(|p| p.amount_difference).sum();

        // Batch keys have second resolution, so two runs landing in the same
        // second collide on the unique constraint; the loser waits out the
        // second and retries with a fresh key.
        let mut attempts = 0;
        let (mut tx, mut batch) = loop {
            let batch_key = batch_key_for(Utc::now());
            let mut tx = self.pool.begin().await.map_err(|e| {
                AppError::StoreUnavailable(anyhow::anyhow!("Failed to begin transaction: {}", e))
            })?;

            let inserted = sqlx::query_as::<_, Batch>(
                r#"
                INSERT INTO reconciliation_batches (batch_key, status, match_confidence, amount_difference)
                VALUES ($1, $2, $3, $4)
                RETURNING id, batch_key, status, match_confidence, amount_difference, created_utc, updated_utc
                "#,
            )
            .bind(&batch_key)
            .bind(BatchStatus::Matched.as_str())
            .bind(match_confidence)
            .bind(amount_difference)
            .fetch_one(&mut *tx)
            .await;

            match inserted {
                Ok(batch) => break (tx, batch),
                Err(sqlx::Error::Database(ref db_err))
                    if db_err.is_unique_violation() && attempts < 10 =>
                {
                    tx.rollback().await.ok();
                    attempts += 1;
                    let millis =
                        1_025u64.saturating_sub(u64::from(Utc::now().timestamp_subsec_millis()));
                    tokio::time::sleep(Duration::from_millis(millis)).await;
                }
                Err(e) => {
                    return Err(AppError::PersistFailed(anyhow::anyhow!(
                        "Failed to create batch: {}",
                        e
                    )))
                }
            }
        };

        for proposal in proposals {
            for ae in &proposal.entries {
                sqlx::query(
                    r#"
                    INSERT INTO reconciliation_mappings (batch_id, bank_transaction_id, accounting_entry_id, mapping_type)
                    VALUES ($1, $2, $3, $4)
                    "#,
                )
                .bind(batch.id)
                .bind(proposal.bank.id)
                .bind(ae.id)
                .bind(proposal.kind.as_str())
                .execute(&mut *tx)
                .await
                .map_err(|e| {
                    AppError::PersistFailed(anyhow::anyhow!("Failed to create mapping: {}", e))
                })?;
            }

            let details = json!({
                "confidence": proposal.confidence,
                "criteria": proposal.criteria,
                "match_type": proposal.kind.as_str(),
            });
            self.insert_audit_event(&mut tx, Some(batch.id), AuditAction::Matched, &details)
                .await?;
        }

        let claimed_bank: HashSet<i64> = proposals.iter().map(|p| p.bank.id).collect();
        let claimed_entries: HashSet<i64> = proposals
            .iter()
            .flat_map(|p| p.entries.iter().map(|ae| ae.id))
            .collect();

        let unmatched_bank: Vec<BankTransaction> = bank
            .iter()
            .filter(|bt| !claimed_bank.contains(&bt.id))
            .cloned()
            .collect();
        let unmatched_accounting: Vec<AccountingEntry> = entries
            .iter()
            .filter(|ae| !claimed_entries.contains(&ae.id))
            .cloned()
            .collect();

        if !unmatched_bank.is_empty() || !unmatched_accounting.is_empty() {
            batch = sqlx::query_as::<_, Batch>(
                r#"
                UPDATE reconciliation_batches
                SET status = $2, updated_utc = NOW()
                WHERE id = $1
                RETURNING id, batch_key, status, match_confidence, amount_difference, created_utc, updated_utc
                "#,
            )
            .bind(batch.id)
            .bind(BatchStatus::UnmatchedBank.as_str())
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| {
                AppError::PersistFailed(anyhow::anyhow!("Failed to update batch status: {}", e))
            })?;

            for ae in &unmatched_accounting {
                let bank_ref_candidate = bank
                    .iter()
                    .find(|bt| bt.reference().is_some() && bt.reference() == ae.invoice())
                    .map(|bt| bt.external_id.as_str());
                let details = json!({
                    "accounting_id": ae.external_id,
                    "bank_ref_candidate": bank_ref_candidate,
                });
                self.insert_audit_event(&mut tx, Some(batch.id), AuditAction::Unmatched, &details)
                    .await?;
            }
        }

        tx.commit().await.map_err(|e| {
            AppError::PersistFailed(anyhow::anyhow!("Failed to commit batch: {}", e))
        })?;

        timer.observe_duration();
        info!(
            batch_key = %batch.batch_key,
            status = %batch.status,
            matches = proposals.len(),
            unmatched_bank = unmatched_bank.len(),
            unmatched_accounting = unmatched_accounting.len(),
            "Reconciliation batch committed"
        );

        Ok(PersistedBatch {
            batch,
            unmatched_bank,
            unmatched_accounting,
        })
    }

    async fn insert_audit_event(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        batch_id: Option<i64>,
        action: AuditAction,
        details: &serde_json::Value,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO reconciliation_audit (batch_id, action, details, actor)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(batch_id)
        .bind(action.as_str())
        .bind(details)
        .bind(SYSTEM_ACTOR)
        .execute(&mut **tx)
        .await
        .map_err(|e| {
            AppError::PersistFailed(anyhow::anyhow!("Failed to create audit event: {}", e))
        })?;
        Ok(())
    }

    // =========================================================================
    // Batch Queries & Dispute Resolution
    // =========================================================================

    #[instrument(skip(self), fields(batch_key = %batch_key))]
    pub async fn get_batch_by_key(&self, batch_key: &str) -> Result<Option<Batch>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_batch_by_key"])
            .start_timer();

        let batch = sqlx::query_as::<_, Batch>(
            r#"
            SELECT id, batch_key, status, match_confidence, amount_difference, created_utc, updated_utc
            FROM reconciliation_batches
            WHERE batch_key = $1
            "#,
        )
        .bind(batch_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::StoreUnavailable(anyhow::anyhow!("Failed to get batch: {}", e)))?;

        timer.observe_duration();
        Ok(batch)
    }

    /// Mark a disputed batch as matched and append the resolution payload to
    /// the audit trail. Returns `None` when the batch key is unknown.
    #[instrument(skip(self, resolution), fields(batch_key = %batch_key))]
    pub async fn resolve_dispute(
        &self,
        batch_key: &str,
        resolution: &serde_json::Value,
    ) -> Result<Option<Batch>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["resolve_dispute"])
            .start_timer();

        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::StoreUnavailable(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        let batch = sqlx::query_as::<_, Batch>(
            r#"
            UPDATE reconciliation_batches
            SET status = $2, updated_utc = NOW()
            WHERE batch_key = $1
            RETURNING id, batch_key, status, match_confidence, amount_difference, created_utc, updated_utc
            "#,
        )
        .bind(batch_key)
        .bind(BatchStatus::Matched.as_str())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| {
            AppError::PersistFailed(anyhow::anyhow!("Failed to update batch status: {}", e))
        })?;

        let Some(batch) = batch else {
            tx.rollback().await.ok();
            timer.observe_duration();
            return Ok(None);
        };

        self.insert_audit_event(&mut tx, Some(batch.id), AuditAction::Resolved, resolution)
            .await?;

        tx.commit().await.map_err(|e| {
            AppError::PersistFailed(anyhow::anyhow!("Failed to commit resolution: {}", e))
        })?;

        timer.observe_duration();
        info!(batch_key = %batch.batch_key, "Dispute resolved");
        Ok(Some(batch))
    }

    // =========================================================================
    // Unmatched Snapshot
    // =========================================================================

    /// Batch-independent snapshot of rows in the window that no mapping
    /// references yet.
    #[instrument(skip(self))]
    pub async fn unmatched_snapshot(
        &self,
        from_date: NaiveDate,
        to_date: NaiveDate,
    ) -> Result<(Vec<UnmatchedBankRecord>, Vec<UnmatchedEntryRecord>), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["unmatched_snapshot"])
            .start_timer();

        let bank = sqlx::query_as::<_, UnmatchedBankRecord>(
            r#"
            SELECT bt.id, bt.external_id, bt.amount, bt.transaction_date
            FROM bank_transactions bt
            LEFT JOIN reconciliation_mappings rm ON rm.bank_transaction_id = bt.id
            WHERE rm.id IS NULL
              AND bt.transaction_date BETWEEN $1 AND $2
            ORDER BY bt.transaction_date, bt.id
            "#,
        )
        .bind(from_date)
        .bind(to_date)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::StoreUnavailable(anyhow::anyhow!(
                "Failed to load unmatched bank transactions: {}",
                e
            ))
        })?;

        let accounting = sqlx::query_as::<_, UnmatchedEntryRecord>(
            r#"
            SELECT ae.id, ae.external_id, ae.amount, ae.entry_date
            FROM accounting_entries ae
            LEFT JOIN reconciliation_mappings rm ON rm.accounting_entry_id = ae.id
            WHERE rm.id IS NULL
              AND ae.entry_date BETWEEN $1 AND $2
            ORDER BY ae.entry_date, ae.id
            "#,
        )
        .bind(from_date)
        .bind(to_date)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::StoreUnavailable(anyhow::anyhow!(
                "Failed to load unmatched accounting entries: {}",
                e
            ))
        })?;

        timer.observe_duration();
        Ok((bank, accounting))
    }

    // =========================================================================
    // Feed Inserts
    // =========================================================================

    /// Insert a single bank transaction. Duplicate external ids surface as
    /// `BadRequest` so ingestion can record them per row.
    #[instrument(skip(self, row), fields(external_id = %row.external_id))]
    pub async fn insert_bank_transaction(
        &self,
        row: &NewBankTransaction,
    ) -> Result<i64, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_bank_transaction"])
            .start_timer();

        let id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO bank_transactions (external_id, account_number, amount, transaction_date, description, reference_number)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id
            "#,
        )
        .bind(&row.external_id)
        .bind(&row.account_number)
        .bind(row.amount)
        .bind(row.transaction_date)
        .bind(&row.description)
        .bind(&row.reference_number)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                AppError::BadRequest(anyhow::anyhow!(
                    "duplicate external_id {}",
                    row.external_id
                ))
            }
            _ => AppError::StoreUnavailable(anyhow::anyhow!(
                "Failed to insert bank transaction: {}",
                e
            )),
        })?;

        timer.observe_duration();
        Ok(id)
    }

    /// Insert a single accounting entry; same error contract as
    /// [`Self::insert_bank_transaction`].
    #[instrument(skip(self, row), fields(external_id = %row.external_id))]
    pub async fn insert_accounting_entry(
        &self,
        row: &NewAccountingEntry,
    ) -> Result<i64, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_accounting_entry"])
            .start_timer();

        let id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO accounting_entries (external_id, account_code, amount, entry_date, description, invoice_number)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id
            "#,
        )
        .bind(&row.external_id)
        .bind(&row.account_code)
        .bind(row.amount)
        .bind(row.entry_date)
        .bind(&row.description)
        .bind(&row.invoice_number)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                AppError::BadRequest(anyhow::anyhow!(
                    "duplicate external_id {}",
                    row.external_id
                ))
            }
            _ => AppError::StoreUnavailable(anyhow::anyhow!(
                "Failed to insert accounting entry: {}",
                e
            )),
        })?;

        timer.observe_duration();
        Ok(id)
    }

    /// Append an ingest-time audit event; these precede any batch and carry
    /// no batch id.
    #[instrument(skip(self, details))]
    pub async fn insert_feed_audit(
        &self,
        details: &serde_json::Value,
    ) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_feed_audit"])
            .start_timer();

        sqlx::query(
            r#"
            INSERT INTO reconciliation_audit (batch_id, action, details, actor)
            VALUES (NULL, $1, $2, $3)
            "#,
        )
        .bind(AuditAction::Created.as_str())
        .bind(details)
        .bind(SYSTEM_ACTOR)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            AppError::StoreUnavailable(anyhow::anyhow!("Failed to create audit event: {}", e))
        })?;

        timer.observe_duration();
        Ok(())
    }
}
