//! Services module.

pub mod database;
pub mod ingestion;
pub mod metrics;
pub mod reconciliation;

pub use database::Database;
pub use ingestion::IngestionService;
pub use metrics::{get_metrics, init_metrics};
pub use reconciliation::ReconciliationService;
