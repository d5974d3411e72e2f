//! Application startup and lifecycle management.

use crate::config::AppConfig;
use crate::error::AppError;
use crate::handlers;
use crate::middleware::{metrics_middleware, request_id_middleware};
use crate::services::{init_metrics, Database, IngestionService, ReconciliationService};
use axum::routing::{get, post};
use axum::{middleware, Router};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub db: Arc<Database>,
    pub reconciliation: Arc<ReconciliationService>,
    pub ingestion: Arc<IngestionService>,
}

/// Application container for managing server lifecycle.
pub struct Application {
    port: u16,
    listener: TcpListener,
    state: AppState,
}

impl Application {
    /// Build the application with the given configuration.
    pub async fn build(config: AppConfig) -> Result<Self, AppError> {
        Self::build_internal(config, true).await
    }

    /// Build the application without running migrations.
    /// Use this in tests when migrations are already applied by the test harness.
    pub async fn build_without_migrations(config: AppConfig) -> Result<Self, AppError> {
        Self::build_internal(config, false).await
    }

    async fn build_internal(config: AppConfig, run_migrations: bool) -> Result<Self, AppError> {
        init_metrics();

        let db = Database::new(
            &config.database.url,
            config.database.max_connections,
            config.database.min_connections,
        )
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Failed to connect to PostgreSQL");
            e
        })?;

        if run_migrations {
            db.run_migrations(config.migration_dir.as_deref())
                .await
                .map_err(|e| {
                    tracing::error!(error = %e, "Failed to run migrations");
                    e
                })?;
        }

        let db = Arc::new(db);
        let reconciliation = Arc::new(ReconciliationService::new(
            db.clone(),
            config.matching.tolerances(),
        ));
        let ingestion = Arc::new(IngestionService::new(db.clone()));

        let listener = TcpListener::bind(&config.server_address).await.map_err(|e| {
            tracing::error!(error = %e, addr = %config.server_address, "Failed to bind listener");
            AppError::from(e)
        })?;
        let port = listener.local_addr()?.port();

        tracing::info!(port = port, "Reconciliation service listener bound");

        let state = AppState {
            config,
            db,
            reconciliation,
            ingestion,
        };

        Ok(Self {
            port,
            listener,
            state,
        })
    }

    /// Get the port the server is listening on.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Get a reference to the database.
    pub fn db(&self) -> &Database {
        &self.state.db
    }

    /// Run the application until stopped.
    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        let router = build_router(self.state);

        tracing::info!(
            version = env!("CARGO_PKG_VERSION"),
            port = self.port,
            "Service ready to accept connections"
        );

        axum::serve(self.listener, router).await
    }
}

/// Assemble the REST surface.
pub fn build_router(state: AppState) -> Router {
    let api = Router::new()
        .route(
            "/reconciliation/start",
            post(handlers::reconciliation::start_reconciliation),
        )
        .route(
            "/reconciliation/unmatched",
            get(handlers::reconciliation::get_unmatched_records),
        )
        .route(
            "/reconciliation/:batch_id/status",
            get(handlers::reconciliation::get_batch_status),
        )
        .route(
            "/reconciliation/:batch_id/resolve",
            post(handlers::reconciliation::resolve_dispute),
        )
        .route(
            "/data/bank-transactions",
            post(handlers::data::ingest_bank_transactions),
        )
        .route(
            "/data/accounting-entries",
            post(handlers::data::ingest_accounting_entries),
        );

    Router::new()
        .nest("/api/v1", api)
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        .route("/metrics", get(handlers::metrics_handler))
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(metrics_middleware))
        .layer(middleware::from_fn(request_id_middleware))
        .with_state(state)
}
