//! Common test utilities for integration tests.
//!
//! These tests run against a real PostgreSQL database addressed by
//! `TEST_DATABASE_URL`; when the variable is unset each test skips itself
//! instead of failing, so the pure-engine suite stays runnable anywhere.

use bank_recon::config::{AppConfig, DatabaseConfig, MatchingConfig};
use bank_recon::startup::Application;
use chrono::{Days, NaiveDate};
use rust_decimal::Decimal;
use std::sync::Once;
use uuid::Uuid;

static INIT: Once = Once::new();

/// Initialize tracing for tests (only once).
pub fn init_tracing() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("info,bank_recon=debug,sqlx=warn")
            .with_test_writer()
            .try_init()
            .ok();
    });
}

fn test_config(database_url: String) -> AppConfig {
    AppConfig {
        server_address: "127.0.0.1:0".to_string(),
        environment: "test".to_string(),
        service_name: "bank-recon-test".to_string(),
        log_level: "debug".to_string(),
        database: DatabaseConfig {
            url: database_url,
            max_connections: 4,
            min_connections: 1,
        },
        migration_dir: None,
        matching: MatchingConfig {
            confidence_threshold: 0.60,
            date_tolerance_days: 3,
            amount_tolerance_percent: Decimal::new(1, 2),
        },
    }
}

/// Test application wrapper.
#[allow(dead_code)]
pub struct TestApp {
    pub address: String,
    pub client: reqwest::Client,
    pub pool: sqlx::PgPool,
}

#[allow(dead_code)]
impl TestApp {
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.address, path)
    }
}

/// Spawn a test application and return an HTTP client against it, or `None`
/// when no test database is configured.
pub async fn spawn_app() -> Option<TestApp> {
    init_tracing();

    let Ok(database_url) = std::env::var("TEST_DATABASE_URL") else {
        eprintln!("TEST_DATABASE_URL not set; skipping integration test");
        return None;
    };

    let app = Application::build(test_config(database_url.clone()))
        .await
        .expect("Failed to build application");
    let port = app.port();

    // Start the application in the background.
    tokio::spawn(async move {
        app.run_until_stopped().await.ok();
    });

    let client = reqwest::Client::new();
    let address = format!("http://127.0.0.1:{}", port);

    // Wait for the server to be ready with retry.
    let mut attempts = 0;
    loop {
        match client.get(format!("{address}/health")).send().await {
            Ok(_) => break,
            Err(_) if attempts < 20 => {
                attempts += 1;
                tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;
            }
            Err(e) => panic!("Server not reachable after 20 attempts: {}", e),
        }
    }

    let pool = sqlx::PgPool::connect(&database_url)
        .await
        .expect("Failed to connect test pool");

    Some(TestApp {
        address,
        client,
        pool,
    })
}

/// A short unique suffix for feed external ids.
#[allow(dead_code)]
pub fn unique_suffix() -> String {
    Uuid::new_v4().simple().to_string()[..12].to_string()
}

/// A date window far in the future and unique to this test run, so batches
/// from concurrent and prior runs never share candidates.
#[allow(dead_code)]
pub fn unique_window() -> (NaiveDate, NaiveDate) {
    let bytes = *Uuid::new_v4().as_bytes();
    let offset = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) % 250_000;
    let from = NaiveDate::from_ymd_opt(2100, 1, 1)
        .unwrap()
        .checked_add_days(Days::new(offset as u64 * 10))
        .unwrap();
    let to = from.checked_add_days(Days::new(5)).unwrap();
    (from, to)
}
