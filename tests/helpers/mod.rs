//! Shared setup for integration tests

use site_jobs::db::{self, PgJobStore};
use site_jobs::services::queue::JobQueue;
use sqlx::PgPool;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::sleep;
use uuid::Uuid;

/// Tests share one table, so they take turns
static SERIAL: Mutex<()> = Mutex::const_new(());

pub async fn serial() -> MutexGuard<'static, ()> {
    SERIAL.lock().await
}

/// Get the database URL from env, panicking with a helpful message if not found
pub fn database_url() -> String {
    dotenvy::dotenv().ok();
    std::env::var("DATABASE_URL")
        .expect("DATABASE_URL environment variable must be set to run integration tests")
}

/// Connect, migrate and start from an empty job table
pub async fn fresh_queue() -> (PgPool, JobQueue<PgJobStore>) {
    let pool = db::init_pool(&database_url())
        .await
        .expect("Failed to connect to database");

    db::run_migrations(&pool)
        .await
        .expect("Failed to run migrations");

    sqlx::query("DELETE FROM background_jobs")
        .execute(&pool)
        .await
        .expect("Failed to clear background_jobs");

    (pool.clone(), JobQueue::new(PgJobStore::new(pool)))
}

/// Rewrite timestamps directly, for setting up aged or expired rows
pub async fn backdate(pool: &PgPool, id: Uuid, column: &str, interval: &str) {
    sqlx::query(&format!(
        "UPDATE background_jobs SET {column} = NOW() - INTERVAL '{interval}' WHERE id = $1"
    ))
    .bind(id)
    .execute(pool)
    .await
    .expect("Failed to backdate job");
}

/// Poll until `check` passes or the timeout expires
pub async fn eventually<F, Fut>(timeout_ms: u64, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let attempts = timeout_ms / 25;
    for _ in 0..attempts {
        if check().await {
            return true;
        }
        sleep(Duration::from_millis(25)).await;
    }
    false
}
