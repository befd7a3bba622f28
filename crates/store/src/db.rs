use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::str::FromStr;

use logtide_common::error::StoreError;

/// Open (or create) a file-backed SQLite pool.
pub async fn create_pool(database_url: &str, max_connections: u32) -> Result<SqlitePool, StoreError> {
    let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await?;

    tracing::info!(max_connections, "Connected to SQLite");
    Ok(pool)
}

/// In-memory pool for tests and ephemeral runs.
///
/// Capped at a single never-recycled connection: each SQLite `:memory:`
/// connection is its own database, so every handle must share the one
/// connection.
pub async fn create_memory_pool() -> Result<SqlitePool, StoreError> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await?;

    Ok(pool)
}
