//! Database module for SQLite persistence.
//!
//! SQLite holds every document collection, the event outbox and blob metadata.

mod query;
mod store;

pub use query::*;
pub use store::*;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;

/// Initialize the database connection pool and run migrations.
pub async fn init_database(db_path: &Path) -> Result<SqlitePool, sqlx::Error> {
    if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(sqlx::Error::Io)?;
    }

    let db_url = format!("sqlite:{}?mode=rwc", db_path.display());

    let options = SqliteConnectOptions::from_str(&db_url)?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
        .busy_timeout(std::time::Duration::from_secs(30));

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    run_migrations(&pool).await?;

    Ok(pool)
}

/// Run database migrations.
async fn run_migrations(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            collection TEXT NOT NULL,
            id TEXT NOT NULL,
            data TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (collection, id)
        );
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS events (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            id TEXT NOT NULL UNIQUE,
            kind TEXT NOT NULL,
            payload TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            attempts INTEGER NOT NULL DEFAULT 0,
            available_at INTEGER NOT NULL,
            last_error TEXT,
            created_at INTEGER NOT NULL
        );
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS blob_objects (
            bucket TEXT NOT NULL,
            name TEXT NOT NULL,
            content_type TEXT NOT NULL,
            size INTEGER NOT NULL,
            metadata TEXT NOT NULL DEFAULT '{}',
            time_created INTEGER NOT NULL,
            updated INTEGER NOT NULL,
            PRIMARY KEY (bucket, name)
        );
        "#,
    )
    .execute(pool)
    .await?;

    // Secondary indexes for feed and notification scans
    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_documents_node
            ON documents(collection, json_extract(data, '$.nodeId'));
        CREATE INDEX IF NOT EXISTS idx_documents_user
            ON documents(collection, json_extract(data, '$.userId'));
        CREATE INDEX IF NOT EXISTS idx_documents_created
            ON documents(collection, json_extract(data, '$.createdAt'));
        CREATE INDEX IF NOT EXISTS idx_events_due ON events(status, available_at);
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}
