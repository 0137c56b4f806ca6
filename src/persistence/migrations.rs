//! Schema versioning and migrations for the state database.
//!
//! Manages database schema evolution with forward-only migrations.

use crate::error::{AppError, Result};
use sqlx::sqlite::SqlitePool;
use tracing::info;

const CURRENT_VERSION: i32 = 1;

/// Runs all pending migrations on the database.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    ensure_schema_versions_table(pool).await?;

    let current = get_current_version(pool).await?;

    if current > CURRENT_VERSION {
        return Err(AppError::persistence(format!(
            "database schema version ({current}) is newer than supported version ({CURRENT_VERSION})"
        )));
    }

    if current < CURRENT_VERSION {
        info!("migrating state database from version {} to {}", current, CURRENT_VERSION);
        run_pending_migrations(pool, current).await?;
    }

    Ok(())
}

/// Ensures the schema_versions table exists.
async fn ensure_schema_versions_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_versions (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| AppError::persistence(format!("failed to create schema_versions table: {e}")))?;

    Ok(())
}

/// Gets the current schema version.
async fn get_current_version(pool: &SqlitePool) -> Result<i32> {
    let row: Option<(i32,)> = sqlx::query_as("SELECT MAX(version) FROM schema_versions")
        .fetch_optional(pool)
        .await
        .map_err(|e| AppError::persistence(format!("failed to get schema version: {e}")))?;

    Ok(row.map(|(v,)| v).unwrap_or(0))
}

/// Runs migrations from the current version to the target version.
async fn run_pending_migrations(pool: &SqlitePool, from_version: i32) -> Result<()> {
    for version in (from_version + 1)..=CURRENT_VERSION {
        run_migration(pool, version).await?;
        record_version(pool, version).await?;
        info!("applied migration v{}", version);
    }
    Ok(())
}

/// Records a completed migration version.
async fn record_version(pool: &SqlitePool, version: i32) -> Result<()> {
    sqlx::query("INSERT INTO schema_versions (version) VALUES (?)")
        .bind(version)
        .execute(pool)
        .await
        .map_err(|e| AppError::persistence(format!("failed to record migration: {e}")))?;
    Ok(())
}

/// Runs a specific migration version.
async fn run_migration(pool: &SqlitePool, version: i32) -> Result<()> {
    match version {
        1 => migration_v1(pool).await,
        _ => Err(AppError::persistence(format!("unknown migration version: {version}"))),
    }
}

/// Migration v1: chat history and per-step workflow log tables.
async fn migration_v1(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chat_history (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            admin_id INTEGER NOT NULL,
            session_id TEXT NOT NULL,
            role TEXT NOT NULL CHECK (role IN ('user', 'assistant')),
            content TEXT NOT NULL,
            tokens INTEGER,
            model_name TEXT,
            is_deleted INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at TEXT NOT NULL DEFAULT (datetime('now')),
            created_by INTEGER,
            updated_by INTEGER
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| AppError::persistence(format!("failed to create chat_history table: {e}")))?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chat_history_session ON chat_history(session_id)")
        .execute(pool)
        .await
        .map_err(|e| AppError::persistence(format!("failed to create chat_history session index: {e}")))?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chat_history_admin ON chat_history(admin_id)")
        .execute(pool)
        .await
        .map_err(|e| AppError::persistence(format!("failed to create chat_history admin index: {e}")))?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS workflow_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id TEXT NOT NULL,
            step_name TEXT NOT NULL,
            input_json TEXT,
            output_json TEXT,
            status TEXT NOT NULL CHECK (status IN ('success', 'failed')),
            error_message TEXT,
            risk_level TEXT,
            is_deleted INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at TEXT NOT NULL DEFAULT (datetime('now')),
            created_by INTEGER,
            updated_by INTEGER
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| AppError::persistence(format!("failed to create workflow_log table: {e}")))?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_workflow_log_session ON workflow_log(session_id)")
        .execute(pool)
        .await
        .map_err(|e| AppError::persistence(format!("failed to create workflow_log session index: {e}")))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn test_pool() -> SqlitePool {
        SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_migrations_run_successfully() {
        let pool = test_pool().await;
        run_migrations(&pool).await.unwrap();

        let version = get_current_version(&pool).await.unwrap();
        assert_eq!(version, CURRENT_VERSION);
    }

    #[tokio::test]
    async fn test_migrations_are_idempotent() {
        let pool = test_pool().await;

        run_migrations(&pool).await.unwrap();
        run_migrations(&pool).await.unwrap();

        let version = get_current_version(&pool).await.unwrap();
        assert_eq!(version, CURRENT_VERSION);
    }

    #[tokio::test]
    async fn test_tables_created() {
        let pool = test_pool().await;
        run_migrations(&pool).await.unwrap();

        let tables: Vec<(String,)> =
            sqlx::query_as("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
                .fetch_all(&pool)
                .await
                .unwrap();

        let table_names: Vec<&str> = tables.iter().map(|(n,)| n.as_str()).collect();
        assert!(table_names.contains(&"chat_history"));
        assert!(table_names.contains(&"workflow_log"));
        assert!(table_names.contains(&"schema_versions"));
    }
}
