//! Per-step workflow log: one row per graph node completion (or failure).

use serde::Serialize;
use sqlx::{FromRow, SqlitePool};

use crate::error::{AppError, Result};

/// Outcome of a single graph node's execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStepStatus {
    Success,
    Failed,
}

impl WorkflowStepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for WorkflowStepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single row in the `workflow_log` table.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct WorkflowLogRow {
    pub id: i64,
    pub session_id: String,
    pub step_name: String,
    pub input_json: Option<String>,
    pub output_json: Option<String>,
    pub status: String,
    pub error_message: Option<String>,
    pub risk_level: Option<String>,
    pub created_at: String,
}

/// Inserts one workflow log row for a completed (or failed) graph node.
///
/// `input_json`/`output_json` are serialized to text; callers pass any
/// `Serialize` value, matching the loose per-step shapes the graph produces.
/// Generic over the executor so callers can run it either directly against
/// the pool or inside a [`sqlx::Transaction`] for atomic multi-row commits.
pub async fn insert<'e, E>(
    executor: E,
    admin_id: i64,
    session_id: &str,
    step_name: &str,
    input: &impl serde::Serialize,
    output: Option<&impl serde::Serialize>,
    status: WorkflowStepStatus,
    error_message: Option<&str>,
) -> Result<i64>
where
    E: sqlx::SqliteExecutor<'e>,
{
    let input_json = serde_json::to_string(input)
        .map_err(|e| AppError::persistence(format!("failed to serialize workflow step input: {e}")))?;
    let output_json = match output {
        Some(value) => Some(
            serde_json::to_string(value)
                .map_err(|e| AppError::persistence(format!("failed to serialize workflow step output: {e}")))?,
        ),
        None => None,
    };

    let result = sqlx::query(
        r#"
        INSERT INTO workflow_log
            (session_id, step_name, input_json, output_json, status, error_message, risk_level, created_by, updated_by)
        VALUES (?, ?, ?, ?, ?, ?, 'low', ?, ?)
        "#,
    )
    .bind(session_id)
    .bind(step_name)
    .bind(input_json)
    .bind(output_json)
    .bind(status.as_str())
    .bind(error_message)
    .bind(admin_id)
    .bind(admin_id)
    .execute(executor)
    .await
    .map_err(|e| AppError::persistence(format!("failed to insert workflow log row: {e}")))?;

    Ok(result.last_insert_rowid())
}

/// Lists workflow log rows for a session, oldest first, for diagnostics.
pub async fn list_for_session(pool: &SqlitePool, session_id: &str) -> Result<Vec<WorkflowLogRow>> {
    let rows = sqlx::query_as::<_, WorkflowLogRow>(
        r#"
        SELECT id, session_id, step_name, input_json, output_json, status, error_message, risk_level, created_at
        FROM workflow_log
        WHERE session_id = ? AND is_deleted = 0
        ORDER BY created_at ASC, id ASC
        "#,
    )
    .bind(session_id)
    .fetch_all(pool)
    .await
    .map_err(|e| AppError::persistence(format!("failed to list workflow log rows: {e}")))?;

    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::migrations::run_migrations;
    use serde_json::json;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn test_pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        run_migrations(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn test_insert_and_list_success_step() {
        let pool = test_pool().await;
        insert(
            &pool,
            1,
            "sess-1",
            "intent_recognition",
            &json!({"message": "how many students"}),
            Some(&json!({"intent": "business_query"})),
            WorkflowStepStatus::Success,
            None,
        )
        .await
        .unwrap();

        let rows = list_for_session(&pool, "sess-1").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].step_name, "intent_recognition");
        assert_eq!(rows[0].status, "success");
        assert_eq!(rows[0].risk_level.as_deref(), Some("low"));
    }

    #[tokio::test]
    async fn test_insert_failed_step_with_null_output() {
        let pool = test_pool().await;
        insert(
            &pool,
            1,
            "sess-1",
            "sql_validate",
            &json!({"sql": "select 1"}),
            None::<&serde_json::Value>,
            WorkflowStepStatus::Failed,
            Some("sql_validate_readonly_violation"),
        )
        .await
        .unwrap();

        let rows = list_for_session(&pool, "sess-1").await.unwrap();
        assert_eq!(rows[0].status, "failed");
        assert!(rows[0].output_json.is_none());
        assert_eq!(rows[0].error_message.as_deref(), Some("sql_validate_readonly_violation"));
    }

    #[tokio::test]
    async fn test_list_for_session_ordered_by_time() {
        let pool = test_pool().await;
        for step in ["intent_recognition", "task_parse", "sql_generation"] {
            insert(
                &pool,
                1,
                "sess-1",
                step,
                &json!({}),
                Some(&json!({})),
                WorkflowStepStatus::Success,
                None,
            )
            .await
            .unwrap();
        }

        let rows = list_for_session(&pool, "sess-1").await.unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].step_name, "intent_recognition");
        assert_eq!(rows[2].step_name, "sql_generation");
    }
}
