//! Chat history storage: one row per user/assistant message.
//!
//! Sessions and messages are soft-deleted (`is_deleted`), never removed, so
//! that `WorkflowLog` rows referencing a `session_id` stay meaningful.

use serde::Serialize;
use sqlx::{FromRow, SqlitePool};

use crate::error::{AppError, Result};

/// Role of a chat history row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single row in the `chat_history` table.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct ChatHistoryRow {
    pub id: i64,
    pub admin_id: i64,
    pub session_id: String,
    #[sqlx(rename = "role")]
    pub message_role: String,
    pub content: String,
    pub tokens: Option<i64>,
    pub model_name: Option<String>,
    pub created_at: String,
}

/// Summary of one chat session, as returned by the session-list endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ChatSessionSummary {
    pub session_id: String,
    pub preview: String,
    pub last_active_at: String,
}

/// Inserts one chat history row. Used once per user turn and once per
/// assistant reply.
///
/// Generic over the executor so callers can run it either directly against
/// the pool or inside a [`sqlx::Transaction`] for atomic multi-row commits.
pub async fn insert<'e, E>(
    executor: E,
    admin_id: i64,
    session_id: &str,
    role: MessageRole,
    content: &str,
    tokens: Option<i64>,
    model_name: Option<&str>,
) -> Result<i64>
where
    E: sqlx::SqliteExecutor<'e>,
{
    let result = sqlx::query(
        r#"
        INSERT INTO chat_history (admin_id, session_id, role, content, tokens, model_name, created_by)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(admin_id)
    .bind(session_id)
    .bind(role.as_str())
    .bind(content)
    .bind(tokens)
    .bind(model_name)
    .bind(admin_id)
    .execute(executor)
    .await
    .map_err(|e| AppError::persistence(format!("failed to insert chat history row: {e}")))?;

    Ok(result.last_insert_rowid())
}

/// Lists chat sessions for an admin, most recently active first.
///
/// Preview is the first 7 characters of that session's first user message
/// (with an ellipsis when truncated), matching the admin console's list view.
pub async fn list_sessions(
    pool: &SqlitePool,
    admin_id: i64,
    offset: i64,
    limit: i64,
) -> Result<(Vec<ChatSessionSummary>, i64)> {
    let total: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(DISTINCT session_id) FROM chat_history
        WHERE admin_id = ? AND is_deleted = 0 AND role IN ('user', 'assistant')
        "#,
    )
    .bind(admin_id)
    .fetch_one(pool)
    .await
    .map_err(|e| AppError::persistence(format!("failed to count chat sessions: {e}")))?;

    let rows: Vec<(String, String)> = sqlx::query_as(
        r#"
        SELECT session_id, MAX(created_at) AS last_active_at
        FROM chat_history
        WHERE admin_id = ? AND is_deleted = 0 AND role IN ('user', 'assistant')
        GROUP BY session_id
        ORDER BY last_active_at DESC, session_id DESC
        LIMIT ? OFFSET ?
        "#,
    )
    .bind(admin_id)
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await
    .map_err(|e| AppError::persistence(format!("failed to list chat sessions: {e}")))?;

    let mut summaries = Vec::with_capacity(rows.len());
    for (session_id, last_active_at) in rows {
        let preview_source: Option<String> = sqlx::query_scalar(
            r#"
            SELECT content FROM chat_history
            WHERE admin_id = ? AND session_id = ? AND is_deleted = 0 AND role = 'user'
            ORDER BY id ASC LIMIT 1
            "#,
        )
        .bind(admin_id)
        .bind(&session_id)
        .fetch_optional(pool)
        .await
        .map_err(|e| AppError::persistence(format!("failed to load session preview: {e}")))?;

        let preview = preview_source
            .map(|text| {
                let trimmed = text.trim();
                let truncated: String = trimmed.chars().take(7).collect();
                if trimmed.chars().count() > 7 {
                    format!("{truncated}...")
                } else {
                    truncated
                }
            })
            .unwrap_or_default();

        summaries.push(ChatSessionSummary {
            session_id,
            preview,
            last_active_at,
        });
    }

    Ok((summaries, total))
}

/// Lists messages in a session, oldest first.
pub async fn list_messages(
    pool: &SqlitePool,
    admin_id: i64,
    session_id: &str,
    offset: i64,
    limit: i64,
) -> Result<(Vec<ChatHistoryRow>, i64)> {
    let total: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(*) FROM chat_history
        WHERE admin_id = ? AND session_id = ? AND is_deleted = 0 AND role IN ('user', 'assistant')
        "#,
    )
    .bind(admin_id)
    .bind(session_id)
    .fetch_one(pool)
    .await
    .map_err(|e| AppError::persistence(format!("failed to count chat messages: {e}")))?;

    let rows = sqlx::query_as::<_, ChatHistoryRow>(
        r#"
        SELECT id, admin_id, session_id, role, content, tokens, model_name, created_at
        FROM chat_history
        WHERE admin_id = ? AND session_id = ? AND is_deleted = 0 AND role IN ('user', 'assistant')
        ORDER BY created_at ASC, id ASC
        LIMIT ? OFFSET ?
        "#,
    )
    .bind(admin_id)
    .bind(session_id)
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await
    .map_err(|e| AppError::persistence(format!("failed to list chat messages: {e}")))?;

    Ok((rows, total))
}

/// Loads the last `n` user messages for a session, oldest first, for
/// building intent recognition's `history_user_messages` context.
pub async fn recent_user_messages(pool: &SqlitePool, admin_id: i64, session_id: &str, n: i64) -> Result<Vec<String>> {
    let mut rows: Vec<(String,)> = sqlx::query_as(
        r#"
        SELECT content FROM chat_history
        WHERE admin_id = ? AND session_id = ? AND is_deleted = 0 AND role = 'user'
        ORDER BY created_at DESC, id DESC
        LIMIT ?
        "#,
    )
    .bind(admin_id)
    .bind(session_id)
    .bind(n)
    .fetch_all(pool)
    .await
    .map_err(|e| AppError::persistence(format!("failed to load recent user messages: {e}")))?;

    rows.reverse();
    Ok(rows.into_iter().map(|(content,)| content).collect())
}

/// Soft-deletes a single session. Returns the number of rows affected, or an
/// error if the session does not exist (or already belongs to someone else).
pub async fn delete_session(pool: &SqlitePool, admin_id: i64, session_id: &str) -> Result<u64> {
    let exists: Option<(i64,)> = sqlx::query_as(
        "SELECT id FROM chat_history WHERE admin_id = ? AND session_id = ? AND is_deleted = 0 LIMIT 1",
    )
    .bind(admin_id)
    .bind(session_id)
    .fetch_optional(pool)
    .await
    .map_err(|e| AppError::persistence(format!("failed to check session existence: {e}")))?;

    if exists.is_none() {
        return Err(AppError::persistence(format!("session {session_id} not found")));
    }

    let result = sqlx::query(
        r#"
        UPDATE chat_history
        SET is_deleted = 1, updated_by = ?, updated_at = datetime('now')
        WHERE admin_id = ? AND session_id = ? AND is_deleted = 0
        "#,
    )
    .bind(admin_id)
    .bind(admin_id)
    .bind(session_id)
    .execute(pool)
    .await
    .map_err(|e| AppError::persistence(format!("failed to delete session: {e}")))?;

    Ok(result.rows_affected())
}

/// Soft-deletes every session belonging to an admin.
pub async fn clear_sessions(pool: &SqlitePool, admin_id: i64) -> Result<u64> {
    let result = sqlx::query(
        r#"
        UPDATE chat_history
        SET is_deleted = 1, updated_by = ?, updated_at = datetime('now')
        WHERE admin_id = ? AND is_deleted = 0
        "#,
    )
    .bind(admin_id)
    .bind(admin_id)
    .execute(pool)
    .await
    .map_err(|e| AppError::persistence(format!("failed to clear sessions: {e}")))?;

    Ok(result.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::migrations::run_migrations;
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
    async fn test_insert_and_list_messages() {
        let pool = test_pool().await;
        insert(&pool, 1, "sess-1", MessageRole::User, "how many students", None, None)
            .await
            .unwrap();
        insert(&pool, 1, "sess-1", MessageRole::Assistant, "there are 10", Some(42), Some("gpt-5"))
            .await
            .unwrap();

        let (messages, total) = list_messages(&pool, 1, "sess-1", 0, 20).await.unwrap();
        assert_eq!(total, 2);
        assert_eq!(messages[0].message_role, "user");
        assert_eq!(messages[1].message_role, "assistant");
    }

    #[tokio::test]
    async fn test_list_sessions_preview_truncation() {
        let pool = test_pool().await;
        insert(&pool, 1, "sess-1", MessageRole::User, "this is a long question", None, None)
            .await
            .unwrap();

        let (sessions, total) = list_sessions(&pool, 1, 0, 20).await.unwrap();
        assert_eq!(total, 1);
        assert_eq!(sessions[0].preview, "this is...");
    }

    #[tokio::test]
    async fn test_list_sessions_short_preview_no_ellipsis() {
        let pool = test_pool().await;
        insert(&pool, 1, "sess-1", MessageRole::User, "hi", None, None).await.unwrap();

        let (sessions, _) = list_sessions(&pool, 1, 0, 20).await.unwrap();
        assert_eq!(sessions[0].preview, "hi");
    }

    #[tokio::test]
    async fn test_delete_session_is_soft() {
        let pool = test_pool().await;
        insert(&pool, 1, "sess-1", MessageRole::User, "hello", None, None).await.unwrap();

        let deleted = delete_session(&pool, 1, "sess-1").await.unwrap();
        assert_eq!(deleted, 1);

        let (messages, total) = list_messages(&pool, 1, "sess-1", 0, 20).await.unwrap();
        assert_eq!(total, 0);
        assert!(messages.is_empty());
    }

    #[tokio::test]
    async fn test_delete_missing_session_is_error() {
        let pool = test_pool().await;
        let result = delete_session(&pool, 1, "does-not-exist").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_recent_user_messages_are_oldest_first() {
        let pool = test_pool().await;
        for i in 0..6 {
            insert(&pool, 1, "sess-1", MessageRole::User, &format!("q{i}"), None, None)
                .await
                .unwrap();
        }

        let recent = recent_user_messages(&pool, 1, "sess-1", 4).await.unwrap();
        assert_eq!(recent, vec!["q2", "q3", "q4", "q5"]);
    }
}
