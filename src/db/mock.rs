//! Mock database client for testing.
//!
//! Provides an in-memory database implementation for headless testing.

use super::{ColumnInfo, DatabaseClient, QueryResult, Value};
use crate::error::{AppError, Result};
use async_trait::async_trait;
use std::time::Duration;

/// A mock database client that returns predefined results.
///
/// Query results can be keyed to a substring of the SQL text via
/// [`Self::with_query_result`], which lets a single client stand in for the
/// several distinct `SELECT`/probe queries the graph issues in one request.
/// Unmatched `SELECT` queries fall back to a single placeholder row; other
/// statements return an empty result.
pub struct MockDatabaseClient {
    responses: Vec<(String, QueryResult)>,
}

impl MockDatabaseClient {
    /// Creates a new mock database client with no canned responses.
    pub fn new() -> Self {
        Self {
            responses: Vec::new(),
        }
    }

    /// Registers a canned result returned for any SQL containing `pattern`
    /// (case-insensitive). Patterns are checked in registration order.
    pub fn with_query_result(mut self, pattern: impl Into<String>, result: QueryResult) -> Self {
        self.responses.push((pattern.into(), result));
        self
    }
}

impl Default for MockDatabaseClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DatabaseClient for MockDatabaseClient {
    async fn execute_query(&self, sql: &str) -> Result<QueryResult> {
        let lower = sql.to_lowercase();

        for (pattern, result) in &self.responses {
            if lower.contains(&pattern.to_lowercase()) {
                return Ok(result.clone());
            }
        }

        if lower.trim_start().starts_with("select") || lower.trim_start().starts_with("with") {
            let columns = vec![ColumnInfo {
                name: "result".to_string(),
                data_type: "text".to_string(),
            }];

            let rows = vec![vec![Value::String(format!("Mock result for: {}", sql))]];

            Ok(QueryResult {
                columns,
                rows,
                execution_time: Duration::from_millis(1),
                row_count: 1,
                total_rows: Some(1),
                was_truncated: false,
            })
        } else {
            Ok(QueryResult {
                columns: vec![],
                rows: vec![],
                execution_time: Duration::from_millis(1),
                row_count: 0,
                total_rows: Some(0),
                was_truncated: false,
            })
        }
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// A database client whose `execute_query` always fails with a configured
/// error, for exercising the hidden-context retry path.
pub struct FailingDatabaseClient {
    message: String,
}

impl FailingDatabaseClient {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[async_trait]
impl DatabaseClient for FailingDatabaseClient {
    async fn execute_query(&self, _sql: &str) -> Result<QueryResult> {
        Err(AppError::query(self.message.clone()))
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_select() {
        let client = MockDatabaseClient::new();
        let result = client.execute_query("SELECT 1").await.unwrap();
        assert_eq!(result.row_count, 1);
        assert_eq!(result.columns.len(), 1);
    }

    #[tokio::test]
    async fn test_mock_insert() {
        let client = MockDatabaseClient::new();
        let result = client
            .execute_query("INSERT INTO test VALUES (1)")
            .await
            .unwrap();
        assert_eq!(result.row_count, 0);
    }

    #[tokio::test]
    async fn test_mock_with_query_result_pattern_match() {
        let canned = QueryResult::with_data(
            vec![ColumnInfo {
                name: "student_no".to_string(),
                data_type: "text".to_string(),
            }],
            vec![vec![Value::String("S001".to_string())]],
        );
        let client = MockDatabaseClient::new().with_query_result("distinct student_no", canned);

        let result = client
            .execute_query("SELECT DISTINCT student_no FROM report.student_score LIMIT 20")
            .await
            .unwrap();
        assert_eq!(result.row_count, 1);
        assert_eq!(result.columns[0].name, "student_no");
    }

    #[tokio::test]
    async fn test_failing_database_client_always_errors() {
        let client = FailingDatabaseClient::new("column \"foo\" does not exist");
        let result = client.execute_query("SELECT foo FROM bar").await;
        assert!(result.is_err());
        assert_eq!(result.unwrap_err().reason_code(), "execution_error");
    }
}
