//! CSV export for query results too large to inline in a chat reply.

use std::path::{Path, PathBuf};

use rand::distr::Alphanumeric;
use rand::Rng;
use serde_json::{Map, Value};

use crate::error::{AppError, Result};

const BOM: &str = "\u{feff}";

/// Writes `rows` to a CSV file under `export_dir`, named
/// `admin_<admin_id>_session_<session_id>_<timestamp>_<rand>.csv`.
///
/// The header is the union of every row's keys, in first-seen insertion
/// order. The file is UTF-8 with a leading BOM, matching what spreadsheet
/// tools expect for CJK content. Returns the filename (not the full path).
pub fn write_csv(
    export_dir: &Path,
    admin_id: i64,
    session_id: &str,
    timestamp: i64,
    rows: &[Map<String, Value>],
) -> Result<String> {
    std::fs::create_dir_all(export_dir)
        .map_err(|e| AppError::export(format!("failed to create export directory: {e}")))?;

    let suffix: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect();
    let filename = format!("admin_{admin_id}_session_{session_id}_{timestamp}_{suffix}.csv");
    let path = export_path(export_dir, &filename);

    let header = union_of_keys(rows);

    let mut buffer = String::from(BOM);
    buffer.push_str(&header.iter().map(|k| csv_escape(k)).collect::<Vec<_>>().join(","));
    buffer.push_str("\r\n");

    for row in rows {
        let line = header
            .iter()
            .map(|key| {
                row.get(key)
                    .map(value_to_cell)
                    .unwrap_or_default()
            })
            .map(|cell| csv_escape(&cell))
            .collect::<Vec<_>>()
            .join(",");
        buffer.push_str(&line);
        buffer.push_str("\r\n");
    }

    std::fs::write(&path, buffer).map_err(|e| AppError::export(format!("failed to write CSV file: {e}")))?;

    Ok(filename)
}

fn export_path(export_dir: &Path, filename: &str) -> PathBuf {
    export_dir.join(filename)
}

fn union_of_keys(rows: &[Map<String, Value>]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut keys = Vec::new();
    for row in rows {
        for key in row.keys() {
            if seen.insert(key.clone()) {
                keys.push(key.clone());
            }
        }
    }
    keys
}

fn value_to_cell(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        other => other.to_string(),
    }
}

fn csv_escape(field: &str) -> String {
    if field.contains(',') || field.contains('"') || field.contains('\n') || field.contains('\r') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_write_csv_has_bom_and_header_union() {
        let dir = tempfile::tempdir().unwrap();
        let rows = vec![
            json!({"student_no": "S001", "real_name": "张三"}).as_object().unwrap().clone(),
            json!({"student_no": "S002", "real_name": "李四", "score": 92}).as_object().unwrap().clone(),
        ];
        let filename = write_csv(dir.path(), 1, "sess-1", 1700000000, &rows).unwrap();
        assert!(filename.starts_with("admin_1_session_sess-1_1700000000_"));

        let content = std::fs::read(dir.path().join(&filename)).unwrap();
        let text = String::from_utf8(content).unwrap();
        assert!(text.starts_with(BOM));
        let first_line = text.lines().nth(0).unwrap();
        assert!(first_line.contains("student_no"));
        assert!(first_line.contains("real_name"));
        assert!(first_line.contains("score"));
    }

    #[test]
    fn test_csv_escape_quotes_commas() {
        assert_eq!(csv_escape("a,b"), "\"a,b\"");
        assert_eq!(csv_escape("a\"b"), "\"a\"\"b\"");
        assert_eq!(csv_escape("plain"), "plain");
    }
}
