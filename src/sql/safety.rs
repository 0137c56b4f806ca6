//! Read-only gate and lightweight lexical analysis over generated SQL.
//!
//! None of this is a real SQL parser; it mirrors the source's regex-based
//! approach, which is sufficient because the grammar we accept is narrow
//! (CTE-form `SELECT`/`WITH` only) and the whitelist check catches anything
//! a regex mismatch would let slip through.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;

/// Keywords that make a statement a write, checked as whole words.
const FORBIDDEN_TOKENS: &[&str] = &[
    "insert", "update", "delete", "replace", "alter", "drop", "truncate", "create", "grant", "revoke",
];

static FIELD_TOKEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b([a-zA-Z_][a-zA-Z0-9_]*)\.([a-zA-Z_][a-zA-Z0-9_]*)\b").unwrap());

static CTE_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)(?:\bwith\b|,)\s*([a-zA-Z_][a-zA-Z0-9_]*)\s+as\s*\(").unwrap());

static DOT_SPACING_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s*\.\s*").unwrap());

/// Returns true iff `sql` is a read-only statement: starts with `select` or
/// `with` (case-insensitive) and contains no write keyword as a whole word.
pub fn is_readonly_sql(sql: &str) -> bool {
    let lowered = sql.trim().to_lowercase();
    if lowered.is_empty() {
        return false;
    }
    if !(lowered.starts_with("select") || lowered.starts_with("with")) {
        return false;
    }
    for token in FORBIDDEN_TOKENS {
        let pattern = format!(r"\b{token}\b");
        if Regex::new(&pattern).unwrap().is_match(&lowered) {
            return false;
        }
    }
    true
}

/// Extracts every `table.field` token, deduplicated case-insensitively,
/// preserving first-seen order and original casing.
pub fn extract_sql_fields(sql: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut fields = Vec::new();
    for caps in FIELD_TOKEN_RE.captures_iter(sql) {
        let table = &caps[1];
        let column = &caps[2];
        let field = format!("{table}.{column}");
        let key = field.to_lowercase();
        if seen.insert(key) {
            fields.push(field);
        }
    }
    fields
}

/// Extracts the lowercased names of every CTE declared as `WITH x AS (` or
/// `, x AS (`.
pub fn extract_cte_names(sql: &str) -> HashSet<String> {
    CTE_NAME_RE
        .captures_iter(sql)
        .map(|caps| caps[1].to_lowercase())
        .collect()
}

/// Collapses `a . b` to `a.b` outside of single-quoted string literals, and
/// strips leading/trailing whitespace inside single-quoted literals.
///
/// This is deliberately conservative: it only touches whitespace directly
/// around a `.` and whitespace at the edges of a quoted literal, never
/// whitespace that is semantically part of the SQL (keywords, identifiers).
pub fn normalize_whitespace(sql: &str) -> String {
    // Split into alternating outside-string / inside-string segments on the
    // `'` boundary, collapsing dot spacing outside and trimming the edges of
    // each literal's contents inside.
    let mut result = String::with_capacity(sql.len());
    let mut rest = sql;
    let mut inside_string = false;
    loop {
        match rest.find('\'') {
            Some(idx) => {
                let (segment, remainder) = rest.split_at(idx + 1);
                if inside_string {
                    // `segment` is the literal's content plus the closing quote.
                    let content = &segment[..segment.len() - 1];
                    result.push_str(content.trim());
                    result.push('\'');
                } else {
                    result.push_str(&DOT_SPACING_RE.replace_all(segment, "."));
                }
                inside_string = !inside_string;
                rest = remainder;
            }
            None => {
                if inside_string {
                    result.push_str(rest.trim());
                } else {
                    result.push_str(&DOT_SPACING_RE.replace_all(rest, "."));
                }
                break;
            }
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_readonly_sql_accepts_select_and_with() {
        assert!(is_readonly_sql("SELECT 1"));
        assert!(is_readonly_sql("  with x as (select 1) select * from x"));
    }

    #[test]
    fn test_is_readonly_sql_rejects_empty() {
        assert!(!is_readonly_sql("   "));
    }

    #[test]
    fn test_is_readonly_sql_rejects_write_keywords() {
        assert!(!is_readonly_sql("WITH x AS (DELETE FROM student) SELECT 1"));
        assert!(!is_readonly_sql("UPDATE student SET real_name = 'x'"));
    }

    #[test]
    fn test_is_readonly_sql_does_not_false_positive_on_substrings() {
        // "update_time" contains "update" but not as a whole word.
        assert!(is_readonly_sql("SELECT update_time FROM student"));
    }

    #[test]
    fn test_extract_sql_fields_dedupes_case_insensitively() {
        let sql = "SELECT student.real_name, Student.REAL_NAME, class.class_name FROM student";
        let fields = extract_sql_fields(sql);
        assert_eq!(fields, vec!["student.real_name", "class.class_name"]);
    }

    #[test]
    fn test_extract_cte_names() {
        let sql = "WITH target_student AS (SELECT 1), target_course AS (SELECT 2) SELECT * FROM target_student";
        let names = extract_cte_names(sql);
        assert!(names.contains("target_student"));
        assert!(names.contains("target_course"));
    }

    #[test]
    fn test_normalize_whitespace_collapses_dot_spacing() {
        let sql = "SELECT student . real_name FROM student";
        assert_eq!(normalize_whitespace(sql), "SELECT student.real_name FROM student");
    }

    #[test]
    fn test_normalize_whitespace_preserves_literal_spacing() {
        let sql = "SELECT * FROM student WHERE real_name = 'a . b'";
        assert_eq!(
            normalize_whitespace(sql),
            "SELECT * FROM student WHERE real_name = 'a . b'"
        );
    }

    #[test]
    fn test_normalize_whitespace_trims_literal_edges() {
        let sql = "SELECT * FROM student WHERE gender = ' 男 '";
        assert_eq!(
            normalize_whitespace(sql),
            "SELECT * FROM student WHERE gender = '男'"
        );
    }
}
