//! Schema knowledge base: the curated whitelist of queryable tables/fields.
//!
//! Loaded once from a static JSON artifact (see [`Config::paths`]'s
//! `schema_kb_path`) and shared read-only across every graph node via an
//! `Arc`. Precomputes the field whitelist, a case-insensitive alias lookup,
//! and the schema-hint text fed to prompt builders, matching the "load once,
//! reuse by reference" guidance for process-wide state.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

/// One column of a KB table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KbColumn {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub aliases: Vec<String>,
}

/// One table of a KB table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KbTable {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub columns: Vec<KbColumn>,
}

/// The raw schema KB artifact, as loaded from disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaKb {
    pub tables: Vec<KbTable>,
}

/// A pair of `{field: [aliases]}`, matching the shape the prompt builders
/// expect for `alias_hints`/`alias_pairs`.
#[derive(Debug, Clone, Serialize)]
pub struct AliasPair {
    pub field: String,
    pub aliases: Vec<String>,
}

/// One table's worth of prompt-facing schema hints.
#[derive(Debug, Clone, Serialize)]
pub struct SchemaHintTable {
    pub table: String,
    pub table_description: String,
    pub columns: Vec<SchemaHintColumn>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SchemaHintColumn {
    pub field: String,
    pub field_description: String,
    pub aliases: Vec<String>,
}

/// The schema KB plus its derived lookup structures.
///
/// Constructed once at startup and shared across requests via `Arc`.
pub struct SchemaKnowledge {
    kb: SchemaKb,
    whitelist: HashSet<String>,
    /// lowercased alias -> canonical `table.field` (first writer wins)
    alias_lookup: HashMap<String, String>,
    /// lowercased `table.field` -> its declared aliases (lowercased)
    field_aliases: HashMap<String, Vec<String>>,
    alias_pairs: Vec<AliasPair>,
    schema_hints: Vec<SchemaHintTable>,
}

impl SchemaKnowledge {
    /// Loads the schema KB from a JSON file on disk and precomputes the
    /// whitelist/alias lookup/hints.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| AppError::config(format!("failed to read schema KB at {}: {e}", path.display())))?;
        let kb: SchemaKb = serde_json::from_str(&text)
            .map_err(|e| AppError::config(format!("failed to parse schema KB at {}: {e}", path.display())))?;
        Ok(Self::from_kb(kb))
    }

    /// Builds the derived structures from an already-parsed KB. Exposed for
    /// tests that want to construct a KB in-memory.
    pub fn from_kb(kb: SchemaKb) -> Self {
        let mut whitelist = HashSet::new();
        let mut alias_lookup = HashMap::new();
        let mut field_aliases = HashMap::new();
        let mut alias_pairs = Vec::new();
        let mut schema_hints = Vec::new();

        for table in &kb.tables {
            let table_name = table.name.trim();
            if table_name.is_empty() {
                continue;
            }

            let mut hint_columns = Vec::with_capacity(table.columns.len());

            for column in &table.columns {
                let column_name = column.name.trim();
                if column_name.is_empty() {
                    continue;
                }
                let field = format!("{table_name}.{column_name}");
                whitelist.insert(field.clone());

                let mut aliases: Vec<String> = column
                    .aliases
                    .iter()
                    .map(|a| a.trim().to_string())
                    .filter(|a| !a.is_empty())
                    .collect();
                aliases.push(column_name.to_string());
                aliases.push(field.clone());

                let mut deduped = Vec::new();
                let mut seen = HashSet::new();
                for alias in aliases {
                    let key = alias.to_lowercase();
                    if seen.insert(key.clone()) {
                        alias_lookup.entry(key).or_insert_with(|| field.clone());
                        deduped.push(alias);
                    }
                }
                field_aliases.insert(
                    field.to_lowercase(),
                    deduped.iter().map(|a| a.to_lowercase()).collect(),
                );

                alias_pairs.push(AliasPair {
                    field: field.clone(),
                    aliases: deduped.clone(),
                });

                hint_columns.push(SchemaHintColumn {
                    field,
                    field_description: column.description.trim().to_string(),
                    aliases: deduped,
                });
            }

            schema_hints.push(SchemaHintTable {
                table: table_name.to_string(),
                table_description: table.description.trim().to_string(),
                columns: hint_columns,
            });
        }

        Self {
            kb,
            whitelist,
            alias_lookup,
            field_aliases,
            alias_pairs,
            schema_hints,
        }
    }

    /// The raw KB, for callers that need table-level metadata directly.
    pub fn raw(&self) -> &SchemaKb {
        &self.kb
    }

    /// All whitelisted `table.field` strings, preserving no particular order.
    pub fn whitelist(&self) -> &HashSet<String> {
        &self.whitelist
    }

    /// Whether `field` (exact `table.field`, case-sensitive) is whitelisted.
    pub fn is_whitelisted(&self, field: &str) -> bool {
        self.whitelist.contains(field)
    }

    /// Field whitelist as a sorted `Vec` for deterministic prompt payloads.
    pub fn whitelist_sorted(&self) -> Vec<String> {
        let mut fields: Vec<String> = self.whitelist.iter().cloned().collect();
        fields.sort();
        fields
    }

    /// Resolves a case-insensitive alias (column name, full `table.field`, or
    /// declared alias) to its canonical `table.field`.
    pub fn resolve_alias(&self, alias: &str) -> Option<&str> {
        self.alias_lookup.get(&alias.to_lowercase()).map(|s| s.as_str())
    }

    /// The declared (lowercased) aliases for a whitelisted field, if any.
    pub fn aliases_for_field(&self, field: &str) -> &[String] {
        self.field_aliases
            .get(&field.to_lowercase())
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    /// `{field: [aliases]}` pairs for every whitelisted field, in KB order.
    pub fn alias_pairs(&self) -> &[AliasPair] {
        &self.alias_pairs
    }

    /// Table/column description hints for prompt builders, in KB order.
    pub fn schema_hints(&self) -> &[SchemaHintTable] {
        &self.schema_hints
    }

    /// Candidate whitelisted fields whose column-name suffix or aliases
    /// match `suffix` (case-insensitively), capped at `limit`.
    pub fn candidates_for_suffix(&self, suffix: &str, limit: usize) -> Vec<String> {
        let suffix_lower = suffix.to_lowercase();
        let mut candidates = Vec::new();
        for field in self.whitelist_sorted() {
            if candidates.len() >= limit {
                break;
            }
            let field_lower = field.to_lowercase();
            let suffix_match = field_lower
                .rsplit_once('.')
                .map(|(_, col)| col == suffix_lower)
                .unwrap_or(false);
            let alias_match = self
                .aliases_for_field(&field)
                .iter()
                .any(|a| a == &suffix_lower);
            if suffix_match || alias_match {
                candidates.push(field);
            }
        }
        candidates
    }

    /// The table name a whitelisted field belongs to, lowercased.
    pub fn table_of(field: &str) -> &str {
        field.split('.').next().unwrap_or(field)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_kb() -> SchemaKb {
        SchemaKb {
            tables: vec![
                KbTable {
                    name: "student".to_string(),
                    description: "学生信息".to_string(),
                    aliases: vec!["学生".to_string()],
                    columns: vec![
                        KbColumn {
                            name: "enroll_year".to_string(),
                            description: "入学年份".to_string(),
                            aliases: vec!["年级".to_string(), "入学年份".to_string()],
                        },
                        KbColumn {
                            name: "gender".to_string(),
                            description: "性别".to_string(),
                            aliases: vec!["性别".to_string()],
                        },
                    ],
                },
                KbTable {
                    name: "class".to_string(),
                    description: "班级信息".to_string(),
                    aliases: vec![],
                    columns: vec![KbColumn {
                        name: "class_name".to_string(),
                        description: "班级名称".to_string(),
                        aliases: vec![],
                    }],
                },
            ],
        }
    }

    #[test]
    fn test_whitelist_contains_table_dot_field() {
        let kb = SchemaKnowledge::from_kb(sample_kb());
        assert!(kb.is_whitelisted("student.enroll_year"));
        assert!(kb.is_whitelisted("class.class_name"));
        assert!(!kb.is_whitelisted("student.grade_year"));
    }

    #[test]
    fn test_alias_resolution_is_case_insensitive() {
        let kb = SchemaKnowledge::from_kb(sample_kb());
        assert_eq!(kb.resolve_alias("年级"), Some("student.enroll_year"));
        assert_eq!(kb.resolve_alias("GENDER"), Some("student.gender"));
        assert_eq!(kb.resolve_alias("nonexistent"), None);
    }

    #[test]
    fn test_candidates_for_suffix_matches_column_name() {
        let kb = SchemaKnowledge::from_kb(sample_kb());
        let candidates = kb.candidates_for_suffix("enroll_year", 12);
        assert_eq!(candidates, vec!["student.enroll_year".to_string()]);
    }

    #[test]
    fn test_candidates_for_suffix_matches_alias() {
        let kb = SchemaKnowledge::from_kb(sample_kb());
        let candidates = kb.candidates_for_suffix("年级", 12);
        assert_eq!(candidates, vec!["student.enroll_year".to_string()]);
    }

    #[test]
    fn test_load_missing_file_is_config_error() {
        let result = SchemaKnowledge::load("/nonexistent/path/schema_kb_core.json");
        assert!(result.is_err());
    }
}
