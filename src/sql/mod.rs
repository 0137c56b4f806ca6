//! SQL-shape helpers shared by the generation and validation nodes.

pub mod safety;

pub use safety::{
    extract_cte_names, extract_sql_fields, is_readonly_sql, normalize_whitespace,
};
