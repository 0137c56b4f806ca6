//! The six graph nodes. Each module exposes a `run` function; the graph
//! runtime in [`crate::graph`] is the only caller.

pub mod hidden_context;
pub mod intent_recognition;
pub mod result_return;
pub mod sql_generation;
pub mod sql_validate;
pub mod task_parse;
