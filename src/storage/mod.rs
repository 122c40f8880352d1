//! Storage layer for test cases, suites, settings, executions and logs.

mod models;
pub(crate) mod sqlite;

pub use models::*;
pub use sqlite::SqliteStorage;
