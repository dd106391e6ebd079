//! SQLite persistence for delegate: models, schema, and repository modules.
//!
//! Repositories own the rows; in-memory values handed out are snapshots.
//! Cross-statement invariants (the dependency cycle check in particular)
//! are enforced inside explicit transactions here, never by callers.

pub mod config;
pub mod models;
pub mod pool;
pub mod queries;
pub mod schema;
