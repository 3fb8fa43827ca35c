//! Subsync shared infrastructure
//!
//! Database pool construction and the embedded schema migrations used by
//! both the API server and the reconciliation worker.

pub mod db;

pub use db::{create_migration_pool, create_pool, run_migrations, DbError};
