//! Database infrastructure
//!
//! SQLite connection pooling via sqlx, with WAL mode and a bounded pool.
//! Schema ownership lives with each consumer (e.g. `runtime::checkpoint_store`)
//! rather than a shared migrations directory.

pub mod connection;
pub mod errors;
pub mod utils;

pub use connection::DatabaseConnection;
pub use errors::DatabaseError;
