//! Infrastructure layer
//!
//! Adapters for external dependencies shared by both cores: the SQLite
//! connection pool, structured logging and audit trails, and the layered
//! config loader.

pub mod config;
pub mod database;
pub mod logging;
