use super::errors::DatabaseError;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use std::str::FromStr;
use std::time::Duration;

/// SQLite connection pool manager.
///
/// WAL mode, foreign keys on, and a bounded pool are set at construction
/// time; callers create their own tables (see `runtime::checkpoint_store`)
/// rather than relying on a separate migration step.
pub struct DatabaseConnection {
    pool: SqlitePool,
}

impl DatabaseConnection {
    /// * `database_url` - SQLite URL, e.g. `sqlite:.abathur/abathur.db` or `sqlite::memory:`
    pub async fn new(database_url: &str) -> Result<Self, DatabaseError> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(|e| DatabaseError::ConnectionPoolError(format!("invalid database URL: {e}")))?
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5))
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(10)
            .idle_timeout(Some(Duration::from_secs(30)))
            .max_lifetime(Some(Duration::from_secs(1800)))
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await
            .map_err(|e| {
                DatabaseError::ConnectionPoolError(format!("failed to create connection pool: {e}"))
            })?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connection_creation() {
        let db = DatabaseConnection::new("sqlite::memory:")
            .await
            .expect("failed to create connection");

        assert!(!db.pool().is_closed());
        db.close().await;
    }

    #[tokio::test]
    async fn test_foreign_keys_enabled() {
        let db = DatabaseConnection::new("sqlite::memory:")
            .await
            .expect("failed to create connection");

        let result: (i32,) = sqlx::query_as("PRAGMA foreign_keys")
            .fetch_one(db.pool())
            .await
            .expect("failed to check foreign_keys pragma");

        assert_eq!(result.0, 1, "foreign keys should be enabled");
        db.close().await;
    }

    #[tokio::test]
    async fn test_pool_closes() {
        let db = DatabaseConnection::new("sqlite::memory:")
            .await
            .expect("failed to create connection");

        let conn = db.pool().acquire().await.expect("failed to acquire connection");
        drop(conn);
        db.close().await;

        assert!(db.pool().is_closed());
    }
}
