//! SQLite database operations
//!
//! All database access goes through this module. Single-statement reads
//! are exposed as methods on [`Database`]; writes that must happen
//! together are composed inside a transaction from [`Database::begin`]
//! using the connection-scoped functions in `store`.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite, SqlitePool, Transaction};

use super::models::*;
use super::store;
use crate::error::AppError;

/// Database connection pool wrapper
#[derive(Debug, Clone)]
pub struct Database {
    pool: Pool<Sqlite>,
}

impl Database {
    /// Connect to the SQLite database
    ///
    /// Creates the database file if it doesn't exist.
    /// Runs pending migrations automatically.
    ///
    /// # Arguments
    /// * `path` - Path to SQLite database file
    /// * `max_connections` - Pool size
    ///
    /// # Errors
    /// Returns error if connection or migration fails
    pub async fn connect(path: &Path, max_connections: u32) -> Result<Self, AppError> {
        // Create parent directory if it doesn't exist
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| AppError::Database(sqlx::Error::Io(e)))?;
            }
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await.map_err(|e| {
            tracing::error!("Migration failed: {}", e);
            AppError::Migration(e)
        })?;

        tracing::info!(path = %path.display(), "Database connected and migrated successfully");

        Ok(Self { pool })
    }

    /// Get the underlying pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Open a transaction
    ///
    /// Dropping the transaction without committing rolls it back.
    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>, AppError> {
        Ok(self.pool.begin().await?)
    }

    /// Close every pooled connection
    pub async fn close(&self) {
        self.pool.close().await;
    }

    // =========================================================================
    // Activities
    // =========================================================================

    pub async fn get_activity_by_id(
        &self,
        user_id: &str,
        activity_id: &str,
    ) -> Result<ActivityRecord, AppError> {
        let mut conn = self.pool.acquire().await?;
        store::get_activity_by_id(&mut conn, user_id, activity_id).await
    }

    pub async fn list_public_outbox(&self, user_id: &str) -> Result<Vec<ActivityRecord>, AppError> {
        let mut conn = self.pool.acquire().await?;
        store::list_public_outbox(&mut conn, user_id).await
    }

    // =========================================================================
    // Followers
    // =========================================================================

    pub async fn create_follower(
        &self,
        user_id: &str,
        actor_id: &str,
        activity_id: &str,
    ) -> Result<FollowerRecord, AppError> {
        let mut conn = self.pool.acquire().await?;
        store::create_follower(&mut conn, user_id, actor_id, activity_id).await
    }

    pub async fn delete_follower(&self, user_id: &str, actor_id: &str) -> Result<bool, AppError> {
        let mut conn = self.pool.acquire().await?;
        store::delete_follower(&mut conn, user_id, actor_id).await
    }

    pub async fn list_followers(&self, user_id: &str) -> Result<Vec<FollowerRecord>, AppError> {
        let mut conn = self.pool.acquire().await?;
        store::list_followers(&mut conn, user_id).await
    }

    // =========================================================================
    // Notes
    // =========================================================================

    pub async fn get_note_by_id(&self, user_id: &str, note_id: &str) -> Result<NoteRecord, AppError> {
        let mut conn = self.pool.acquire().await?;
        store::get_note_by_id(&mut conn, user_id, note_id).await
    }

    /// Count rows of a table
    #[cfg(test)]
    pub(crate) async fn count(&self, table: CountedTable) -> Result<i64, AppError> {
        let sql = format!("SELECT COUNT(*) FROM {}", table.as_str());
        let (count,): (i64,) = sqlx::query_as(&sql).fetch_one(&self.pool).await?;
        Ok(count)
    }

    /// Cheap liveness query
    pub async fn ping(&self) -> Result<(), AppError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

/// Tables that may be counted
#[cfg(test)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CountedTable {
    Activities,
    Followers,
    Notes,
    Jobs,
}

#[cfg(test)]
impl CountedTable {
    fn as_str(&self) -> &'static str {
        match self {
            CountedTable::Activities => "activities",
            CountedTable::Followers => "followers",
            CountedTable::Notes => "notes",
            CountedTable::Jobs => "jobs",
        }
    }
}
