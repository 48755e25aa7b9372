//! Idempotent schema migrations.
//!
//! Each schema statement is tracked by name in a `_migrations` table so the
//! runner can be replayed safely on every startup.

use sqlx::{Executor, SqlitePool};
use thiserror::Error;

use super::schema;

/// Errors that can occur during migration operations.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// Database query failed.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Migration script failed to execute.
    #[error("migration failed: {0}")]
    MigrationFailed(String),
}

/// Applies pending schema statements in order.
pub struct MigrationRunner {
    pool: SqlitePool,
}

impl MigrationRunner {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Runs all pending migrations. Idempotent: applied statements are
    /// recorded and skipped on subsequent runs.
    pub async fn run_migrations(&self) -> Result<(), MigrationError> {
        self.ensure_migrations_table().await?;

        for (idx, statement) in schema::all_schema_statements().iter().enumerate() {
            let name = format!("schema_v1_part_{idx}");
            if !self.is_applied(&name).await? {
                self.apply(&name, statement).await?;
            }
        }

        Ok(())
    }

    async fn ensure_migrations_table(&self) -> Result<(), MigrationError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS _migrations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                applied_at INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn is_applied(&self, name: &str) -> Result<bool, MigrationError> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT id FROM _migrations WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.is_some())
    }

    async fn apply(&self, name: &str, sql: &str) -> Result<(), MigrationError> {
        let mut tx = self.pool.begin().await?;

        // Executed unprepared so multi-statement blocks (the index batch)
        // run in one go.
        (&mut *tx)
            .execute(sql)
            .await
            .map_err(|e| MigrationError::MigrationFailed(format!("{name}: {e}")))?;

        sqlx::query("INSERT INTO _migrations (name, applied_at) VALUES (?, ?)")
            .bind(name)
            .bind(crate::model::now_ts())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StateStore;

    #[tokio::test]
    async fn test_migrations_are_idempotent() {
        let store = StateStore::in_memory().await.unwrap();
        let runner = MigrationRunner::new(store.pool().clone());

        runner.run_migrations().await.unwrap();
        runner.run_migrations().await.unwrap();

        let applied: Vec<(String,)> = sqlx::query_as("SELECT name FROM _migrations ORDER BY id")
            .fetch_all(store.pool())
            .await
            .unwrap();

        assert_eq!(applied.len(), schema::all_schema_statements().len());
    }
}
