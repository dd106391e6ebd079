use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use tracing::info;

use crate::config::DbConfig;
use crate::schema;

/// Open (creating if absent) the database file and apply the schema.
///
/// WAL journal mode keeps readers unblocked by the single writer; foreign
/// keys are enforced so cascade deletes work.
pub async fn create_pool(config: &DbConfig) -> Result<SqlitePool> {
    if let Some(parent) = config.database_path.parent() {
        std::fs::create_dir_all(parent).with_context(|| {
            format!("failed to create database directory {}", parent.display())
        })?;
    }

    let options = SqliteConnectOptions::new()
        .filename(&config.database_path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(10));

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(10))
        .connect_with(options)
        .await
        .with_context(|| {
            format!(
                "failed to open database at {}",
                config.database_path.display()
            )
        })?;

    schema::apply_schema(&pool).await?;
    info!(path = %config.database_path.display(), "database ready");
    Ok(pool)
}

/// Open an in-memory database with the schema applied.
///
/// Limited to a single connection: every `:memory:` connection is its own
/// database, so a larger pool would hand out empty databases.
pub async fn create_memory_pool() -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")
        .context("invalid in-memory connection string")?
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .context("failed to open in-memory database")?;

    schema::apply_schema(&pool).await?;
    Ok(pool)
}

/// Return the row count for every user table. Used by status reporting.
pub async fn table_counts(pool: &SqlitePool) -> Result<Vec<(String, i64)>> {
    let tables: Vec<(String,)> = sqlx::query_as(
        "SELECT name FROM sqlite_master \
         WHERE type = 'table' AND name NOT LIKE 'sqlite_%' \
         ORDER BY name",
    )
    .fetch_all(pool)
    .await
    .context("failed to list tables")?;

    let mut counts = Vec::with_capacity(tables.len());
    for (table_name,) in &tables {
        // Table names come from sqlite_master so they are safe identifiers.
        let query = format!("SELECT COUNT(*) FROM {table_name}");
        let count: (i64,) = sqlx::query_as(&query)
            .fetch_one(pool)
            .await
            .with_context(|| format!("failed to count rows in {table_name}"))?;
        counts.push((table_name.clone(), count.0));
    }
    Ok(counts)
}

/// Open a pool against a database file under the given directory.
///
/// Convenience for tests and ad-hoc tooling.
pub async fn create_pool_in(dir: &Path) -> Result<SqlitePool> {
    create_pool(&DbConfig::new(dir.join("tasks.db"))).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_pool_has_schema() {
        let pool = create_memory_pool().await.unwrap();
        let counts = table_counts(&pool).await.unwrap();
        assert!(counts.iter().any(|(name, _)| name == "tasks"));
        assert!(counts.iter().all(|(_, count)| *count == 0));
    }

    #[tokio::test]
    async fn file_pool_creates_parent_dirs() {
        let tmp = tempfile::tempdir().unwrap();
        let config = DbConfig::new(tmp.path().join("nested/dir/tasks.db"));
        let pool = create_pool(&config).await.unwrap();
        assert!(tmp.path().join("nested/dir/tasks.db").exists());
        pool.close().await;
    }
}
