//! SQLite pool setup and the embedded schema migration.

use anyhow::{Context, Result};
use sqlx::{
    SqlitePool,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
};
use std::{path::Path, str::FromStr, sync::Arc};

const INIT_SQL: &str = include_str!("../migrations/0001_init.sql");

/// Open the pool, creating the database file and its directory if needed.
pub async fn connect(database_url: &str) -> Result<Arc<SqlitePool>> {
    let db_path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .trim_start_matches("file:");
    tracing::debug!("Interpreted SQLite path => {}", db_path);

    if let Some(parent) = Path::new(db_path).parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating database directory {}", parent.display()))?;
            tracing::info!("Created missing directory {:?}", parent);
        }
    }

    let options = SqliteConnectOptions::from_str(database_url)
        .with_context(|| format!("parsing database url `{database_url}`"))?
        .create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .context("connecting to SQLite")?;
    Ok(Arc::new(pool))
}

/// Apply the schema. Statements are idempotent, so this is safe to run on
/// every start.
pub async fn run_migrations(db: &SqlitePool) -> Result<()> {
    let statements = INIT_SQL
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>();

    tracing::info!("Running {} migration statements...", statements.len());

    for stmt in statements {
        tracing::debug!("Executing migration SQL: {}", stmt);
        sqlx::query(stmt).execute(db).await?;
    }

    Ok(())
}

/// Migrated pool backed by a file in `dir`.
#[cfg(test)]
pub async fn test_pool(dir: &Path) -> Arc<SqlitePool> {
    let url = format!("sqlite://{}", dir.join("test.db").display());
    let db = connect(&url).await.unwrap();
    run_migrations(&db).await.unwrap();
    db
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn migrations_are_rerunnable() {
        let dir = tempfile::tempdir().unwrap();
        let db = test_pool(dir.path()).await;
        run_migrations(&db).await.unwrap();

        let tables: Vec<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name",
        )
        .fetch_all(&*db)
        .await
        .unwrap();
        assert_eq!(tables, vec!["bandwidth_daily", "objects", "transfers"]);
    }

    #[tokio::test]
    async fn creates_missing_database_directory() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("meta/deeper/transfers.db");
        let db = connect(&format!("sqlite://{}", nested.display()))
            .await
            .unwrap();
        sqlx::query("SELECT 1").execute(&*db).await.unwrap();
        assert!(nested.exists());
    }
}
