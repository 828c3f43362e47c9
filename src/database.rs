use anyhow::{Context, Result};
use directories::ProjectDirs;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool};
use sqlx::{Pool, Sqlite};
use std::path::PathBuf;

const DB_FILE_NAME: &str = "studyhub.db";

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: std::env::var("STUDYHUB_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| default_db_path()),
        }
    }
}

fn default_db_path() -> PathBuf {
    ProjectDirs::from("", "", "studyhub")
        .map(|dirs| dirs.data_dir().join(DB_FILE_NAME))
        .unwrap_or_else(|| PathBuf::from(DB_FILE_NAME))
}

#[derive(Debug, Clone)]
pub struct Database {
    pool: Pool<Sqlite>,
    config: DatabaseConfig,
}

impl Database {
    pub async fn new(config: DatabaseConfig) -> Result<Self> {
        if let Some(parent) = config.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create database directory {}", parent.display())
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(&config.path)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options)
            .await
            .context("Failed to connect to SQLite database")?;

        let db = Self {
            pool,
            config: config.clone(),
        };

        db.run_migrations().await?;
        tracing::debug!(path = %config.path.display(), "database ready");
        Ok(db)
    }

    pub async fn open_default() -> Result<Self> {
        Self::new(DatabaseConfig::default()).await
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(r#"
            CREATE TABLE IF NOT EXISTS pdf_pages (
                key TEXT PRIMARY KEY NOT NULL,
                pages TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            )
        "#)
        .execute(&self.pool)
        .await
        .context("Failed to create pdf_pages table")?;

        sqlx::query(r#"
            CREATE TABLE IF NOT EXISTS pdf_file (
                key TEXT PRIMARY KEY NOT NULL,
                content BLOB NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            )
        "#)
        .execute(&self.pool)
        .await
        .context("Failed to create pdf_file table")?;

        sqlx::query(r#"
            CREATE TABLE IF NOT EXISTS flashcards (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                position INTEGER NOT NULL,
                front TEXT NOT NULL,
                back TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            )
        "#)
        .execute(&self.pool)
        .await
        .context("Failed to create flashcards table")?;

        sqlx::query(r#"CREATE INDEX IF NOT EXISTS idx_flashcards_position ON flashcards(position)"#)
            .execute(&self.pool)
            .await
            .context("Failed to create flashcards_position index")?;

        sqlx::query(r#"
            CREATE TABLE IF NOT EXISTS mindmaps (
                name TEXT PRIMARY KEY NOT NULL,
                content TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            )
        "#)
        .execute(&self.pool)
        .await
        .context("Failed to create mindmaps table")?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_database_creation() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("nested").join("test.db");
        let config = DatabaseConfig { path: db_path.clone() };

        let db = Database::new(config).await.unwrap();
        assert!(db_path.exists());
        for table in ["pdf_pages", "pdf_file", "flashcards", "mindmaps"] {
            let _: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
                .fetch_one(db.pool())
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        let config = DatabaseConfig {
            path: temp_dir.path().join("again.db"),
        };
        Database::new(config.clone()).await.unwrap();
        Database::new(config).await.unwrap();
    }
}
