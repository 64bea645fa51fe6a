use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Row, Sqlite};
use std::path::Path;
use uuid::Uuid;

use crate::errors::AppResult;
use crate::uploader::PublishOutcome;

/// One row of `publish_history`.
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub run_id: String,
    pub file_name: String,
    pub content_fingerprint: Option<String>,
    pub account: String,
    pub succeeded: bool,
    pub remote_identifier: Option<String>,
    pub terminal_reason: Option<String>,
    pub attempt_count: i64,
    pub cancelled: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

pub struct PublishHistory {
    pool: Pool<Sqlite>,
}

impl PublishHistory {
    /// Open (creating if needed) the history database at `db_path`.
    pub async fn open(db_path: &Path) -> AppResult<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        log::info!("History database: {}", db_path.display());

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .connect_with(options)
            .await?;

        let history = Self { pool };
        history.init_schema().await?;
        Ok(history)
    }

    pub async fn in_memory() -> AppResult<Self> {
        // A single connection keeps every query on the same in-memory database
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        let history = Self { pool };
        history.init_schema().await?;
        Ok(history)
    }

    async fn init_schema(&self) -> AppResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS publish_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id TEXT NOT NULL UNIQUE,
                file_name TEXT NOT NULL,
                content_fingerprint TEXT,
                account TEXT NOT NULL,
                succeeded BOOLEAN NOT NULL,
                remote_identifier TEXT,
                terminal_reason TEXT,
                attempt_count INTEGER NOT NULL DEFAULT 0,
                cancelled BOOLEAN NOT NULL DEFAULT FALSE,
                started_at DATETIME NOT NULL,
                finished_at DATETIME NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        self.migrate().await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_publish_history_account ON publish_history(account)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_publish_history_finished ON publish_history(finished_at)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn migrate(&self) -> AppResult<()> {
        let column_check = sqlx::query(
            "SELECT name FROM pragma_table_info('publish_history') WHERE name = 'content_fingerprint'",
        )
        .fetch_optional(&self.pool)
        .await?;

        if column_check.is_none() {
            log::info!("Adding missing content_fingerprint column to publish_history table");
            sqlx::query("ALTER TABLE publish_history ADD COLUMN content_fingerprint TEXT")
                .execute(&self.pool)
                .await?;
        }

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_publish_history_fingerprint ON publish_history(content_fingerprint)",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Store one run's outcome and return its run id.
    pub async fn record(
        &self,
        file_name: &str,
        fingerprint: &str,
        account: &str,
        outcome: &PublishOutcome,
        started_at: DateTime<Utc>,
    ) -> AppResult<String> {
        let run_id = Uuid::new_v4().to_string();

        sqlx::query(
            r#"
            INSERT INTO publish_history
            (run_id, file_name, content_fingerprint, account, succeeded, remote_identifier,
             terminal_reason, attempt_count, cancelled, started_at, finished_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&run_id)
        .bind(file_name)
        .bind(fingerprint)
        .bind(account)
        .bind(outcome.succeeded)
        .bind(outcome.remote_identifier.as_deref())
        .bind(outcome.terminal_reason.map(|c| c.as_str()))
        .bind(outcome.attempt_count() as i64)
        .bind(outcome.cancelled)
        .bind(started_at)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        log::debug!("Recorded publish run {}", run_id);
        Ok(run_id)
    }

    /// Newest first.
    pub async fn recent(&self, limit: u32) -> AppResult<Vec<HistoryEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT run_id, file_name, content_fingerprint, account, succeeded, remote_identifier, terminal_reason,
                   attempt_count, cancelled, started_at, finished_at
            FROM publish_history
            ORDER BY finished_at DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            entries.push(HistoryEntry {
                run_id: row.try_get("run_id")?,
                file_name: row.try_get("file_name")?,
                content_fingerprint: row.try_get("content_fingerprint")?,
                account: row.try_get("account")?,
                succeeded: row.try_get("succeeded")?,
                remote_identifier: row.try_get("remote_identifier")?,
                terminal_reason: row.try_get("terminal_reason")?,
                attempt_count: row.try_get("attempt_count")?,
                cancelled: row.try_get("cancelled")?,
                started_at: row.try_get("started_at")?,
                finished_at: row.try_get("finished_at")?,
            });
        }
        Ok(entries)
    }

    /// Whether this exact file (same name and fingerprint) was already
    /// published for `account`. Rows without a fingerprint never match.
    pub async fn was_published(
        &self,
        file_name: &str,
        fingerprint: &str,
        account: &str,
    ) -> AppResult<bool> {
        let row = sqlx::query(
            r#"
            SELECT 1 FROM publish_history
            WHERE file_name = ? AND content_fingerprint = ? AND account = ? AND succeeded = TRUE
            LIMIT 1
            "#,
        )
        .bind(file_name)
        .bind(fingerprint)
        .bind(account)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }
}
