use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};
use tracing::debug;

use shared::domain::{ConversationId, MessageId, PendingMessage, PendingStatus};

/// Durable queue of messages the server has not acknowledged yet.
///
/// `list_pending_messages` returns rows in enqueue order: `created_at`
/// ascending, insertion order for equal timestamps.
#[async_trait]
pub trait PendingMessageStore: Send + Sync {
    async fn insert_pending_message(&self, message: &PendingMessage) -> Result<()>;
    async fn list_pending_messages(&self) -> Result<Vec<PendingMessage>>;
    async fn load_pending_message(&self, id: &str) -> Result<Option<PendingMessage>>;
    /// Returns `false` when no row had that id.
    async fn delete_pending_message(&self, id: &str) -> Result<bool>;
    async fn mark_pending_message_failed(&self, id: &str) -> Result<bool>;
    async fn count_pending_messages(&self) -> Result<u64>;
}

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let in_memory = is_memory_url(database_url);
        let mut connect_options =
            SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        if !in_memory {
            connect_options = connect_options.journal_mode(SqliteJournalMode::Wal);
        }

        // Every connection to `sqlite::memory:` opens its own database, so keep exactly one alive.
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };
        let pool = pool_options
            .connect_with(connect_options)
            .await
            .with_context(|| format!("failed to open sqlite database '{database_url}'"))?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("failed to run storage migrations")?;
        debug!(database_url, in_memory, "storage: opened");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    pub async fn journal_mode(&self) -> Result<String> {
        let mode: String = sqlx::query_scalar("PRAGMA journal_mode")
            .fetch_one(&self.pool)
            .await
            .context("failed to read sqlite journal mode")?;
        Ok(mode.to_ascii_lowercase())
    }
}

#[async_trait]
impl PendingMessageStore for Storage {
    async fn insert_pending_message(&self, message: &PendingMessage) -> Result<()> {
        sqlx::query(
            "INSERT INTO pending_messages (id, conversation_id, message_text, created_at, status, parent_message_id)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&message.id)
        .bind(message.conversation_id.0)
        .bind(&message.message_text)
        .bind(encode_timestamp(message.created_at))
        .bind(message.status.as_str())
        .bind(message.parent_message_id.map(|id| id.0))
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to insert pending message {}", message.id))?;
        Ok(())
    }

    async fn list_pending_messages(&self) -> Result<Vec<PendingMessage>> {
        let rows = sqlx::query(
            "SELECT id, conversation_id, message_text, created_at, status, parent_message_id
             FROM pending_messages
             ORDER BY created_at ASC, rowid ASC",
        )
        .fetch_all(&self.pool)
        .await
        .context("failed to list pending messages")?;

        rows.iter().map(pending_message_from_row).collect()
    }

    async fn load_pending_message(&self, id: &str) -> Result<Option<PendingMessage>> {
        let row = sqlx::query(
            "SELECT id, conversation_id, message_text, created_at, status, parent_message_id
             FROM pending_messages
             WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("failed to load pending message {id}"))?;

        row.as_ref().map(pending_message_from_row).transpose()
    }

    async fn delete_pending_message(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM pending_messages WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to delete pending message {id}"))?;
        Ok(result.rows_affected() > 0)
    }

    async fn mark_pending_message_failed(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("UPDATE pending_messages SET status = ? WHERE id = ?")
            .bind(PendingStatus::Failed.as_str())
            .bind(id)
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to mark pending message {id} as failed"))?;
        Ok(result.rows_affected() > 0)
    }

    async fn count_pending_messages(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM pending_messages")
            .fetch_one(&self.pool)
            .await
            .context("failed to count pending messages")?;
        Ok(u64::try_from(count).unwrap_or_default())
    }
}

// Fixed-width RFC 3339 keeps lexical order equal to chronological order.
fn encode_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn decode_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|at| at.with_timezone(&Utc))
        .with_context(|| format!("invalid created_at timestamp '{raw}'"))
}

fn pending_message_from_row(row: &SqliteRow) -> Result<PendingMessage> {
    let id: String = row.try_get(0)?;
    let raw_status: String = row.try_get(4)?;
    let status = PendingStatus::parse(&raw_status)
        .ok_or_else(|| anyhow!("pending message {id} has unknown status '{raw_status}'"))?;
    let created_at: String = row.try_get(3)?;
    Ok(PendingMessage {
        conversation_id: ConversationId(row.try_get::<i64, _>(1)?),
        message_text: row.try_get(2)?,
        created_at: decode_timestamp(&created_at)?,
        status,
        parent_message_id: row.try_get::<Option<i64>, _>(5)?.map(MessageId),
        id,
    })
}

fn is_memory_url(database_url: &str) -> bool {
    database_url.starts_with("sqlite::memory:") || database_url.contains("mode=memory")
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if is_memory_url(database_url) || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
