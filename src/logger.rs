use std::str::FromStr;

use anyhow::Result;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};

use crate::models::HistoryMessage;

/// Append-only chat transcript.
pub struct ChatLogger {
    pool: SqlitePool,
}

impl ChatLogger {
    pub async fn new(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        if let Some(parent) = options.clone().get_filename().parent() {
            std::fs::create_dir_all(parent)?;
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        Ok(Self { pool })
    }

    /// A private in-memory database. One connection, since every
    /// connection to `:memory:` would otherwise get its own database.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        Ok(Self { pool })
    }

    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS chat_messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn add_message(&self, role: &str, content: &str) -> Result<()> {
        sqlx::query("INSERT INTO chat_messages (role, content, created_at) VALUES (?, ?, ?)")
            .bind(role)
            .bind(content)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn history(&self) -> Result<Vec<HistoryMessage>> {
        let messages = sqlx::query_as::<_, HistoryMessage>(
            "SELECT role, content FROM chat_messages ORDER BY id ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(messages)
    }

    pub async fn clear(&self) -> Result<()> {
        sqlx::query("DELETE FROM chat_messages")
            .execute(&self.pool)
            .await?;
        tracing::info!("chat history cleared");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn logger() -> ChatLogger {
        let logger = ChatLogger::in_memory().await.unwrap();
        logger.init_schema().await.unwrap();
        logger
    }

    #[tokio::test]
    async fn history_keeps_insertion_order() {
        let logger = logger().await;
        logger.add_message("user", "What is this?").await.unwrap();
        logger.add_message("assistant", "A document.").await.unwrap();

        let history = logger.history().await.unwrap();
        assert_eq!(
            history,
            vec![
                HistoryMessage { role: "user".into(), content: "What is this?".into() },
                HistoryMessage { role: "assistant".into(), content: "A document.".into() },
            ]
        );
    }

    #[tokio::test]
    async fn clear_empties_the_transcript() {
        let logger = logger().await;
        logger.add_message("user", "hi").await.unwrap();
        logger.clear().await.unwrap();
        assert!(logger.history().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn file_databases_are_created_with_their_directory() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("nested/chat.db").display());
        let logger = ChatLogger::new(&url).await.unwrap();
        logger.init_schema().await.unwrap();
        assert!(dir.path().join("nested/chat.db").exists());
    }
}
