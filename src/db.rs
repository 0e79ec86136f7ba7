use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sqlx::{sqlite::{SqliteConnectOptions, SqlitePoolOptions}, SqlitePool};

const CREATE_USERS: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    id TEXT PRIMARY KEY,
    username TEXT NOT NULL,
    image_url TEXT
)"#;

const CREATE_MESSAGES: &str = r#"
CREATE TABLE IF NOT EXISTS messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    author_id TEXT NOT NULL REFERENCES users(id),
    content TEXT NOT NULL,
    created_at DATETIME DEFAULT CURRENT_TIMESTAMP
)"#;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    #[serde(default)]
    pub username: String,
    #[serde(rename = "imageUrl", default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub id: i64,
    pub author_id: String,
    pub content: String,
    pub created_at: String,
}

/// One row of `GET /api/messages`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub user: User,
    pub message: String,
    pub created_at: String,
}

/// Users and messages, backed by a sqlite pool.
///
/// Sqlite serializes conflicting writers itself, so no extra locking happens here.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        Ok(Self { pool })
    }

    /// Private in-memory database. Pinned to a single connection that never
    /// expires, since every sqlite memory connection is its own database.
    pub async fn in_memory() -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn create_schema(&self) -> Result<(), sqlx::Error> {
        sqlx::query(CREATE_USERS).execute(&self.pool).await?;
        sqlx::query(CREATE_MESSAGES).execute(&self.pool).await?;
        Ok(())
    }

    pub async fn user_exists(&self, id: &str) -> Result<bool, sqlx::Error> {
        Ok(
            sqlx::query("SELECT 1 FROM users WHERE id=? LIMIT 1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?
                .is_some()
        )
    }

    /// Inserts `user` unless its id is already known. Existing rows are never
    /// refreshed. Returns whether a row was created.
    pub async fn upsert_user(&self, user: &User) -> Result<bool, sqlx::Error> {
        if self.user_exists(&user.id).await? {
            return Ok(false);
        }

        // a concurrent first message from the same id may win the race
        let result = sqlx::query("INSERT INTO users (id,username,image_url) VALUES (?,?,?) ON CONFLICT(id) DO NOTHING")
            .bind(&user.id)
            .bind(&user.username)
            .bind(user.image_url.as_deref())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn insert_message(&self, author_id: &str, content: &str) -> Result<StoredMessage, sqlx::Error> {
        let (id, created_at): (i64, String) =
            sqlx::query_as("INSERT INTO messages (author_id,content) VALUES (?,?) RETURNING id,created_at")
                .bind(author_id)
                .bind(content)
                .fetch_one(&self.pool)
                .await?;

        Ok(StoredMessage {
            id,
            author_id: author_id.to_owned(),
            content: content.to_owned(),
            created_at,
        })
    }

    /// Every message in insertion order, joined with its author's current row.
    pub async fn list_messages(&self) -> Result<Vec<HistoryEntry>, sqlx::Error> {
        let rows: Vec<(String, String, Option<String>, String, String)> = sqlx::query_as(r#"
            SELECT m.author_id, COALESCE(u.username, ''), u.image_url, m.content, m.created_at
            FROM messages m
            LEFT JOIN users u ON u.id = m.author_id
            ORDER BY m.id"#)
            .fetch_all(&self.pool)
            .await?;

        Ok(
            rows.into_iter()
                .map(|(id, username, image_url, message, created_at)| HistoryEntry {
                    user: User { id, username, image_url },
                    message,
                    created_at,
                })
                .collect()
        )
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}
