use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::error;

use crate::db::{ChatStore, StoredChat};
use crate::errors::AppError;
use crate::models::ChatSummary;
use crate::tree::ConversationTree;

#[derive(Debug, sqlx::FromRow)]
struct ChatRow {
    id: String,
    name: Option<String>,
    title: String,
    tree_json: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, sqlx::FromRow)]
struct SummaryRow {
    id: String,
    title: String,
    updated_at: DateTime<Utc>,
}

/// Postgres-backed chat persistence. The tree is stored as a JSON document.
#[derive(Clone)]
pub struct PgChatStore {
    pool: PgPool,
}

impl PgChatStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ChatStore for PgChatStore {
    async fn save(&self, chat: &StoredChat) -> Result<(), AppError> {
        let tree_json = serde_json::to_string(&chat.tree)
            .map_err(|e| AppError::persistence(format!("Failed to serialize chat {}: {e}", chat.id)))?;

        sqlx::query(
            "INSERT INTO chats (id, name, title, tree_json, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (id) DO UPDATE
             SET name = EXCLUDED.name,
                 title = EXCLUDED.title,
                 tree_json = EXCLUDED.tree_json,
                 updated_at = EXCLUDED.updated_at",
        )
        .bind(&chat.id)
        .bind(&chat.name)
        .bind(&chat.title)
        .bind(&tree_json)
        .bind(chat.created_at)
        .bind(chat.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to save chat {}: {e}", chat.id);
            AppError::db_query("Failed to save chat", e)
        })?;
        Ok(())
    }

    async fn load(&self, id: &str) -> Result<Option<StoredChat>, AppError> {
        let row = sqlx::query_as::<_, ChatRow>(
            "SELECT id, name, title, tree_json, created_at, updated_at FROM chats WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to find chat {id}: {e}");
            AppError::db_query(format!("Failed to find chat {id}"), e)
        })?;

        let Some(row) = row else {
            return Ok(None);
        };
        let tree: ConversationTree = serde_json::from_str(&row.tree_json).map_err(|e| {
            error!("Stored tree for chat {id} is unreadable: {e}");
            AppError::persistence(format!("Stored tree for chat {id} is unreadable: {e}"))
        })?;

        Ok(Some(StoredChat {
            id: row.id,
            name: row.name,
            title: row.title,
            tree,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }))
    }

    async fn list(&self) -> Result<Vec<ChatSummary>, AppError> {
        let rows = sqlx::query_as::<_, SummaryRow>(
            "SELECT id, title, updated_at FROM chats ORDER BY updated_at DESC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to fetch chat list: {e}");
            AppError::db_query("Failed to fetch chats", e)
        })?;

        Ok(rows
            .into_iter()
            .map(|row| ChatSummary { id: row.id, name: row.title, last_modified: row.updated_at })
            .collect())
    }

    async fn delete(&self, id: &str) -> Result<bool, AppError> {
        let result = sqlx::query("DELETE FROM chats WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to delete chat {id}: {e}");
                AppError::db_query(format!("Failed to delete chat {id}"), e)
            })?;
        Ok(result.rows_affected() > 0)
    }
}
