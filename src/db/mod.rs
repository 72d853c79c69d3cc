pub mod chat_repository;
pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::errors::AppError;
use crate::models::ChatSummary;
use crate::tree::ConversationTree;

pub use chat_repository::PgChatStore;
pub use memory::MemoryChatStore;

/// A chat as handed to and returned from persistence.
#[derive(Debug, Clone)]
pub struct StoredChat {
    pub id: String,
    /// Explicit name set by the user, if any.
    pub name: Option<String>,
    /// Label shown in chat lists at the time of saving.
    pub title: String,
    pub tree: ConversationTree,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StoredChat {
    pub fn summary(&self) -> ChatSummary {
        ChatSummary {
            id: self.id.clone(),
            name: self.title.clone(),
            last_modified: self.updated_at,
        }
    }
}

/// Persistence collaborator, keyed by chat id.
#[async_trait]
pub trait ChatStore: Send + Sync {
    /// Inserts or replaces the chat.
    async fn save(&self, chat: &StoredChat) -> Result<(), AppError>;

    async fn load(&self, id: &str) -> Result<Option<StoredChat>, AppError>;

    /// Summaries ordered by last modification, newest first.
    async fn list(&self) -> Result<Vec<ChatSummary>, AppError>;

    /// Returns whether a chat was removed.
    async fn delete(&self, id: &str) -> Result<bool, AppError>;
}
