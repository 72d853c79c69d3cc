use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::db::{ChatStore, StoredChat};
use crate::errors::AppError;
use crate::models::ChatSummary;

/// In-process persistence, used when no database is configured and in tests.
/// Chats are stored serialized so loads exercise the same validation path as
/// the Postgres store.
#[derive(Default)]
pub struct MemoryChatStore {
    chats: Mutex<HashMap<String, (StoredChat, String)>>,
}

impl MemoryChatStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ChatStore for MemoryChatStore {
    async fn save(&self, chat: &StoredChat) -> Result<(), AppError> {
        let tree_json = serde_json::to_string(&chat.tree)
            .map_err(|e| AppError::persistence(format!("Failed to serialize chat {}: {e}", chat.id)))?;
        self.chats.lock().await.insert(chat.id.clone(), (chat.clone(), tree_json));
        Ok(())
    }

    async fn load(&self, id: &str) -> Result<Option<StoredChat>, AppError> {
        let chats = self.chats.lock().await;
        let Some((chat, tree_json)) = chats.get(id) else {
            return Ok(None);
        };
        let tree = serde_json::from_str(tree_json)
            .map_err(|e| AppError::persistence(format!("Stored tree for chat {id} is unreadable: {e}")))?;
        Ok(Some(StoredChat { tree, ..chat.clone() }))
    }

    async fn list(&self) -> Result<Vec<ChatSummary>, AppError> {
        let mut summaries: Vec<ChatSummary> =
            self.chats.lock().await.values().map(|(chat, _)| chat.summary()).collect();
        summaries.sort_by(|a, b| b.last_modified.cmp(&a.last_modified));
        Ok(summaries)
    }

    async fn delete(&self, id: &str) -> Result<bool, AppError> {
        Ok(self.chats.lock().await.remove(id).is_some())
    }
}
