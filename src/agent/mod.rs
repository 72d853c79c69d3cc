pub mod ollama;
pub mod transcriber;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::errors::AppError;
use crate::models::{MessageRole, ModelConfig};
use crate::tree::{ConversationTree, NodeId};

pub use ollama::OllamaGenerator;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptMessage {
    pub role: MessageRole,
    pub content: String,
}

/// Everything a generator needs for one streamed assistant turn.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub messages: Vec<PromptMessage>,
}

impl GenerationRequest {
    /// Builds the prompt from the first turn down to `target`. A non-empty
    /// trailing assistant turn is kept so the model continues it; an empty
    /// one is dropped.
    pub fn for_node(tree: &ConversationTree, target: NodeId) -> Self {
        let mut messages: Vec<PromptMessage> = tree
            .path_to(target)
            .into_iter()
            .filter_map(|id| tree.node(id))
            .map(|node| PromptMessage { role: node.role, content: node.content.clone() })
            .collect();
        if messages
            .last()
            .is_some_and(|m| m.role == MessageRole::Assistant && m.content.is_empty())
        {
            messages.pop();
        }
        Self { messages }
    }

    /// Whether the model is asked to extend a partial assistant turn.
    pub fn is_continuation(&self) -> bool {
        self.messages.last().is_some_and(|m| m.role == MessageRole::Assistant)
    }
}

/// Text-generation collaborator. Implementations push content increments
/// into `tx` and return once the stream is terminal. A closed receiver means
/// the caller stopped listening; implementations should return `Ok(())`.
#[async_trait]
pub trait Generator: Send + Sync {
    async fn stream(
        &self,
        request: GenerationRequest,
        tx: mpsc::Sender<String>,
    ) -> Result<(), AppError>;

    async fn config(&self) -> ModelConfig;

    /// Validates and applies a new configuration, returning the effective one.
    async fn update_config(&self, config: ModelConfig) -> Result<ModelConfig, AppError>;
}
