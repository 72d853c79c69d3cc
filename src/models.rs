use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::AppError;

pub const MAX_MESSAGE_LENGTH: usize = 8000;
pub const MAX_CHAT_NAME_LENGTH: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::System => "system",
        }
    }
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which way `change_active_child` moves among siblings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Prev,
    Next,
}

/// One entry of the active-path projection pushed to clients.
/// `sibling_info` is `(1-based position, sibling count)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageView {
    pub role: MessageRole,
    pub content: String,
    pub sibling_info: (usize, usize),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatSummary {
    pub id: String,
    pub name: String,
    pub last_modified: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub model_name: String,
    pub generation_length: u32,
    pub temperature: f64,
    pub top_p: f64,
}

impl ModelConfig {
    pub fn validate(&self) -> Result<(), AppError> {
        if self.model_name.trim().is_empty() {
            return Err(AppError::EmptyField { field_name: "model_name".to_string() });
        }
        if !(1..=4096).contains(&self.generation_length) {
            return Err(AppError::InvalidField {
                field_name: "generation_length".to_string(),
                message: format!("{} is not within 1..=4096", self.generation_length),
            });
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(AppError::InvalidField {
                field_name: "temperature".to_string(),
                message: format!("{} is not within 0.0..=2.0", self.temperature),
            });
        }
        if !(0.0..=1.0).contains(&self.top_p) {
            return Err(AppError::InvalidField {
                field_name: "top_p".to_string(),
                message: format!("{} is not within 0.0..=1.0", self.top_p),
            });
        }
        Ok(())
    }
}

/// Trims and bounds user-supplied message text.
pub fn validate_message(field_name: &str, text: &str) -> Result<(), AppError> {
    if text.trim().is_empty() {
        return Err(AppError::EmptyField { field_name: field_name.to_string() });
    }
    if text.len() > MAX_MESSAGE_LENGTH {
        return Err(AppError::FieldTooLong {
            field_name: field_name.to_string(),
            max_length: MAX_MESSAGE_LENGTH,
            actual_length: text.len(),
        });
    }
    Ok(())
}

/// `message` while streaming, `stop` at a terminal transition,
/// `navigation` after a sibling switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateKind {
    Message,
    Stop,
    Navigation,
}

/// Command sent by the client over the WebSocket.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WsCommand {
    Chat {
        message: String,
    },
    Edit {
        level: usize,
        message: String,
    },
    Continue {
        #[serde(default)]
        level: Option<usize>,
    },
    Regenerate {
        #[serde(default)]
        level: Option<usize>,
    },
    ChangeActiveChild {
        level: usize,
        direction: Direction,
    },
    StopGeneration,
    ResetChat,
    NewChat,
    LoadChat {
        chat_id: String,
    },
    DeleteChat {
        chat_id: String,
    },
    EditChatName {
        name: String,
    },
    ListChats,
    GetModelConfig,
    UpdateModelConfig {
        config: ModelConfig,
    },
}

/// Event pushed by the server over the WebSocket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WsEvent {
    ChatHistory {
        chat_id: String,
        messages: Vec<MessageView>,
    },
    ChatUpdate {
        chat_id: String,
        messages: Vec<MessageView>,
        #[serde(rename = "type")]
        kind: UpdateKind,
    },
    ChatSaved {
        chat_id: String,
    },
    NewChatStarted {
        chat_id: String,
    },
    ChatList {
        chats: Vec<ChatSummary>,
    },
    ChatDeleted {
        success: bool,
        chat_id: String,
    },
    ModelConfigUpdated {
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        config: Option<ModelConfig>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Error {
        kind: String,
        message: String,
    },
}

impl From<&AppError> for WsEvent {
    fn from(err: &AppError) -> Self {
        WsEvent::Error { kind: err.kind().to_string(), message: err.to_string() }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UploadResponse {
    pub filename: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TranscribeRequest {
    pub filename: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TranscribeResponse {
    pub text: String,
}
