use thiserror::Error;

/// Top-level application error.
/// All variants carry a human-readable message for display/logging.
#[derive(Debug, Error)]
pub enum AppError {
    // ── Addressing / state errors ────────────────────────────────────────────
    #[error("Level {level} is out of range for an active path of {len} messages")]
    OutOfRange { level: usize, len: usize },

    #[error("Invalid state: {reason}")]
    InvalidState { reason: String },

    #[error("{entity_type} '{id}' not found")]
    NotFound { entity_type: String, id: String },

    // ── Collaborator errors ──────────────────────────────────────────────────
    #[error("Upstream service unavailable at {host}")]
    UpstreamUnavailable { host: String },

    #[error("Model '{model_name}' not found upstream")]
    ModelNotFound { model_name: String },

    #[error("Upstream failure: {message}")]
    UpstreamFailure { message: String },

    // ── Persistence errors ───────────────────────────────────────────────────
    #[error("Persistence failure: {message}")]
    PersistenceFailure { message: String },

    #[error("Database query failed: {message}")]
    DatabaseQueryFailed {
        message: String,
        #[source]
        source: sqlx::Error,
    },

    // ── Validation errors ────────────────────────────────────────────────────
    #[error("Field '{field_name}' cannot be empty")]
    EmptyField { field_name: String },

    #[error("Field '{field_name}' exceeds max length of {max_length} (actual: {actual_length})")]
    FieldTooLong { field_name: String, max_length: usize, actual_length: usize },

    #[error("Field '{field_name}' is out of range: {message}")]
    InvalidField { field_name: String, message: String },

    // ── System errors ────────────────────────────────────────────────────────
    #[error("Unexpected error: {0}")]
    Unexpected(String),
}

impl AppError {
    pub fn db_query(message: impl Into<String>, source: sqlx::Error) -> Self {
        AppError::DatabaseQueryFailed { message: message.into(), source }
    }

    pub fn invalid_state(reason: impl Into<String>) -> Self {
        AppError::InvalidState { reason: reason.into() }
    }

    pub fn chat_not_found(id: impl Into<String>) -> Self {
        AppError::NotFound { entity_type: "Chat".to_string(), id: id.into() }
    }

    pub fn persistence(message: impl Into<String>) -> Self {
        AppError::PersistenceFailure { message: message.into() }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, AppError::NotFound { .. })
    }

    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            AppError::EmptyField { .. } | AppError::FieldTooLong { .. } | AppError::InvalidField { .. }
        )
    }

    pub fn is_upstream(&self) -> bool {
        matches!(
            self,
            AppError::UpstreamUnavailable { .. }
                | AppError::ModelNotFound { .. }
                | AppError::UpstreamFailure { .. }
        )
    }

    pub fn is_agent_unavailable(&self) -> bool {
        matches!(self, AppError::UpstreamUnavailable { .. })
    }

    pub fn is_persistence(&self) -> bool {
        matches!(self, AppError::PersistenceFailure { .. } | AppError::DatabaseQueryFailed { .. })
    }

    /// Stable machine-readable tag, sent alongside the message in `error` events.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::OutOfRange { .. } => "out_of_range",
            AppError::InvalidState { .. } => "invalid_state",
            AppError::NotFound { .. } => "not_found",
            AppError::UpstreamUnavailable { .. }
            | AppError::ModelNotFound { .. }
            | AppError::UpstreamFailure { .. } => "upstream_failure",
            AppError::PersistenceFailure { .. } | AppError::DatabaseQueryFailed { .. } => {
                "persistence_failure"
            }
            AppError::EmptyField { .. }
            | AppError::FieldTooLong { .. }
            | AppError::InvalidField { .. } => "validation",
            AppError::Unexpected(_) => "unexpected",
        }
    }
}
