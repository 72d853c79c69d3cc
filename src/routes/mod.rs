pub mod api_routes;
pub mod ws_routes;

use axum::extract::FromRef;

use crate::service::{ChatService, TranscriptionService};

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub chat: ChatService,
    pub transcription: TranscriptionService,
}

impl FromRef<AppState> for ChatService {
    fn from_ref(state: &AppState) -> Self {
        state.chat.clone()
    }
}

impl FromRef<AppState> for TranscriptionService {
    fn from_ref(state: &AppState) -> Self {
        state.transcription.clone()
    }
}
