pub mod chat_service;
pub mod client_session;
pub mod session_store;
pub mod transcription_service;

pub use chat_service::ChatService;
pub use client_session::ClientSession;
pub use session_store::SessionStore;
pub use transcription_service::TranscriptionService;
