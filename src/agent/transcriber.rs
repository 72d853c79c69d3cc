use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use tracing::error;

use crate::errors::AppError;

/// Speech-to-text collaborator.
#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, audio: Vec<u8>, filename: &str) -> Result<String, AppError>;
}

#[derive(Debug, Deserialize)]
struct TranscriptionResponse {
    text: String,
}

/// Posts audio to an OpenAI-compatible `/v1/audio/transcriptions` endpoint
/// (whisper.cpp server, faster-whisper-server, ...).
pub struct WhisperTranscriber {
    http: reqwest::Client,
    url: String,
    model: String,
}

impl WhisperTranscriber {
    pub fn new(url: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            url: url.to_string(),
            model: "whisper-1".to_string(),
        }
    }
}

#[async_trait]
impl Transcriber for WhisperTranscriber {
    async fn transcribe(&self, audio: Vec<u8>, filename: &str) -> Result<String, AppError> {
        let form = Form::new()
            .part("file", Part::bytes(audio).file_name(filename.to_string()))
            .text("model", self.model.clone());

        let response = self.http.post(&self.url).multipart(form).send().await.map_err(|e| {
            error!("Transcription request failed: {e}");
            if e.is_connect() || e.is_timeout() {
                AppError::UpstreamUnavailable { host: self.url.clone() }
            } else {
                AppError::UpstreamFailure { message: e.to_string() }
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!("Transcription service returned {status}: {body}");
            return Err(AppError::UpstreamFailure {
                message: format!("transcription failed with {status}"),
            });
        }

        let parsed: TranscriptionResponse = response.json().await.map_err(|e| {
            AppError::UpstreamFailure { message: format!("malformed transcription response: {e}") }
        })?;
        Ok(parsed.text.trim().to_string())
    }
}
