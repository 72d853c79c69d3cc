use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::agent::transcriber::Transcriber;
use crate::errors::AppError;

const MAX_UPLOAD_BYTES: usize = 25 * 1024 * 1024;
/// Uploads nobody transcribed within this window are dropped.
const UPLOAD_TTL: Duration = Duration::from_secs(15 * 60);

struct Upload {
    audio: Vec<u8>,
    stored_at: Instant,
}

/// Holds uploaded audio until a client asks for it to be transcribed.
#[derive(Clone)]
pub struct TranscriptionService {
    uploads: Arc<Mutex<HashMap<String, Upload>>>,
    transcriber: Option<Arc<dyn Transcriber>>,
    ttl: Duration,
}

impl TranscriptionService {
    pub fn new(transcriber: Option<Arc<dyn Transcriber>>) -> Self {
        Self::with_ttl(transcriber, UPLOAD_TTL)
    }

    pub fn with_ttl(transcriber: Option<Arc<dyn Transcriber>>, ttl: Duration) -> Self {
        Self { uploads: Arc::new(Mutex::new(HashMap::new())), transcriber, ttl }
    }

    fn prune(&self, uploads: &mut HashMap<String, Upload>) {
        let before = uploads.len();
        uploads.retain(|_, upload| upload.stored_at.elapsed() < self.ttl);
        if uploads.len() < before {
            debug!("Dropped {} expired uploads", before - uploads.len());
        }
    }

    /// Stores the audio and returns the filename to transcribe it by.
    pub async fn upload(&self, audio: Vec<u8>) -> Result<String, AppError> {
        if audio.is_empty() {
            return Err(AppError::EmptyField { field_name: "audio".to_string() });
        }
        if audio.len() > MAX_UPLOAD_BYTES {
            return Err(AppError::FieldTooLong {
                field_name: "audio".to_string(),
                max_length: MAX_UPLOAD_BYTES,
                actual_length: audio.len(),
            });
        }

        let filename = format!("{}.webm", Uuid::new_v4());
        info!("Stored {} bytes of audio as {filename}", audio.len());
        let mut uploads = self.uploads.lock().await;
        self.prune(&mut uploads);
        uploads.insert(filename.clone(), Upload { audio, stored_at: Instant::now() });
        Ok(filename)
    }

    /// Transcribes a previous upload. The upload is discarded once it has been
    /// transcribed successfully.
    pub async fn transcribe(&self, filename: &str) -> Result<String, AppError> {
        let Some(transcriber) = &self.transcriber else {
            warn!("Transcription requested but no transcription service is configured");
            return Err(AppError::UpstreamUnavailable { host: "transcription service".to_string() });
        };

        let audio = {
            let mut uploads = self.uploads.lock().await;
            self.prune(&mut uploads);
            uploads.get(filename).map(|upload| upload.audio.clone()).ok_or_else(|| {
                AppError::NotFound { entity_type: "Upload".to_string(), id: filename.to_string() }
            })?
        };

        let text = transcriber.transcribe(audio, filename).await?;
        self.uploads.lock().await.remove(filename);
        Ok(text)
    }
}
