use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, error, info};

use crate::agent::{GenerationRequest, Generator};
use crate::errors::AppError;
use crate::models::ModelConfig;

#[derive(Debug, Serialize)]
struct OllamaChatRequest<'a> {
    model: &'a str,
    messages: Vec<OllamaMessage<'a>>,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Debug, Serialize)]
struct OllamaMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    temperature: f64,
    top_p: f64,
    num_predict: u32,
}

/// One NDJSON line of a streamed `/api/chat` response.
#[derive(Debug, Deserialize)]
struct OllamaChunk {
    #[serde(default)]
    message: Option<OllamaChunkMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OllamaChunkMessage {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    models: Vec<TagModel>,
}

#[derive(Debug, Deserialize)]
struct TagModel {
    name: String,
}

enum StreamLine {
    Text(String),
    Done,
    Skip,
}

/// Streams chat completions from a local Ollama server. The prompt is replayed
/// from the conversation tree on every request; a trailing assistant turn is
/// continued by the model rather than answered.
pub struct OllamaGenerator {
    http: reqwest::Client,
    base_url: String,
    system_prompt: String,
    config: RwLock<ModelConfig>,
}

impl OllamaGenerator {
    pub fn new(base_url: &str, system_prompt: impl Into<String>, config: ModelConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            system_prompt: system_prompt.into(),
            config: RwLock::new(config),
        }
    }

    fn transport_error(&self, err: reqwest::Error) -> AppError {
        if err.is_connect() || err.is_timeout() {
            AppError::UpstreamUnavailable { host: self.base_url.clone() }
        } else {
            AppError::UpstreamFailure { message: err.to_string() }
        }
    }

    async fn available_models(&self) -> Result<Vec<String>, AppError> {
        let response = self
            .http
            .get(format!("{}/api/tags", self.base_url))
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;
        if !response.status().is_success() {
            return Err(AppError::UpstreamFailure {
                message: format!("listing models returned {}", response.status()),
            });
        }
        let tags: TagsResponse = response.json().await.map_err(|e| self.transport_error(e))?;
        Ok(tags.models.into_iter().map(|m| m.name).collect())
    }
}

#[async_trait]
impl Generator for OllamaGenerator {
    async fn stream(
        &self,
        request: GenerationRequest,
        tx: mpsc::Sender<String>,
    ) -> Result<(), AppError> {
        let config = self.config.read().await.clone();
        let body = build_request(&config, &self.system_prompt, &request);

        let response = self
            .http
            .post(format!("{}/api/chat", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                error!("Ollama request failed: {e}");
                self.transport_error(e)
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            error!("Ollama returned {status}: {text}");
            return Err(if status == StatusCode::NOT_FOUND {
                AppError::ModelNotFound { model_name: config.model_name }
            } else {
                AppError::UpstreamFailure { message: format!("{status}: {text}") }
            });
        }

        let mut bytes = response.bytes_stream();
        let mut buffer = Vec::new();
        while let Some(chunk) = bytes.next().await {
            let chunk = chunk.map_err(|e| self.transport_error(e))?;
            buffer.extend_from_slice(&chunk);
            for line in drain_lines(&mut buffer) {
                match parse_line(&line)? {
                    StreamLine::Text(text) => {
                        if tx.send(text).await.is_err() {
                            debug!("Generation receiver dropped; abandoning Ollama stream");
                            return Ok(());
                        }
                    }
                    StreamLine::Done => return Ok(()),
                    StreamLine::Skip => {}
                }
            }
        }

        // A final line without a trailing newline.
        let rest = String::from_utf8_lossy(&buffer).into_owned();
        if let StreamLine::Text(text) = parse_line(&rest)? {
            let _ = tx.send(text).await;
        }
        Ok(())
    }

    async fn config(&self) -> ModelConfig {
        self.config.read().await.clone()
    }

    async fn update_config(&self, config: ModelConfig) -> Result<ModelConfig, AppError> {
        config.validate()?;
        let models = self.available_models().await?;
        if !models.iter().any(|available| model_matches(available, &config.model_name)) {
            return Err(AppError::ModelNotFound { model_name: config.model_name });
        }
        *self.config.write().await = config.clone();
        info!("Model configuration updated: {}", config.model_name);
        Ok(config)
    }
}

fn build_request<'a>(
    config: &'a ModelConfig,
    system_prompt: &'a str,
    request: &'a GenerationRequest,
) -> OllamaChatRequest<'a> {
    let mut messages = Vec::with_capacity(request.messages.len() + 1);
    if !system_prompt.is_empty() {
        messages.push(OllamaMessage { role: "system", content: system_prompt });
    }
    messages.extend(
        request
            .messages
            .iter()
            .map(|m| OllamaMessage { role: m.role.as_str(), content: &m.content }),
    );
    OllamaChatRequest {
        model: &config.model_name,
        messages,
        stream: true,
        options: OllamaOptions {
            temperature: config.temperature,
            top_p: config.top_p,
            num_predict: config.generation_length,
        },
    }
}

/// Splits complete `\n`-terminated lines off the front of `buffer`.
fn drain_lines(buffer: &mut Vec<u8>) -> Vec<String> {
    let mut lines = Vec::new();
    while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
        let line: Vec<u8> = buffer.drain(..=pos).collect();
        lines.push(String::from_utf8_lossy(&line[..pos]).into_owned());
    }
    lines
}

fn parse_line(line: &str) -> Result<StreamLine, AppError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(StreamLine::Skip);
    }
    let chunk: OllamaChunk = serde_json::from_str(line).map_err(|e| AppError::UpstreamFailure {
        message: format!("malformed stream line: {e}"),
    })?;
    if let Some(message) = chunk.error {
        return Err(AppError::UpstreamFailure { message });
    }
    match chunk.message {
        Some(m) if !m.content.is_empty() => Ok(StreamLine::Text(m.content)),
        _ if chunk.done => Ok(StreamLine::Done),
        _ => Ok(StreamLine::Skip),
    }
}

fn model_matches(available: &str, requested: &str) -> bool {
    available == requested || available.strip_suffix(":latest") == Some(requested)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::PromptMessage;
    use crate::models::MessageRole;

    fn config() -> ModelConfig {
        ModelConfig {
            model_name: "llama3.2".into(),
            generation_length: 256,
            temperature: 0.5,
            top_p: 0.9,
        }
    }

    #[test]
    fn request_prepends_system_prompt_and_maps_options() {
        let config = config();
        let request = GenerationRequest {
            messages: vec![
                PromptMessage { role: MessageRole::User, content: "hi".into() },
                PromptMessage { role: MessageRole::Assistant, content: "Hel".into() },
            ],
        };
        let body = serde_json::to_value(build_request(&config, "be brief", &request)).unwrap();
        assert_eq!(
            body,
            serde_json::json!({
                "model": "llama3.2",
                "messages": [
                    {"role": "system", "content": "be brief"},
                    {"role": "user", "content": "hi"},
                    {"role": "assistant", "content": "Hel"}
                ],
                "stream": true,
                "options": {"temperature": 0.5, "top_p": 0.9, "num_predict": 256}
            })
        );
    }

    #[test]
    fn lines_are_split_across_network_chunks() {
        let mut buffer = b"{\"message\":{\"content\":\"He\"}}\n{\"mess".to_vec();
        let lines = drain_lines(&mut buffer);
        assert_eq!(lines, vec!["{\"message\":{\"content\":\"He\"}}".to_string()]);
        assert_eq!(buffer, b"{\"mess".to_vec());

        buffer.extend_from_slice(b"age\":{\"content\":\"llo\"}}\n");
        let lines = drain_lines(&mut buffer);
        assert_eq!(lines.len(), 1);
        assert!(buffer.is_empty());
        assert!(matches!(parse_line(&lines[0]).unwrap(), StreamLine::Text(t) if t == "llo"));
    }

    #[test]
    fn stream_lines_are_classified() {
        assert!(matches!(parse_line("").unwrap(), StreamLine::Skip));
        assert!(matches!(
            parse_line(r#"{"message":{"role":"assistant","content":""},"done":true}"#).unwrap(),
            StreamLine::Done
        ));
        let err = parse_line(r#"{"error":"model is loading"}"#).err().unwrap();
        assert!(err.is_upstream());
        assert!(parse_line("not json").is_err());
    }

    #[test]
    fn latest_tag_is_implied() {
        assert!(model_matches("llama3.2:latest", "llama3.2"));
        assert!(model_matches("qwen2.5:14b", "qwen2.5:14b"));
        assert!(!model_matches("qwen2.5:14b", "qwen2.5"));
    }
}
