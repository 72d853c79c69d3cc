use std::str::FromStr;

use anyhow::{Context, Result};

use crate::models::ModelConfig;

const DEFAULT_PORT: u16 = 8080;
const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";
const DEFAULT_MODEL: &str = "llama3.2";
const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful AI assistant. \
                                     Be concise, accurate, and friendly. \
                                     If you don't know something, say so.";

/// Process configuration, read from the environment (and `.env` in development).
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub database_url: Option<String>,
    pub ollama_base_url: String,
    pub system_prompt: String,
    pub whisper_api_url: Option<String>,
    pub model: ModelConfig,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let model = ModelConfig {
            model_name: non_empty("OLLAMA_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            generation_length: parse_or(&lookup, "GENERATION_LENGTH", 512)?,
            temperature: parse_or(&lookup, "TEMPERATURE", 0.7)?,
            top_p: parse_or(&lookup, "TOP_P", 0.9)?,
        };
        model.validate().context("invalid default model configuration")?;

        Ok(Self {
            port: parse_or(&lookup, "PORT", DEFAULT_PORT)?,
            database_url: non_empty("DATABASE_URL"),
            ollama_base_url: non_empty("OLLAMA_API_BASE_URL")
                .unwrap_or_else(|| DEFAULT_OLLAMA_URL.to_string()),
            system_prompt: non_empty("SYSTEM_PROMPT")
                .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
            whisper_api_url: non_empty("WHISPER_API_URL"),
            model,
        })
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .with_context(|| format!("{key} has an invalid value: {raw:?}")),
        _ => Ok(default),
    }
}
