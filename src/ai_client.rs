use crate::config::Config;
use crate::errors::AppError;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};

/// Generative text capability used as an extraction fallback.
#[async_trait]
pub trait TextGeneration: Send + Sync {
    async fn generate(&self, prompt: &str, system: &str) -> Result<String, AppError>;
}

const ANTHROPIC_VERSION: &str = "2023-06-01";
const FALLBACK_MODELS: [&str; 2] = ["claude-3-5-haiku-20241022", "claude-3-haiku-20240307"];

/// Anthropic Messages API client.
///
/// The configured model is tried first, then the fallback models in order.
pub struct ClaudeClient {
    client: Client,
    base_url: String,
    api_key: String,
    models: Vec<String>,
    max_tokens: u32,
}

impl ClaudeClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, model: &str) -> Self {
        let mut models = vec![model.to_string()];
        models.extend(
            FALLBACK_MODELS
                .iter()
                .filter(|m| **m != model)
                .map(|m| m.to_string()),
        );
        Self {
            client: Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
            models,
            max_tokens: 1024,
        }
    }

    /// `None` when `CLAUDE_API_KEY` is not configured.
    pub fn from_config(config: &Config) -> Option<Self> {
        config.claude_api_key.as_ref().map(|key| {
            Self::new(
                config.claude_base_url.clone(),
                key.clone(),
                &config.claude_model,
            )
        })
    }

    async fn call_model(&self, model: &str, prompt: &str, system: &str) -> Result<String, AppError> {
        let body = json!({
            "model": model,
            "max_tokens": self.max_tokens,
            "system": system,
            "messages": [{"role": "user", "content": prompt}],
        });

        let response = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|e| AppError::ExternalApiError(format!("Claude request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(AppError::ExternalApiError(format!(
                "Claude returned status {}: {}",
                status, error_text
            )));
        }

        let result: Value = response.json().await.map_err(|e| {
            AppError::ExternalApiError(format!("Failed to parse Claude response: {}", e))
        })?;

        result
            .pointer("/content/0/text")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| AppError::ExternalApiError("Claude response has no text content".into()))
    }
}

#[async_trait]
impl TextGeneration for ClaudeClient {
    async fn generate(&self, prompt: &str, system: &str) -> Result<String, AppError> {
        let mut last_error = AppError::Configuration("no model configured".to_string());
        for model in &self.models {
            match self.call_model(model, prompt, system).await {
                Ok(text) => return Ok(text),
                Err(e) => {
                    tracing::warn!("Model {} failed: {}", model, e);
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configured_model_comes_first() {
        let client = ClaudeClient::new("http://localhost", "key", "claude-3-haiku-20240307");
        assert_eq!(client.models[0], "claude-3-haiku-20240307");
        assert_eq!(client.models.len(), 2);
    }
}
