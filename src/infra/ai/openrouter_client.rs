use crate::core::moderation::TextClassificationProvider;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::error::Error;
use std::time::Duration;

const DEFAULT_BASE_URL: &str = "https://openrouter.ai/api/v1";

#[derive(Debug, Clone)]
pub struct OpenRouterConfig {
    pub model: String,
    pub base_url: String,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    /// Transport-level timeout; the moderation call policy applies its own.
    pub request_timeout: Duration,
}

impl OpenRouterConfig {
    pub fn new(model: String) -> Self {
        Self {
            model,
            base_url: DEFAULT_BASE_URL.to_string(),
            temperature: 0.0,
            max_tokens: Some(200),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Chat-completions client used as the text moderation classifier.
pub struct OpenRouterClient {
    client: Client,
    api_key: String,
    config: OpenRouterConfig,
}

impl OpenRouterClient {
    pub fn new(api_key: String, config: OpenRouterConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self {
            client,
            api_key,
            config,
        })
    }

    fn payload(&self, prompt: &str) -> Value {
        json!({
            "model": self.config.model,
            "messages": [{ "role": "user", "content": prompt }],
            "temperature": self.config.temperature,
            "max_tokens": self.config.max_tokens,
        })
    }
}

/// Pull the first choice's message content out of a chat-completions body.
///
/// A missing or null content is returned as an empty string so the caller
/// treats it like an empty answer.
fn extract_content(response: &Value) -> String {
    response["choices"][0]["message"]["content"]
        .as_str()
        .unwrap_or_default()
        .to_string()
}

#[async_trait]
impl TextClassificationProvider for OpenRouterClient {
    async fn classify(&self, prompt: &str) -> Result<String, Box<dyn Error + Send + Sync>> {
        let url = format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        );

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&self.payload(prompt))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await?;
            return Err(format!("OpenRouter API error: {} - {}", status, text).into());
        }

        let response_json: Value = response.json().await?;
        Ok(extract_content(&response_json))
    }
}
