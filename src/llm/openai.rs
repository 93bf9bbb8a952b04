use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{truncate_chars, LanguageModel};
use crate::config::LlmConfig;
use crate::error::{KgragError, Result};

/// OpenAI-compatible chat completions client.
///
/// Works against any `/chat/completions` endpoint (OpenAI, Ollama, vLLM,
/// OpenRouter). The API key is optional for local providers.
pub struct OpenAIChatClient {
    api_key: String,
    base_url: String,
    model: String,
    max_tokens: u32,
    max_input_chars: usize,
    client: Client,
}

impl OpenAIChatClient {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let api_key = std::env::var(&config.api_key_env).unwrap_or_default();
        if api_key.is_empty() && config.base_url.contains("api.openai.com") {
            return Err(KgragError::Config(format!(
                "Environment variable {} not set",
                config.api_key_env
            )));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| KgragError::Llm(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            api_key,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            max_input_chars: config.max_input_chars,
            client,
        })
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChatMessage,
}

#[async_trait]
impl LanguageModel for OpenAIChatClient {
    async fn complete(&self, system: &str, prompt: &str) -> Result<String> {
        let prompt = truncate_chars(prompt, self.max_input_chars);
        let request = ChatRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: system.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: prompt.to_string(),
                },
            ],
            max_tokens: self.max_tokens,
            temperature: 0.0,
        };

        let url = format!("{}/chat/completions", self.base_url);
        let mut req = self.client.post(&url).header("content-type", "application/json");
        if !self.api_key.is_empty() {
            req = req.header("authorization", format!("Bearer {}", self.api_key));
        }

        let response = req
            .json(&request)
            .send()
            .await
            .map_err(|e| KgragError::Llm(format!("Request failed: {}", e)))?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(KgragError::Llm("Rate limited".to_string()));
        }
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(KgragError::Llm(format!("API error {}: {}", status, error_text)));
        }

        let chat_response: ChatResponse = response
            .json()
            .await
            .map_err(|e| KgragError::Llm(format!("Failed to parse response: {}", e)))?;

        chat_response
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| KgragError::Llm("Empty response".to_string()))
    }

    fn name(&self) -> &str {
        &self.model
    }
}
