use crate::domain::ports::LanguageModel;
use crate::utils::error::{EtlError, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

const COMPLETIONS_API: &str = "chat/completions";

/// OpenAI 相容的 chat completion 客戶端
pub struct LlmClient {
    client: Client,
    api_url: String,
    api_key: String,
    model: String,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

impl LlmClient {
    pub fn new(api_url: &str, api_key: &str, model: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
            temperature: 0.7,
        })
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

/// 有些模型即使在 JSON 模式下仍會包上 ``` 區塊
fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(inner) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let inner = inner.strip_prefix("json").unwrap_or(inner);
    inner.strip_suffix("```").unwrap_or(inner).trim()
}

pub fn parse_json_reply(text: &str) -> Result<Value> {
    let value: Value = serde_json::from_str(strip_code_fence(text))?;
    if !value.is_object() {
        return Err(EtlError::FormatError {
            path: COMPLETIONS_API.to_string(),
            reason: format!("expected a JSON object, got {}", value),
        });
    }
    Ok(value)
}

#[async_trait]
impl LanguageModel for LlmClient {
    async fn complete_json(&self, system_prompt: &str, user_prompt: &str) -> Result<Value> {
        let url = format!("{}/{}", self.api_url, COMPLETIONS_API);
        let body = json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": system_prompt },
                { "role": "user", "content": user_prompt },
            ],
            "response_format": { "type": "json_object" },
            "temperature": self.temperature,
        });
        tracing::debug!(
            "LLM request to {} (model={}, prompt {} chars)",
            url,
            self.model,
            system_prompt.len() + user_prompt.len()
        );

        let response: CompletionResponse = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let content = response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| EtlError::RemoteApiError {
                api: COMPLETIONS_API.to_string(),
                code: -1,
                message: "response holds no message content".to_string(),
            })?;
        parse_json_reply(&content)
    }
}
