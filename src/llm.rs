//! Anthropic messages API client for clip mining and metadata generation.
//!
//! Thin REST wrapper: one prompt in, one text completion out. The model and
//! temperature come from the `[clip_mining]` config section; the API key from
//! the `ANTHROPIC_API_KEY` environment variable.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::ClipMiningConfig;
use crate::error::StageError;

const ANTHROPIC_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const MAX_TOKENS: u32 = 4096;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

pub struct LlmClient {
    client: reqwest::Client,
    api_key: String,
    model: String,
    temperature: f32,
}

impl LlmClient {
    pub fn from_config(config: &ClipMiningConfig) -> Result<Self, StageError> {
        let api_key = std::env::var("ANTHROPIC_API_KEY")
            .ok()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| StageError::Other("ANTHROPIC_API_KEY not set in environment".into()))?;

        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            client,
            api_key,
            model: config.llm_model.clone(),
            temperature: config.llm_temperature,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Send a single-turn prompt and return the text completion.
    pub async fn complete(&self, prompt: &str) -> Result<String, StageError> {
        self.complete_with(prompt, MAX_TOKENS, self.temperature).await
    }

    /// As `complete`, with an explicit token budget and temperature for the
    /// long-output callers.
    pub async fn complete_with(
        &self,
        prompt: &str,
        max_tokens: u32,
        temperature: f32,
    ) -> Result<String, StageError> {
        let request = MessagesRequest {
            model: self.model.clone(),
            max_tokens,
            temperature,
            messages: vec![Message {
                role: "user".to_string(),
                content: prompt.to_string(),
            }],
        };

        tracing::info!(
            model = %self.model,
            prompt_len = prompt.len(),
            "sending messages request"
        );

        let response = self
            .client
            .post(ANTHROPIC_URL)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let detail = response.text().await.unwrap_or_default();
            return Err(StageError::Api {
                service: "anthropic".to_string(),
                status,
                detail,
            });
        }

        let result: MessagesResponse = response.json().await?;
        if result.stop_reason.as_deref() == Some("max_tokens") {
            return Err(StageError::Other(
                "completion truncated at the max_tokens limit".into(),
            ));
        }
        let text = result
            .content
            .into_iter()
            .find(|b| b.kind == "text")
            .map(|b| b.text)
            .ok_or_else(|| StageError::Other("empty completion from model".into()))?;

        tracing::info!(response_len = text.len(), "completion received");
        Ok(text)
    }
}

/// Models wrap JSON answers in markdown fences often enough that stripping
/// them here saves every caller a retry.
pub fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the fence line (which may carry a language tag), then the closer.
    let body = rest.split_once('\n').map(|(_, b)| b).unwrap_or(rest);
    body.trim().strip_suffix("```").unwrap_or(body).trim()
}

#[derive(Serialize)]
struct MessagesRequest {
    model: String,
    max_tokens: u32,
    temperature: f32,
    messages: Vec<Message>,
}

#[derive(Serialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: String,
}
