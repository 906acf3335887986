//! Claude API Client
//!
//! Minimal Anthropic Messages API client used by the semantic scanning tier.
//! The fixed system instruction is sent with `cache_control: ephemeral` so
//! repeated scans only pay for the skill source.

use anyhow::{Context, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

pub const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Claude API client
#[derive(Clone)]
pub struct ClaudeClient {
    client: Client,
    api_key: Option<String>,
    api_url: String,
}

/// System message block with optional cache control
#[derive(Debug, Serialize)]
struct SystemBlock {
    r#type: String,
    text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    cache_control: Option<CacheControl>,
}

#[derive(Debug, Serialize)]
struct CacheControl {
    r#type: String,
}

#[derive(Debug, Serialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct MessageRequest {
    model: String,
    max_tokens: usize,
    system: Vec<SystemBlock>,
    messages: Vec<Message>,
}

#[derive(Debug, Deserialize)]
struct MessageResponse {
    content: Vec<ContentBlock>,
    usage: Usage,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    r#type: String,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    input_tokens: usize,
    output_tokens: usize,
    #[serde(default)]
    cache_read_input_tokens: usize,
}

/// Completion result with usage stats
#[derive(Debug, Clone)]
pub struct CompleteResult {
    pub content: String,
    pub model: String,
    pub input_tokens: usize,
    pub output_tokens: usize,
    pub cache_read_tokens: usize,
}

impl ClaudeClient {
    pub fn new(api_key: Option<&str>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            api_key: api_key.map(|s| s.to_string()),
            api_url: ANTHROPIC_API_URL.to_string(),
        })
    }

    /// Point the client at a different endpoint (proxy, gateway)
    pub fn with_api_url(mut self, url: &str) -> Self {
        self.api_url = url.to_string();
        self
    }

    /// Check if API key is configured
    pub fn is_available(&self) -> bool {
        self.api_key.is_some()
    }

    /// Single-turn completion with a cached system instruction
    pub async fn complete(
        &self,
        prompt: &str,
        system_instruction: &str,
        max_tokens: usize,
        model: &str,
    ) -> Result<CompleteResult> {
        let api_key = self
            .api_key
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("ANTHROPIC_API_KEY not set - semantic scanning unavailable"))?;

        let request = MessageRequest {
            model: model.to_string(),
            max_tokens,
            system: vec![SystemBlock {
                r#type: "text".to_string(),
                text: system_instruction.to_string(),
                cache_control: Some(CacheControl {
                    r#type: "ephemeral".to_string(),
                }),
            }],
            messages: vec![Message {
                role: "user".to_string(),
                content: prompt.to_string(),
            }],
        };

        debug!("Calling Claude API: model={}, prompt_len={}", model, prompt.len());

        let response = self
            .client
            .post(&self.api_url)
            .header("x-api-key", api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&request)
            .send()
            .await
            .context("Claude API unreachable")?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("Claude API error {}: {}", status, text);
        }

        let result: MessageResponse = response.json().await.context("Malformed Claude API response")?;

        let content = result
            .content
            .into_iter()
            .filter_map(|b| if b.r#type == "text" { b.text } else { None })
            .collect::<Vec<_>>()
            .join("\n");

        info!(
            "Claude response: model={}, in={}, out={}, cache_read={}",
            model, result.usage.input_tokens, result.usage.output_tokens, result.usage.cache_read_input_tokens
        );

        Ok(CompleteResult {
            content,
            model: model.to_string(),
            input_tokens: result.usage.input_tokens,
            output_tokens: result.usage.output_tokens,
            cache_read_tokens: result.usage.cache_read_input_tokens,
        })
    }
}
