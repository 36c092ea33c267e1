//! Chat-completion client for the conversation engine.
//!
//! Speaks the OpenAI-compatible wire shape: a system prompt plus a message
//! list in, text plus token usage out. Usage feeds the credit ledger, so
//! cached prompt tokens are surfaced separately when the provider reports
//! them.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, warn};

use hive_core::{HiveError, Result};

use crate::breaker::CircuitBreaker;
use crate::error::{classify_reqwest, classify_status};

#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: &'static str,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user",
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant",
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ChatUsage {
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub tokens_cached: u64,
}

#[derive(Debug, Clone)]
pub struct LlmReply {
    pub text: String,
    pub usage: ChatUsage,
}

pub struct LlmClient {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    max_tokens: u32,
    timeout: Duration,
    breaker: Arc<CircuitBreaker>,
}

impl LlmClient {
    pub fn new(config: &hive_core::config::LlmConfig, breaker: Arc<CircuitBreaker>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: config.api_key.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            timeout: Duration::from_secs(config.timeout_secs),
            breaker,
        }
    }

    /// One completion round: system prompt + history + current user turn.
    pub async fn complete(&self, system: &str, messages: &[ChatMessage]) -> Result<LlmReply> {
        self.breaker
            .guard(self.complete_inner(system, messages))
            .await
    }

    async fn complete_inner(&self, system: &str, messages: &[ChatMessage]) -> Result<LlmReply> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let mut wire: Vec<serde_json::Value> = Vec::with_capacity(messages.len() + 1);
        wire.push(serde_json::json!({"role": "system", "content": system}));
        for m in messages {
            wire.push(serde_json::json!({"role": m.role, "content": m.content}));
        }
        let body = serde_json::json!({
            "model": self.model,
            "messages": wire,
            "max_tokens": self.max_tokens,
        });

        debug!(model = %self.model, turns = messages.len(), "llm request");

        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .header("content-type", "application/json")
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| classify_reqwest("llm", e))?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let retry_after = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok());
            let text = resp.text().await.unwrap_or_default();
            warn!(status, body = %text, "llm api error");
            return Err(classify_status("llm", status, retry_after, &text));
        }

        let api: ApiResponse = resp.json().await.map_err(|e| HiveError::PermanentExternal {
            service: "llm".to_string(),
            reason: format!("undecodable response: {e}"),
        })?;
        parse_response(api)
    }
}

#[derive(Deserialize)]
struct ApiResponse {
    choices: Vec<ApiChoice>,
    #[serde(default)]
    usage: Option<ApiUsage>,
}

#[derive(Deserialize)]
struct ApiChoice {
    message: ApiMessage,
}

#[derive(Deserialize)]
struct ApiMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize, Default)]
struct ApiUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    #[serde(default)]
    prompt_tokens_details: Option<ApiPromptDetails>,
}

#[derive(Deserialize, Default)]
struct ApiPromptDetails {
    #[serde(default)]
    cached_tokens: u64,
}

fn parse_response(api: ApiResponse) -> Result<LlmReply> {
    let text = api
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .ok_or_else(|| HiveError::PermanentExternal {
            service: "llm".to_string(),
            reason: "response carried no choices".to_string(),
        })?;
    let usage = api.usage.unwrap_or_default();
    Ok(LlmReply {
        text,
        usage: ChatUsage {
            tokens_in: usage.prompt_tokens,
            tokens_out: usage.completion_tokens,
            tokens_cached: usage
                .prompt_tokens_details
                .map(|d| d.cached_tokens)
                .unwrap_or(0),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_usage_with_cached_tokens() {
        let raw = serde_json::json!({
            "choices": [{"message": {"role": "assistant", "content": "Temos o Curso Premium ideal..."}}],
            "usage": {
                "prompt_tokens": 820,
                "completion_tokens": 42,
                "prompt_tokens_details": {"cached_tokens": 700}
            }
        });
        let api: ApiResponse = serde_json::from_value(raw).unwrap();
        let reply = parse_response(api).unwrap();
        assert_eq!(reply.text, "Temos o Curso Premium ideal...");
        assert_eq!(reply.usage.tokens_in, 820);
        assert_eq!(reply.usage.tokens_out, 42);
        assert_eq!(reply.usage.tokens_cached, 700);
    }

    #[test]
    fn missing_usage_defaults_to_zero() {
        let raw = serde_json::json!({
            "choices": [{"message": {"content": "oi"}}]
        });
        let api: ApiResponse = serde_json::from_value(raw).unwrap();
        let reply = parse_response(api).unwrap();
        assert_eq!(reply.usage.tokens_in, 0);
    }

    #[test]
    fn empty_choices_is_a_permanent_error() {
        let api: ApiResponse = serde_json::from_value(serde_json::json!({"choices": []})).unwrap();
        assert!(parse_response(api).is_err());
    }
}
