//! LLM client collaborator: transport + normalization only.
//!
//! This is a working default implementation of the LLM-client
//! collaborator contract, not the subject of this crate's design —
//! the pipeline is written against the `LlmClient` trait, and this
//! OpenAI-compatible chat-completions client is one concrete instance
//! of it.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMsg {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Usage {
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
}

/// A fully-prepared request: by the time the pipeline calls the LLM
/// client, the prompt has already been through sanitization and
/// truncation. The client itself does no policy and no redaction.
#[derive(Debug, Clone)]
pub struct LlmRequest {
    pub model: String,
    pub system: String,
    pub user: String,
    pub max_output_tokens: u64,
    pub temperature: f64,
    pub top_p: f64,
    pub stop: Vec<String>,
}

impl LlmRequest {
    pub fn new(model: impl Into<String>, system: impl Into<String>, user: impl Into<String>, max_output_tokens: u64) -> Self {
        Self {
            model: model.into(),
            system: system.into(),
            user: user.into(),
            max_output_tokens,
            temperature: 0.2,
            top_p: 1.0,
            stop: Vec::new(),
        }
    }

    fn to_messages(&self) -> Vec<ChatMsg> {
        vec![
            ChatMsg { role: "system".to_string(), content: self.system.clone() },
            ChatMsg { role: "user".to_string(), content: self.user.clone() },
        ]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmReply {
    pub content: String,
    pub finish_reason: Option<String>,
    pub usage: Usage,
    pub provider_request_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub raw_json: Value,
    pub normalized: LlmReply,
}

/// The LLM-client collaborator contract: dispatch a prepared prompt and
/// return a normalized reply plus the raw provider payload.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn dispatch(&self, req: &LlmRequest) -> Result<LlmResponse, LlmError>;
}

pub struct OpenAiCompatClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl OpenAiCompatClient {
    pub fn new(base_url: String, api_key: Option<String>) -> Self {
        Self { client: Client::new(), base_url, api_key }
    }
}

#[derive(Debug, Serialize)]
struct OpenAiCompatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMsg>,
    max_tokens: u64,
    temperature: f64,
    top_p: f64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    stop: Vec<String>,
}

#[async_trait]
impl LlmClient for OpenAiCompatClient {
    async fn dispatch(&self, req: &LlmRequest) -> Result<LlmResponse, LlmError> {
        let url = format!("{}/v1/chat/completions", self.base_url.trim_end_matches('/'));
        let body = OpenAiCompatRequest {
            model: &req.model,
            messages: req.to_messages(),
            max_tokens: req.max_output_tokens,
            temperature: req.temperature,
            top_p: req.top_p,
            stop: req.stop.clone(),
        };

        let mut r = self.client.post(url).json(&body);
        if let Some(k) = &self.api_key {
            if !k.is_empty() {
                r = r.bearer_auth(k);
            }
        }
        tracing::debug!(model = %req.model, "dispatching llm request");
        let resp = r.send().await?;
        let raw: Value = resp.json().await?;

        let content = raw
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c0| c0.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|v| v.as_str())
            .ok_or_else(|| LlmError::InvalidResponse("missing choices[0].message.content".into()))?
            .to_string();

        let finish_reason = raw
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c0| c0.get("finish_reason"))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());

        let input_tokens = raw.get("usage").and_then(|u| u.get("prompt_tokens")).and_then(|v| v.as_u64());
        let output_tokens = raw.get("usage").and_then(|u| u.get("completion_tokens")).and_then(|v| v.as_u64());
        let provider_request_id = raw.get("id").and_then(|v| v.as_str()).map(|s| s.to_string());

        Ok(LlmResponse {
            raw_json: raw.clone(),
            normalized: LlmReply {
                content,
                finish_reason,
                usage: Usage { input_tokens, output_tokens },
                provider_request_id,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_builds_system_and_user_messages_in_order() {
        let req = LlmRequest::new("gpt-4o-mini", "be terse", "review this diff", 2048);
        let msgs = req.to_messages();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].role, "system");
        assert_eq!(msgs[1].role, "user");
    }

    #[test]
    fn default_sampling_params_are_deterministic_leaning() {
        let req = LlmRequest::new("m", "s", "u", 10);
        assert_eq!(req.temperature, 0.2);
        assert_eq!(req.top_p, 1.0);
    }
}
