//! Synthetic-participant LLM client contract (§4, Glossary "LLM Client").
//!
//! Grounded on the teacher's `reasoning::providers::cloud::CloudInferenceProvider`,
//! which wraps a single request/response round trip per provider rather than
//! exposing the provider's full chat API — the engine only ever needs "given
//! this role and the plugin's available actions, pick one".

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::types::{LlmConfig, LlmError};

/// Everything the synthetic-execution worker knows about the participant's
/// situation when it asks the LLM for the next action (§4.8).
#[derive(Debug, Clone, Serialize)]
pub struct RoleContext {
    pub role_prompt: String,
    pub story_state: serde_json::Value,
    pub available_actions: Vec<String>,
    pub history: Vec<ActionRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionRecord {
    pub action: String,
    pub result_summary: Option<String>,
}

/// The action (or structured comment) an LLM call returns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    pub name: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
    #[serde(default)]
    pub rationale: Option<String>,
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Picks the next action given the current role/story context. Returns
    /// `LlmError::MalformedAction` if the provider's response can't be
    /// parsed into an `Action` naming one of `available_actions` (§4.8).
    async fn generate(&self, context: &RoleContext, config: &LlmConfig) -> Result<Action, LlmError>;

    fn is_configured(&self) -> bool;
}

/// Deterministic stub used by tests and by [`crate::config::Config`] when no
/// provider credentials are present: always plays the first available
/// action, or `"wait"` if none are offered.
pub struct StubLlmClient {
    pub fixed_action: Option<String>,
}

impl StubLlmClient {
    pub fn new() -> Self {
        Self { fixed_action: None }
    }

    pub fn always(action: impl Into<String>) -> Self {
        Self { fixed_action: Some(action.into()) }
    }
}

impl Default for StubLlmClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LlmClient for StubLlmClient {
    async fn generate(&self, context: &RoleContext, _config: &LlmConfig) -> Result<Action, LlmError> {
        let name = self
            .fixed_action
            .clone()
            .or_else(|| context.available_actions.first().cloned())
            .unwrap_or_else(|| "wait".to_string());
        Ok(Action { name, arguments: serde_json::Value::Null, rationale: None })
    }

    fn is_configured(&self) -> bool {
        true
    }
}

#[cfg(feature = "cloud-llm")]
pub struct CloudLlmClient {
    http: reqwest::Client,
    api_key: Option<String>,
}

#[cfg(feature = "cloud-llm")]
impl CloudLlmClient {
    pub fn from_env() -> Self {
        let api_key = std::env::var("STUDY_ENGINE_LLM_API_KEY").ok();
        Self { http: reqwest::Client::new(), api_key }
    }

    fn endpoint(provider: &str) -> &'static str {
        match provider {
            "anthropic" => "https://api.anthropic.com/v1/messages",
            "openrouter" => "https://openrouter.ai/api/v1/chat/completions",
            _ => "https://api.openai.com/v1/chat/completions",
        }
    }
}

#[cfg(feature = "cloud-llm")]
#[async_trait]
impl LlmClient for CloudLlmClient {
    async fn generate(&self, context: &RoleContext, config: &LlmConfig) -> Result<Action, LlmError> {
        let api_key = self.api_key.as_ref().ok_or(LlmError::NotConfigured)?;
        let body = serde_json::json!({
            "model": config.model,
            "temperature": config.temperature.unwrap_or(0.7),
            "max_tokens": config.max_tokens.unwrap_or(512),
            "messages": [
                {"role": "system", "content": context.role_prompt},
                {"role": "user", "content": serde_json::json!({
                    "story_state": context.story_state,
                    "available_actions": context.available_actions,
                    "history": context.history,
                }).to_string()},
            ],
        });

        let response = self
            .http
            .post(Self::endpoint(&config.provider))
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::Provider(e.to_string()))?;

        if !response.status().is_success() {
            return Err(LlmError::Provider(format!("status {}", response.status())));
        }

        let payload: serde_json::Value = response
            .json()
            .await
            .map_err(|e| LlmError::Provider(e.to_string()))?;

        let content = payload["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| LlmError::MalformedAction("missing message content".to_string()))?;

        serde_json::from_str::<Action>(content)
            .map_err(|e| LlmError::MalformedAction(e.to_string()))
    }

    fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }
}
