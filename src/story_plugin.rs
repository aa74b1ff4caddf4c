//! Story plugin contract (§4, Glossary "Story Plugin").
//!
//! Grounded on the teacher's `sandbox::SandboxRunner`: a narrow trait around
//! "run this headless, tell me what happened", with concrete backends
//! registered by name rather than matched on an enum. [`TwinePlugin`] is an
//! in-memory reference implementation (a linear story graph) sufficient for
//! tests and for studies that don't need a real Twine/Ink runtime.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use crate::types::PluginError;

/// Opaque per-session plugin state, round-tripped by the caller between
/// calls. Plugins are free to put whatever they need in here.
pub type PluginSessionId = String;

#[async_trait]
pub trait StoryPlugin: Send + Sync {
    fn plugin_type(&self) -> &'static str;

    /// Load `story_content` and start a headless session, returning a
    /// session id the other methods key off of.
    async fn init_headless(&self, story_content: serde_json::Value) -> Result<PluginSessionId, PluginError>;

    async fn get_state(&self, session_id: &PluginSessionId) -> Result<serde_json::Value, PluginError>;

    async fn get_available_actions(&self, session_id: &PluginSessionId) -> Result<Vec<String>, PluginError>;

    /// Apply `action`, returning the resulting state.
    async fn execute_headless(
        &self,
        session_id: &PluginSessionId,
        action: &str,
    ) -> Result<serde_json::Value, PluginError>;

    async fn is_complete(&self, session_id: &PluginSessionId) -> Result<bool, PluginError>;

    async fn destroy(&self, session_id: &PluginSessionId) -> Result<(), PluginError>;
}

/// `pluginType -> StoryPlugin` lookup (§6). Unknown types fail with
/// `PluginError::UnknownType` rather than silently falling back to a
/// default (§7).
#[derive(Clone, Default)]
pub struct PluginRegistry {
    plugins: HashMap<&'static str, Arc<dyn StoryPlugin>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self { plugins: HashMap::new() }
    }

    pub fn register(&mut self, plugin: Arc<dyn StoryPlugin>) {
        self.plugins.insert(plugin.plugin_type(), plugin);
    }

    pub fn get(&self, plugin_type: &str) -> Result<Arc<dyn StoryPlugin>, PluginError> {
        self.plugins
            .get(plugin_type)
            .cloned()
            .ok_or_else(|| PluginError::UnknownType(plugin_type.to_string()))
    }
}

/// Reference in-memory implementation: a linear sequence of passages, each
/// offering the choices declared in its content, advancing on a matching
/// action name and completing once the last passage is reached.
pub struct TwinePlugin {
    sessions: dashmap::DashMap<PluginSessionId, TwineSession>,
}

struct TwineSession {
    passages: Vec<TwinePassage>,
    current: usize,
}

#[derive(Clone, serde::Deserialize)]
struct TwinePassage {
    text: String,
    #[serde(default)]
    choices: Vec<String>,
}

impl TwinePlugin {
    pub fn new() -> Self {
        Self { sessions: dashmap::DashMap::new() }
    }
}

impl Default for TwinePlugin {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StoryPlugin for TwinePlugin {
    fn plugin_type(&self) -> &'static str {
        "twine"
    }

    async fn init_headless(&self, story_content: serde_json::Value) -> Result<PluginSessionId, PluginError> {
        let passages: Vec<TwinePassage> = serde_json::from_value(story_content)
            .map_err(|e| PluginError::ExecutionFailed(format!("invalid twine content: {e}")))?;
        if passages.is_empty() {
            return Err(PluginError::ExecutionFailed("story has no passages".to_string()));
        }
        let session_id = uuid::Uuid::new_v4().to_string();
        self.sessions.insert(session_id.clone(), TwineSession { passages, current: 0 });
        Ok(session_id)
    }

    async fn get_state(&self, session_id: &PluginSessionId) -> Result<serde_json::Value, PluginError> {
        let session = self
            .sessions
            .get(session_id)
            .ok_or_else(|| PluginError::ExecutionFailed(format!("unknown session {session_id}")))?;
        let passage = &session.passages[session.current];
        Ok(serde_json::json!({ "text": passage.text, "index": session.current }))
    }

    async fn get_available_actions(&self, session_id: &PluginSessionId) -> Result<Vec<String>, PluginError> {
        let session = self
            .sessions
            .get(session_id)
            .ok_or_else(|| PluginError::ExecutionFailed(format!("unknown session {session_id}")))?;
        Ok(session.passages[session.current].choices.clone())
    }

    async fn execute_headless(
        &self,
        session_id: &PluginSessionId,
        action: &str,
    ) -> Result<serde_json::Value, PluginError> {
        let mut session = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| PluginError::ExecutionFailed(format!("unknown session {session_id}")))?;
        let available = session.passages[session.current].choices.clone();
        if !available.contains(&action.to_string()) {
            return Err(PluginError::ExecutionFailed(format!(
                "action {action} is not available in the current passage"
            )));
        }
        if session.current + 1 < session.passages.len() {
            session.current += 1;
        }
        let passage = &session.passages[session.current];
        Ok(serde_json::json!({ "text": passage.text, "index": session.current }))
    }

    async fn is_complete(&self, session_id: &PluginSessionId) -> Result<bool, PluginError> {
        let session = self
            .sessions
            .get(session_id)
            .ok_or_else(|| PluginError::ExecutionFailed(format!("unknown session {session_id}")))?;
        Ok(session.current == session.passages.len() - 1 && session.passages[session.current].choices.is_empty())
    }

    async fn destroy(&self, session_id: &PluginSessionId) -> Result<(), PluginError> {
        self.sessions.remove(session_id);
        Ok(())
    }
}
