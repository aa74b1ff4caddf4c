//! Error taxonomy for the Study Execution Engine.
//!
//! Mirrors the teacher's composition style: one top-level [`EngineError`]
//! wraps per-subsystem error enums via `#[from]`, and every variant can
//! answer `is_retryable()` so the broker and workers classify failures from
//! a single source of truth (see §7 of `SPEC_FULL.md`).

use thiserror::Error;

use super::ids::{BatchId, ParticipantId, StoryArtifactId};

/// Top-level engine error.
#[derive(Error, Debug, Clone)]
pub enum EngineError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("batch stopped: {0}")]
    BatchStopped(#[from] BatchStoppedError),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("plugin error: {0}")]
    Plugin(#[from] PluginError),

    #[error("llm error: {0}")]
    Llm(#[from] LlmError),

    #[error("storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("blob store error: {0}")]
    Blob(#[from] BlobError),

    #[error("context error: {0}")]
    Context(#[from] ContextError),

    #[error("comment error: {0}")]
    Comment(#[from] CommentError),

    #[error("pairing error: {0}")]
    Pairing(#[from] PairingError),

    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Whether the broker should re-queue the job that produced this error
    /// with backoff (§4.1, §7), as opposed to moving it to the failed set.
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::BatchStopped(_) => true,
            EngineError::Storage(e) => e.is_retryable(),
            EngineError::Llm(e) => e.is_retryable(),
            _ => false,
        }
    }
}

/// Batch control-plane interruption: paused, deleting, or failed mid-run.
/// Always retryable (pause) or terminal-via-skip (deleting/failed), never a
/// bug in the handler itself.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BatchStoppedError {
    #[error("batch {0} is paused")]
    Paused(BatchId),

    #[error("batch {0} is deleting")]
    Deleting(BatchId),

    #[error("batch {0} already failed")]
    Failed(BatchId),

    #[error("batch {0} already complete")]
    Complete(BatchId),
}

impl BatchStoppedError {
    /// Only `Paused` is retryable; the others mean the job should report
    /// `SKIPPED` rather than be requeued (§4.8, §5).
    pub fn is_retryable(&self) -> bool {
        matches!(self, BatchStoppedError::Paused(_))
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PluginError {
    #[error("unknown plugin type: {0}")]
    UnknownType(String),

    #[error("plugin does not support headless mode: {0}")]
    HeadlessUnsupported(String),

    #[error("plugin execution failed: {0}")]
    ExecutionFailed(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LlmError {
    #[error("llm request timed out")]
    Timeout,

    #[error("llm returned a malformed action: {0}")]
    MalformedAction(String),

    #[error("llm provider error: {0}")]
    Provider(String),

    #[error("llm client is not configured")]
    NotConfigured,
}

impl LlmError {
    /// A single action loss is not retried (§4.8); the whole job is retried
    /// only once the action loop exhausts and returns control to the
    /// broker. We surface provider/timeout failures as retryable at the
    /// job level and let the caller decide whether to retry in-loop.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LlmError::Timeout | LlmError::Provider(_))
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("sqlite error: {0}")]
    Sqlite(String),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Sqlite(_))
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    #[error("queue not found: {0}")]
    UnknownQueue(String),

    #[error("job not found: {0}")]
    JobNotFound(JobId),

    #[error("backend error: {0}")]
    Backend(String),
}

use super::ids::JobId;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BlobError {
    #[error("invalid blob key: {0}")]
    InvalidKey(String),

    #[error("object not found: {0}")]
    NotFound(String),

    #[error("backend error: {0}")]
    Backend(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ContextError {
    #[error("agent context not found for participant {0}")]
    NotFound(ParticipantId),

    #[error("store error: {0}")]
    Store(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommentError {
    #[error("comment not found: {0}")]
    NotFound(CommentId),

    #[error("thread depth exceeded bound of {0}")]
    DepthExceeded(usize),

    #[error("store error: {0}")]
    Store(String),
}

use super::ids::CommentId;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PairingError {
    #[error("participant not found: {0}")]
    NotFound(ParticipantId),

    #[error("participant {0} already has a partner")]
    AlreadyPaired(ParticipantId),

    #[error("participants are not in the same study")]
    StudyMismatch,

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("story artifact not found for participant {participant}, pluginType {plugin_type}")]
    StoryNotFound {
        participant: ParticipantId,
        plugin_type: String,
    },
}

/// Marker used by persisted-story errors that also need a `StoryArtifactId`
/// for cleanup reporting (§4.10 step 5).
#[derive(Debug, Clone)]
pub struct StoryPersistFailure {
    pub artifact_id: Option<StoryArtifactId>,
    pub source: StoreError,
}
