//! Durable priority queue abstraction (§4.1).
//!
//! The `Broker` trait is the engine's only contract with "an external
//! key-value/queue service" (§2). [`memory`] ships an in-process
//! implementation sufficient for tests and single-process runs; enabling
//! the `redis-broker` feature swaps in [`redis_broker::RedisBroker`]
//! without the workers noticing.

pub mod memory;
pub mod priority_queue;

#[cfg(feature = "redis-broker")]
pub mod redis_broker;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::types::{BrokerError, JobId, JobPriority};

/// Stable queue identifiers (§6).
pub mod queue_names {
    pub const BATCH_CREATION: &str = "batch-creation";
    pub const SYNTHETIC_EXECUTION: &str = "synthetic-execution";
    pub const DATA_EXPORT: &str = "data-export";
    pub const COLLABORATIVE_BATCH_CREATION: &str = "collaborative-batch-creation";
    pub const COLLABORATIVE_SESSION: &str = "collaborative-session";
    pub const HYBRID_SESSION_SYNTHETIC_PHASE: &str = "hybrid-session-synthetic-phase";
}

/// A job as delivered to a handler.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub queue: String,
    pub payload: serde_json::Value,
    pub priority: JobPriority,
    pub attempt: u32,
}

/// Outcome classification a handler returns on failure, used to pick the
/// broker's retry policy (§4.1, §7).
#[derive(Debug, Clone)]
pub enum HandlerError {
    /// Re-queued with exponential backoff.
    Retryable(String),
    /// Moved to the failed set; fires the failure callback.
    Terminal(String),
}

impl HandlerError {
    pub fn message(&self) -> &str {
        match self {
            HandlerError::Retryable(m) | HandlerError::Terminal(m) => m,
        }
    }
}

impl From<crate::types::EngineError> for HandlerError {
    fn from(err: crate::types::EngineError) -> Self {
        if err.is_retryable() {
            HandlerError::Retryable(err.to_string())
        } else {
            HandlerError::Terminal(err.to_string())
        }
    }
}

/// Handler registered against a queue via [`Broker::subscribe`].
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: Job) -> Result<serde_json::Value, HandlerError>;
}

#[async_trait]
impl<F, Fut> JobHandler for F
where
    F: Fn(Job) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<serde_json::Value, HandlerError>> + Send,
{
    async fn handle(&self, job: Job) -> Result<serde_json::Value, HandlerError> {
        (self)(job).await
    }
}

/// Retry policy applied to a queue's jobs (§4.1).
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff: `base_delay * 2^(attempt - 1)`.
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        self.base_delay * 2u32.saturating_pow(attempt.saturating_sub(1))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueStats {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub delayed: u64,
}

/// A handle to a running subscription; dropping it does not stop the
/// workers — call [`WorkerHandle::shutdown`] for a graceful stop (§4.1, §5).
pub struct WorkerHandle {
    shutdown_tx: tokio::sync::watch::Sender<bool>,
    join_handles: Vec<tokio::task::JoinHandle<()>>,
}

impl WorkerHandle {
    /// Signal all workers to stop accepting new jobs, let in-flight jobs
    /// finish, and wait up to `grace` for them to exit (§4.1, §5).
    pub async fn shutdown(self, grace: Duration) {
        let _ = self.shutdown_tx.send(true);
        let _ = tokio::time::timeout(
            grace,
            futures::future::join_all(self.join_handles),
        )
        .await;
    }
}

/// Durable priority queue abstraction (§4.1).
#[async_trait]
pub trait Broker: Send + Sync {
    /// Enqueue a job. Idempotent on `job_id`: calling twice with the same
    /// id returns the existing job's id without creating a second entry
    /// (§4.1, property 6).
    async fn enqueue(
        &self,
        queue: &str,
        payload: serde_json::Value,
        job_id: Option<JobId>,
        priority: Option<JobPriority>,
    ) -> Result<JobId, BrokerError>;

    /// Enqueue many jobs at once.
    async fn enqueue_bulk(
        &self,
        queue: &str,
        jobs: Vec<(Option<JobId>, serde_json::Value, Option<JobPriority>)>,
    ) -> Result<Vec<JobId>, BrokerError>;

    /// Register a handler for `queue`, running up to `concurrency` jobs
    /// concurrently (§5). Returns immediately with a handle to stop it.
    fn subscribe(
        self: Arc<Self>,
        queue: &str,
        handler: Arc<dyn JobHandler>,
        concurrency: usize,
        retry_policy: RetryPolicy,
    ) -> WorkerHandle;

    async fn update_progress(&self, job_id: JobId, percent: u8) -> Result<(), BrokerError>;

    async fn stats(&self, queue: &str) -> Result<QueueStats, BrokerError>;
}
