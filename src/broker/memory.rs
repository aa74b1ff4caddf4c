//! In-process broker backend: one binary heap per queue guarded by a
//! `tokio::sync::Mutex`, plus a `DashMap` of job records for O(1) lookup,
//! progress updates, and idempotent enqueue (§4.1).
//!
//! This is the default backend: sufficient for tests and single-process
//! deployments. [`super::redis_broker::RedisBroker`] (behind the
//! `redis-broker` feature) is the durable, multi-process backend the spec
//! calls "an external key-value/queue service".

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use super::priority_queue::{PriorityQueue, QueueEntry};
use super::{Broker, HandlerError, Job, JobHandler, QueueStats, RetryPolicy, WorkerHandle};
use crate::types::{BrokerError, JobId, JobPriority};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobStatus {
    Waiting,
    Active,
    Completed,
    Failed,
    Delayed,
}

#[derive(Debug, Clone)]
struct JobRecord {
    queue: String,
    payload: serde_json::Value,
    priority: JobPriority,
    attempt: u32,
    status: JobStatus,
    progress: u8,
    ready_at: Instant,
    #[allow(dead_code)]
    result: Option<serde_json::Value>,
    #[allow(dead_code)]
    last_error: Option<String>,
}

struct QueueState {
    heap: Mutex<PriorityQueue>,
    jobs: DashMap<JobId, JobRecord>,
}

impl QueueState {
    fn new() -> Self {
        Self {
            heap: Mutex::new(PriorityQueue::new()),
            jobs: DashMap::new(),
        }
    }
}

/// In-memory, single-process [`Broker`] implementation.
pub struct InMemoryBroker {
    queues: DashMap<String, Arc<QueueState>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            queues: DashMap::new(),
        }
    }

    fn queue_state(&self, queue: &str) -> Arc<QueueState> {
        self.queues
            .entry(queue.to_string())
            .or_insert_with(|| Arc::new(QueueState::new()))
            .clone()
    }

    /// Pop the highest-priority job whose `ready_at` has elapsed, if any.
    async fn pop_ready(state: &QueueState) -> Option<JobId> {
        let mut heap = state.heap.lock().await;
        let now = Instant::now();
        let mut deferred = Vec::new();
        let mut found = None;
        while let Some(entry) = heap.pop() {
            let ready = state
                .jobs
                .get(&entry.job_id)
                .map(|r| r.ready_at <= now)
                .unwrap_or(false);
            if ready {
                found = Some(entry.job_id);
                break;
            } else {
                deferred.push(entry);
            }
        }
        for entry in deferred {
            heap.push(entry);
        }
        found
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn enqueue(
        &self,
        queue: &str,
        payload: serde_json::Value,
        job_id: Option<JobId>,
        priority: Option<JobPriority>,
    ) -> Result<JobId, BrokerError> {
        let state = self.queue_state(queue);
        let id = job_id.unwrap_or_else(JobId::new);

        // Idempotent on job_id (§4.1, property 6).
        if state.jobs.contains_key(&id) {
            return Ok(id);
        }

        let priority = priority.unwrap_or_default();
        state.jobs.insert(
            id,
            JobRecord {
                queue: queue.to_string(),
                payload,
                priority,
                attempt: 0,
                status: JobStatus::Waiting,
                progress: 0,
                ready_at: Instant::now(),
                result: None,
                last_error: None,
            },
        );
        state.heap.lock().await.push(QueueEntry {
            job_id: id,
            priority,
            enqueued_at: Instant::now(),
        });
        Ok(id)
    }

    async fn enqueue_bulk(
        &self,
        queue: &str,
        jobs: Vec<(Option<JobId>, serde_json::Value, Option<JobPriority>)>,
    ) -> Result<Vec<JobId>, BrokerError> {
        let mut ids = Vec::with_capacity(jobs.len());
        for (job_id, payload, priority) in jobs {
            ids.push(self.enqueue(queue, payload, job_id, priority).await?);
        }
        Ok(ids)
    }

    fn subscribe(
        self: Arc<Self>,
        queue: &str,
        handler: Arc<dyn JobHandler>,
        concurrency: usize,
        retry_policy: RetryPolicy,
    ) -> WorkerHandle {
        let queue = queue.to_string();
        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
        let mut join_handles = Vec::with_capacity(concurrency);

        for _ in 0..concurrency {
            let broker = self.clone();
            let queue = queue.clone();
            let handler = handler.clone();
            let retry_policy = retry_policy;
            let mut shutdown_rx = shutdown_rx.clone();

            join_handles.push(tokio::spawn(async move {
                let state = broker.queue_state(&queue);
                loop {
                    if *shutdown_rx.borrow() {
                        break;
                    }

                    let popped = Self::pop_ready(&state).await;
                    let Some(job_id) = popped else {
                        tokio::select! {
                            _ = tokio::time::sleep(Duration::from_millis(20)) => {},
                            _ = shutdown_rx.changed() => {},
                        }
                        continue;
                    };

                    let (payload, priority, attempt) = {
                        let mut record = state.jobs.get_mut(&job_id).expect("job record present");
                        record.status = JobStatus::Active;
                        record.attempt += 1;
                        (record.payload.clone(), record.priority, record.attempt)
                    };

                    let job = Job {
                        id: job_id,
                        queue: queue.clone(),
                        payload,
                        priority,
                        attempt,
                    };

                    match handler.handle(job).await {
                        Ok(result) => {
                            if let Some(mut record) = state.jobs.get_mut(&job_id) {
                                record.status = JobStatus::Completed;
                                record.progress = 100;
                                record.result = Some(result);
                            }
                        }
                        Err(HandlerError::Retryable(msg)) => {
                            let requeue = if let Some(mut record) = state.jobs.get_mut(&job_id) {
                                record.last_error = Some(msg);
                                if record.attempt < retry_policy.max_attempts {
                                    record.status = JobStatus::Delayed;
                                    record.ready_at = Instant::now()
                                        + retry_policy.backoff_for_attempt(record.attempt);
                                    Some(record.priority)
                                } else {
                                    record.status = JobStatus::Failed;
                                    None
                                }
                            } else {
                                None
                            };
                            if let Some(priority) = requeue {
                                state.heap.lock().await.push(QueueEntry {
                                    job_id,
                                    priority,
                                    enqueued_at: Instant::now(),
                                });
                            }
                        }
                        Err(HandlerError::Terminal(msg)) => {
                            if let Some(mut record) = state.jobs.get_mut(&job_id) {
                                record.status = JobStatus::Failed;
                                record.last_error = Some(msg);
                            }
                        }
                    }
                }
            }));
        }

        WorkerHandle {
            shutdown_tx,
            join_handles,
        }
    }

    async fn update_progress(&self, job_id: JobId, percent: u8) -> Result<(), BrokerError> {
        for entry in self.queues.iter() {
            if let Some(mut record) = entry.value().jobs.get_mut(&job_id) {
                record.progress = percent.min(100);
                return Ok(());
            }
        }
        Err(BrokerError::JobNotFound(job_id))
    }

    async fn stats(&self, queue: &str) -> Result<QueueStats, BrokerError> {
        let state = self
            .queues
            .get(queue)
            .ok_or_else(|| BrokerError::UnknownQueue(queue.to_string()))?;
        let mut stats = QueueStats::default();
        for record in state.jobs.iter() {
            match record.status {
                JobStatus::Waiting => stats.waiting += 1,
                JobStatus::Active => stats.active += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
                JobStatus::Delayed => stats.delayed += 1,
            }
        }
        Ok(stats)
    }
}
