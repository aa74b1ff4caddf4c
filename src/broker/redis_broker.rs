//! Redis-backed [`Broker`] implementation (feature = "redis-broker").
//!
//! Priority ordering is a sorted set per queue, scored by
//! `priority * 1e15 + enqueue_millis` so lower priority numbers and
//! earlier enqueue times sort first (§4.1). Job payload/attempt/status
//! fields live in a companion hash keyed by job id. Claiming a job is a
//! `ZPOPMIN`-then-verify (an atomic `ZPOPMIN` is used directly, since Redis
//! guarantees the pop itself is atomic across clients).

use async_trait::async_trait;
use redis::AsyncCommands;
use std::sync::Arc;
use std::time::Duration;

use super::{Broker, HandlerError, Job, JobHandler, QueueStats, RetryPolicy, WorkerHandle};
use crate::types::{BrokerError, JobId, JobPriority};

pub struct RedisBroker {
    client: redis::Client,
}

impl RedisBroker {
    pub fn new(redis_url: &str) -> Result<Self, BrokerError> {
        let client =
            redis::Client::open(redis_url).map_err(|e| BrokerError::Backend(e.to_string()))?;
        Ok(Self { client })
    }

    fn zset_key(queue: &str) -> String {
        format!("study_engine:broker:{queue}:zset")
    }

    fn job_key(job_id: JobId) -> String {
        format!("study_engine:broker:job:{job_id}")
    }

    fn score(priority: JobPriority, enqueued_at_millis: i64) -> f64 {
        (priority as i64 as f64) * 1e15 + enqueued_at_millis as f64
    }

    async fn conn(&self) -> Result<redis::aio::MultiplexedConnection, BrokerError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| BrokerError::Backend(e.to_string()))
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn enqueue(
        &self,
        queue: &str,
        payload: serde_json::Value,
        job_id: Option<JobId>,
        priority: Option<JobPriority>,
    ) -> Result<JobId, BrokerError> {
        let mut conn = self.conn().await?;
        let id = job_id.unwrap_or_else(JobId::new);
        let job_key = Self::job_key(id);

        // Idempotent on job_id: if the hash already exists, leave it alone.
        let exists: bool = conn
            .exists(&job_key)
            .await
            .map_err(|e| BrokerError::Backend(e.to_string()))?;
        if exists {
            return Ok(id);
        }

        let priority = priority.unwrap_or_default();
        let now_millis = chrono::Utc::now().timestamp_millis();
        let record = serde_json::json!({
            "queue": queue,
            "payload": payload,
            "priority": priority,
            "attempt": 0,
            "status": "WAITING",
        });

        let _: () = conn
            .hset(&job_key, "record", record.to_string())
            .await
            .map_err(|e| BrokerError::Backend(e.to_string()))?;
        let _: () = conn
            .zadd(Self::zset_key(queue), id.to_string(), Self::score(priority, now_millis))
            .await
            .map_err(|e| BrokerError::Backend(e.to_string()))?;
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
                loop {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                    match broker.claim_next(&queue).await {
                        Ok(Some((job_id, job))) => {
                            let attempt = job.attempt;
                            match handler.handle(job).await {
                                Ok(_) => {
                                    let _ = broker.mark_completed(job_id).await;
                                }
                                Err(HandlerError::Retryable(msg)) => {
                                    if attempt < retry_policy.max_attempts {
                                        let delay = retry_policy.backoff_for_attempt(attempt);
                                        let _ = broker
                                            .requeue_with_delay(&queue, job_id, delay, msg)
                                            .await;
                                    } else {
                                        let _ = broker.mark_failed(job_id, msg).await;
                                    }
                                }
                                Err(HandlerError::Terminal(msg)) => {
                                    let _ = broker.mark_failed(job_id, msg).await;
                                }
                            }
                        }
                        Ok(None) => {
                            tokio::select! {
                                _ = tokio::time::sleep(Duration::from_millis(50)) => {},
                                _ = shutdown_rx.changed() => {},
                            }
                        }
                        Err(_) => {
                            tokio::time::sleep(Duration::from_millis(200)).await;
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
        let mut conn = self.conn().await?;
        let _: () = conn
            .hset(Self::job_key(job_id), "progress", percent.min(100))
            .await
            .map_err(|e| BrokerError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn stats(&self, queue: &str) -> Result<QueueStats, BrokerError> {
        let mut conn = self.conn().await?;
        let waiting: u64 = conn
            .zcard(Self::zset_key(queue))
            .await
            .map_err(|e| BrokerError::Backend(e.to_string()))?;
        Ok(QueueStats {
            waiting,
            ..Default::default()
        })
    }
}

impl RedisBroker {
    async fn claim_next(&self, queue: &str) -> Result<Option<(JobId, Job)>, BrokerError> {
        let mut conn = self.conn().await?;
        let popped: Vec<(String, f64)> = conn
            .zpopmin(Self::zset_key(queue), 1)
            .await
            .map_err(|e| BrokerError::Backend(e.to_string()))?;
        let Some((id_str, _score)) = popped.into_iter().next() else {
            return Ok(None);
        };
        let job_id: JobId = id_str.parse().map_err(|_| {
            BrokerError::Backend(format!("corrupt job id in queue: {id_str}"))
        })?;

        let raw: Option<String> = conn
            .hget(Self::job_key(job_id), "record")
            .await
            .map_err(|e| BrokerError::Backend(e.to_string()))?;
        let Some(raw) = raw else {
            return Ok(None);
        };
        let mut record: serde_json::Value = serde_json::from_str(&raw)
            .map_err(|e| BrokerError::Backend(e.to_string()))?;
        let attempt = record["attempt"].as_u64().unwrap_or(0) as u32 + 1;
        record["attempt"] = serde_json::json!(attempt);
        record["status"] = serde_json::json!("ACTIVE");
        let _: () = conn
            .hset(Self::job_key(job_id), "record", record.to_string())
            .await
            .map_err(|e| BrokerError::Backend(e.to_string()))?;

        let priority: JobPriority = serde_json::from_value(record["priority"].clone())
            .unwrap_or_default();
        let job = Job {
            id: job_id,
            queue: queue.to_string(),
            payload: record["payload"].clone(),
            priority,
            attempt,
        };
        Ok(Some((job_id, job)))
    }

    async fn mark_completed(&self, job_id: JobId) -> Result<(), BrokerError> {
        let mut conn = self.conn().await?;
        let _: () = conn
            .hset(Self::job_key(job_id), "status", "COMPLETED")
            .await
            .map_err(|e| BrokerError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn mark_failed(&self, job_id: JobId, error: String) -> Result<(), BrokerError> {
        let mut conn = self.conn().await?;
        let _: () = conn
            .hset_multiple(
                Self::job_key(job_id),
                &[("status", "FAILED".to_string()), ("last_error", error)],
            )
            .await
            .map_err(|e| BrokerError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn requeue_with_delay(
        &self,
        queue: &str,
        job_id: JobId,
        delay: Duration,
        error: String,
    ) -> Result<(), BrokerError> {
        let mut conn = self.conn().await?;
        let _: () = conn
            .hset(Self::job_key(job_id), "last_error", error)
            .await
            .map_err(|e| BrokerError::Backend(e.to_string()))?;
        let ready_at_millis = chrono::Utc::now().timestamp_millis() + delay.as_millis() as i64;
        let raw: String = conn
            .hget(Self::job_key(job_id), "record")
            .await
            .map_err(|e| BrokerError::Backend(e.to_string()))?;
        let record: serde_json::Value =
            serde_json::from_str(&raw).map_err(|e| BrokerError::Backend(e.to_string()))?;
        let priority: JobPriority =
            serde_json::from_value(record["priority"].clone()).unwrap_or_default();
        let _: () = conn
            .zadd(
                Self::zset_key(queue),
                job_id.to_string(),
                Self::score(priority, ready_at_millis),
            )
            .await
            .map_err(|e| BrokerError::Backend(e.to_string()))?;
        Ok(())
    }
}
