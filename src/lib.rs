//! Study Execution Engine
//!
//! The queue-backed scheduler and orchestrator that runs multi-phase,
//! paired human/synthetic research studies: it turns a study's factorial
//! design into batch-creation jobs, drives synthetic participants through
//! their phases, barriers paired sessions, and exports the resulting
//! records. See `SPEC_FULL.md` for the full component design.

pub mod agent_context;
pub mod blob_store;
pub mod broker;
pub mod comment_service;
pub mod config;
pub mod llm_client;
pub mod metrics;
pub mod orchestrator;
pub mod pairing;
pub mod prelude;
pub mod progress;
pub mod status_cache;
pub mod store;
pub mod story_plugin;
pub mod types;
pub mod workers;

pub use types::*;

use std::sync::Arc;
use thiserror::Error;

use agent_context::StoreAgentContextService;
use blob_store::BlobStore;
use broker::{queue_names, Broker};
use comment_service::StoreCommentService;
use config::{BlobStoreBackend, BrokerBackend, Config};
use llm_client::LlmClient;
use orchestrator::{collaborative::CollaborativeOrchestrator, hybrid::HybridOrchestrator};
use pairing::StorePairingService;
use progress::recompute_batch_progress;
use status_cache::StatusCache;
use store::Store;
use story_plugin::{PluginRegistry, TwinePlugin};

/// Errors that can occur assembling a [`StudyEngine`] from configuration.
#[derive(Debug, Error)]
pub enum StudyEngineError {
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error(
        "the `{feature}` feature is required to use backend `{backend}`; \
         rebuild with `--features {feature}`"
    )]
    FeatureDisabled { feature: &'static str, backend: &'static str },
}

/// The assembled engine: every trait-object seam the workers and
/// orchestrators need, composed from one [`Config`], the way the teacher's
/// `AgentRuntime` composes its subsystems behind `Arc<dyn Trait>` fields.
///
/// `StudyEngine` does not run anything by itself — see
/// [`StudyEngine::wire_workers`] to subscribe the queue handlers, and the
/// `orchestrator`/`workers` modules for the logic each queue name
/// dispatches to.
#[derive(Clone)]
pub struct StudyEngine {
    pub store: Arc<dyn Store>,
    pub broker: Arc<dyn Broker>,
    pub blob_store: Arc<dyn BlobStore>,
    pub status_cache: Arc<StatusCache>,
    pub llm_client: Arc<dyn LlmClient>,
    pub plugins: Arc<PluginRegistry>,
    pub agent_context: Arc<StoreAgentContextService>,
    pub comments: Arc<StoreCommentService>,
    pub pairing: Arc<StorePairingService>,
    pub collaborative: Arc<CollaborativeOrchestrator>,
    pub hybrid: Arc<HybridOrchestrator>,
    config: Arc<Config>,
}

impl StudyEngine {
    /// Build an engine from configuration, selecting concrete backends for
    /// every trait-object seam per `config.{store,broker,blob_store,llm}`.
    pub async fn new(config: Config) -> Result<Self, StudyEngineError> {
        config.validate()?;

        tracing::info!(sqlite_path = %config.store.sqlite_path, "opening store");
        let store: Arc<dyn Store> = if config.store.sqlite_path == ":memory:" {
            Arc::new(store::sqlite::SqliteStore::open_in_memory()?)
        } else {
            Arc::new(store::sqlite::SqliteStore::open(std::path::Path::new(
                &config.store.sqlite_path,
            ))?)
        };

        tracing::info!(backend = ?config.broker.backend, "starting broker");
        let broker: Arc<dyn Broker> = match config.broker.backend {
            BrokerBackend::InMemory => Arc::new(broker::memory::InMemoryBroker::new()),
            BrokerBackend::Redis => Self::redis_broker(&config)?,
        };

        tracing::info!(backend = ?config.blob_store.backend, "starting blob store");
        let blob_store: Arc<dyn BlobStore> = match config.blob_store.backend {
            BlobStoreBackend::Local => Arc::new(blob_store::LocalBlobStore::new(
                config.blob_store.local_root.clone(),
            )),
            BlobStoreBackend::S3 => Self::s3_blob_store().await?,
        };

        let llm_client: Arc<dyn LlmClient> = Self::llm_client(&config);
        if !llm_client.is_configured() {
            tracing::warn!("no LLM provider configured; synthetic execution will use the stub client");
        }

        let mut plugins = PluginRegistry::new();
        plugins.register(Arc::new(TwinePlugin::new()));
        let plugins = Arc::new(plugins);

        let status_cache = Arc::new(StatusCache::new());
        let agent_context = Arc::new(StoreAgentContextService::new(store.clone()));
        let comments = Arc::new(StoreCommentService::new(store.clone()));
        let pairing = Arc::new(StorePairingService::new(store.clone()));

        let collaborative = Arc::new(CollaborativeOrchestrator::new(
            store.clone(),
            blob_store.clone(),
            agent_context.clone(),
            comments.clone(),
            plugins.clone(),
            llm_client.clone(),
        ));
        let hybrid = Arc::new(HybridOrchestrator::new(
            store.clone(),
            broker.clone(),
            Arc::new(orchestrator::hybrid::NullEventSink),
        ));

        Ok(Self {
            store,
            broker,
            blob_store,
            status_cache,
            llm_client,
            plugins,
            agent_context,
            comments,
            pairing,
            collaborative,
            hybrid,
            config: Arc::new(config),
        })
    }

    #[cfg(feature = "redis-broker")]
    fn redis_broker(config: &Config) -> Result<Arc<dyn Broker>, StudyEngineError> {
        let url = config
            .broker
            .redis_url
            .as_deref()
            .ok_or(config::ConfigError::MissingRequired {
                key: "broker.redis_url".to_string(),
            })?;
        Ok(Arc::new(broker::redis_broker::RedisBroker::new(url)?))
    }

    #[cfg(not(feature = "redis-broker"))]
    fn redis_broker(_config: &Config) -> Result<Arc<dyn Broker>, StudyEngineError> {
        Err(StudyEngineError::FeatureDisabled {
            feature: "redis-broker",
            backend: "redis",
        })
    }

    #[cfg(feature = "s3-blob-store")]
    async fn s3_blob_store() -> Result<Arc<dyn BlobStore>, StudyEngineError> {
        Ok(Arc::new(blob_store::S3BlobStore::from_env().await))
    }

    #[cfg(not(feature = "s3-blob-store"))]
    async fn s3_blob_store() -> Result<Arc<dyn BlobStore>, StudyEngineError> {
        Err(StudyEngineError::FeatureDisabled {
            feature: "s3-blob-store",
            backend: "s3",
        })
    }

    #[cfg(feature = "cloud-llm")]
    fn llm_client(config: &Config) -> Arc<dyn LlmClient> {
        if config.llm.api_key.is_some() || std::env::var("STUDY_ENGINE_LLM_API_KEY").is_ok() {
            Arc::new(llm_client::CloudLlmClient::from_env())
        } else {
            Arc::new(llm_client::StubLlmClient::new())
        }
    }

    #[cfg(not(feature = "cloud-llm"))]
    fn llm_client(_config: &Config) -> Arc<dyn LlmClient> {
        Arc::new(llm_client::StubLlmClient::new())
    }

    /// Subscribe every worker to its named queue (§6, §4.7–§4.14), at the
    /// per-queue concurrency configured in `config.concurrency`. Returns one
    /// [`broker::WorkerHandle`] per queue; callers shut them all down
    /// together on process exit via [`StudyEngine::shutdown`].
    pub fn wire_workers(&self) -> Vec<broker::WorkerHandle> {
        let concurrency = self.config.concurrency.max_concurrent_per_queue;
        let retry_policy = broker::RetryPolicy::default();
        let mut handles = Vec::with_capacity(6);

        {
            let store = self.store.clone();
            let broker = self.broker.clone();
            handles.push(self.broker.clone().subscribe(
                queue_names::BATCH_CREATION,
                Arc::new(move |job: broker::Job| {
                    let store = store.clone();
                    let broker = broker.clone();
                    async move {
                        let payload: BatchCreationPayload = serde_json::from_value(job.payload)
                            .map_err(|e| broker::HandlerError::Terminal(format!("bad payload: {e}")))?;
                        workers::batch_creation::run_single_actor(&store, &broker, job.id, payload)
                            .await
                            .map_err(Into::into)
                    }
                }),
                concurrency,
                retry_policy,
            ));
        }

        {
            let store = self.store.clone();
            let broker = self.broker.clone();
            handles.push(self.broker.clone().subscribe(
                queue_names::COLLABORATIVE_BATCH_CREATION,
                Arc::new(move |job: broker::Job| {
                    let store = store.clone();
                    let broker = broker.clone();
                    async move {
                        let payload: PairedBatchCreationPayload = serde_json::from_value(job.payload)
                            .map_err(|e| broker::HandlerError::Terminal(format!("bad payload: {e}")))?;
                        workers::batch_creation::run_paired(&store, &broker, job.id, payload)
                            .await
                            .map_err(Into::into)
                    }
                }),
                concurrency,
                retry_policy,
            ));
        }

        {
            let store = self.store.clone();
            let broker = self.broker.clone();
            let blob_store = self.blob_store.clone();
            handles.push(self.broker.clone().subscribe(
                queue_names::DATA_EXPORT,
                Arc::new(move |job: broker::Job| {
                    let store = store.clone();
                    let broker = broker.clone();
                    let blob_store = blob_store.clone();
                    async move {
                        let payload: ExportPayload = serde_json::from_value(job.payload)
                            .map_err(|e| broker::HandlerError::Terminal(format!("bad payload: {e}")))?;
                        workers::export::run(&store, &broker, &blob_store, job.id, payload)
                            .await
                            .map_err(Into::into)
                    }
                }),
                concurrency,
                retry_policy,
            ));
        }

        {
            let store = self.store.clone();
            let broker = self.broker.clone();
            let blob_store = self.blob_store.clone();
            let status_cache = self.status_cache.clone();
            let plugins = self.plugins.clone();
            let llm_client = self.llm_client.clone();
            handles.push(self.broker.clone().subscribe(
                queue_names::SYNTHETIC_EXECUTION,
                Arc::new(move |job: broker::Job| {
                    let store = store.clone();
                    let broker = broker.clone();
                    let blob_store = blob_store.clone();
                    let status_cache = status_cache.clone();
                    let plugins = plugins.clone();
                    let llm_client = llm_client.clone();
                    async move {
                        let payload: SyntheticExecutionPayload = serde_json::from_value(job.payload)
                            .map_err(|e| broker::HandlerError::Terminal(format!("bad payload: {e}")))?;
                        workers::synthetic_execution::run(
                            &store,
                            &broker,
                            &blob_store,
                            &status_cache,
                            &plugins,
                            &llm_client,
                            job.id,
                            payload,
                        )
                        .await
                        .map_err(Into::into)
                    }
                }),
                concurrency,
                retry_policy,
            ));
        }

        {
            let store = self.store.clone();
            let broker = self.broker.clone();
            let collaborative = self.collaborative.clone();
            let status_cache = self.status_cache.clone();
            handles.push(self.broker.clone().subscribe(
                queue_names::COLLABORATIVE_SESSION,
                Arc::new(move |job: broker::Job| {
                    let store = store.clone();
                    let broker = broker.clone();
                    let collaborative = collaborative.clone();
                    let status_cache = status_cache.clone();
                    async move { run_collaborative_session(&store, &broker, &status_cache, &collaborative, job).await }
                }),
                concurrency,
                retry_policy,
            ));
        }

        {
            let store = self.store.clone();
            let collaborative = self.collaborative.clone();
            let hybrid = self.hybrid.clone();
            handles.push(self.broker.clone().subscribe(
                queue_names::HYBRID_SESSION_SYNTHETIC_PHASE,
                Arc::new(move |job: broker::Job| {
                    let store = store.clone();
                    let collaborative = collaborative.clone();
                    let hybrid = hybrid.clone();
                    async move {
                        let payload: HybridSyntheticPhasePayload = serde_json::from_value(job.payload)
                            .map_err(|e| broker::HandlerError::Terminal(format!("bad payload: {e}")))?;
                        workers::hybrid_synthetic_phase::run(&store, &collaborative, &hybrid, job.id, payload)
                            .await
                            .map_err(Into::into)
                    }
                }),
                concurrency,
                retry_policy,
            ));
        }

        handles
    }

    /// Gracefully stop every worker subscription, draining in-flight jobs
    /// up to `config.broker.shutdown_grace_seconds` (§5).
    pub async fn shutdown(&self, handles: Vec<broker::WorkerHandle>) {
        let grace = std::time::Duration::from_secs(self.config.broker.shutdown_grace_seconds);
        futures::future::join_all(handles.into_iter().map(|h| h.shutdown(grace))).await;
    }
}

/// Handler body for `collaborative-session` jobs (§4.9): drives both
/// partners through the collaborative session's rounds via
/// [`CollaborativeOrchestrator::run_session`], reporting the orchestrator's
/// per-round progress back through the broker, then terminalizes both
/// participants and recomputes the batch's progress the same way the
/// synthetic-execution worker does for a single participant (§4.11).
async fn run_collaborative_session(
    store: &Arc<dyn Store>,
    broker: &Arc<dyn Broker>,
    status_cache: &Arc<StatusCache>,
    collaborative: &Arc<CollaborativeOrchestrator>,
    job: broker::Job,
) -> Result<serde_json::Value, broker::HandlerError> {
    #[derive(serde::Deserialize)]
    struct CollaborativeSessionPayload {
        #[serde(rename = "participantA")]
        participant_a: ParticipantId,
        #[serde(rename = "participantB")]
        participant_b: ParticipantId,
    }

    let payload: CollaborativeSessionPayload = serde_json::from_value(job.payload)
        .map_err(|e| broker::HandlerError::Terminal(format!("bad payload: {e}")))?;

    let participant = store
        .get_participant(payload.participant_a)
        .await
        .map_err(EngineError::Storage)?;
    let study = store
        .get_study(participant.study_id)
        .await
        .map_err(EngineError::Storage)?;
    let batch_id = participant.batch_id;

    let broker_for_progress = broker.clone();
    let job_id = job.id;
    collaborative
        .run_session(&study, payload.participant_a, payload.participant_b, move |percent| {
            let broker = broker_for_progress.clone();
            tokio::spawn(async move {
                let _ = broker.update_progress(job_id, percent).await;
            });
        })
        .await?;

    for participant_id in [payload.participant_a, payload.participant_b] {
        store
            .update_participant_with_event(participant_id, ParticipantState::Complete, serde_json::json!({}))
            .await
            .map_err(EngineError::Storage)?;
    }
    recompute_batch_progress(store, status_cache, batch_id)
        .await
        .map_err(EngineError::Storage)?;
    let _ = broker.update_progress(job_id, 100).await;

    Ok(serde_json::json!({
        "participantA": payload.participant_a,
        "participantB": payload.participant_b,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn builds_with_default_in_memory_backends() {
        let mut config = Config::default();
        config.store.sqlite_path = ":memory:".to_string();
        let engine = StudyEngine::new(config).await.unwrap();

        let stats = engine.broker.stats(queue_names::BATCH_CREATION).await.unwrap();
        assert_eq!(stats.waiting, 0);
    }

    #[cfg(not(feature = "redis-broker"))]
    #[tokio::test]
    async fn redis_backend_without_feature_reports_feature_disabled() {
        let mut config = Config::default();
        config.store.sqlite_path = ":memory:".to_string();
        config.broker.backend = BrokerBackend::Redis;
        config.broker.redis_url = Some("redis://localhost:6379".to_string());

        let result = StudyEngine::new(config).await;
        assert!(matches!(
            result,
            Err(StudyEngineError::FeatureDisabled { feature: "redis-broker", .. })
        ));
    }

    #[tokio::test]
    async fn wires_all_six_queues() {
        let mut config = Config::default();
        config.store.sqlite_path = ":memory:".to_string();
        let engine = StudyEngine::new(config).await.unwrap();
        let handles = engine.wire_workers();
        assert_eq!(handles.len(), 6);
        engine.shutdown(handles).await;
    }
}
