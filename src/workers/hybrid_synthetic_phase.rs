//! Hybrid Synthetic-Phase Worker (§4.13).
//!
//! Runs the synthetic half of one phase of a hybrid session and reports
//! the result back to the [`HybridOrchestrator`] barrier. An optional
//! `responseDelayMs` sleep comes first, simulating a human-paced partner
//! so the synthetic side doesn't always answer instantly (§4.13, Design
//! Notes on the human+synthetic pacing mismatch).

use std::sync::Arc;

use crate::orchestrator::collaborative::CollaborativeOrchestrator;
use crate::orchestrator::hybrid::HybridOrchestrator;
use crate::store::Store;
use crate::types::{EngineError, HybridSyntheticPhasePayload, JobId};

pub async fn run(
    store: &Arc<dyn Store>,
    collaborative: &CollaborativeOrchestrator,
    hybrid: &HybridOrchestrator,
    _job_id: JobId,
    payload: HybridSyntheticPhasePayload,
) -> Result<serde_json::Value, EngineError> {
    if let Some(delay_ms) = payload.response_delay_ms {
        tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
    }

    let session = store.get_hybrid_session(payload.session_id).await.map_err(EngineError::Storage)?;
    let study = store.get_study(session.study_id).await.map_err(EngineError::Storage)?;

    let result = collaborative
        .run_phase_for(
            payload.synthetic_participant_id,
            payload.human_participant_id,
            payload.phase,
            payload.round,
            &study,
        )
        .await?;

    // Idempotent: if another delivery of this job already reported this
    // phase complete, `on_phase_complete` is a no-op rather than
    // re-advancing the session.
    hybrid
        .on_phase_complete(
            payload.session_id,
            payload.synthetic_participant_id,
            payload.round,
            payload.phase,
            result.clone(),
            &payload.llm_config,
        )
        .await?;

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_context::StoreAgentContextService;
    use crate::blob_store::LocalBlobStore;
    use crate::broker::memory::InMemoryBroker;
    use crate::broker::Broker;
    use crate::comment_service::StoreCommentService;
    use crate::llm_client::{LlmClient, StubLlmClient};
    use crate::orchestrator::hybrid::NullEventSink;
    use crate::store::sqlite::SqliteStore;
    use crate::story_plugin::{PluginRegistry, TwinePlugin};
    use crate::types::{
        ActorType, Batch, BatchId, BatchStatus, CollaborationConfig, ExecutionMode, LlmConfig,
        PairingStrategyKind, Participant, ParticipantRole, ParticipantState, Phase, StudyConfig,
        StudyId,
    };

    #[tokio::test]
    async fn reports_completion_back_to_the_hybrid_barrier() {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory().unwrap());
        let broker: Arc<dyn Broker> = Arc::new(InMemoryBroker::new());
        let blob_store: Arc<dyn crate::blob_store::BlobStore> =
            Arc::new(LocalBlobStore::new(std::env::temp_dir().join("study-engine-test-hybrid-worker-blobs")));
        let agent_context = Arc::new(StoreAgentContextService::new(store.clone()));
        let comment_service = Arc::new(StoreCommentService::new(store.clone()));
        let mut registry = PluginRegistry::new();
        registry.register(Arc::new(TwinePlugin::new()));
        let llm_client: Arc<dyn LlmClient> = Arc::new(StubLlmClient::new());
        let collaborative = CollaborativeOrchestrator::new(
            store.clone(),
            blob_store,
            agent_context,
            comment_service,
            Arc::new(registry),
            llm_client,
        );
        let hybrid = HybridOrchestrator::new(store.clone(), broker.clone(), Arc::new(NullEventSink));

        let study = crate::types::Study {
            id: StudyId::new(),
            name: "s".to_string(),
            config: StudyConfig {
                execution_mode: ExecutionMode::Asynchronous,
                collaboration: Some(CollaborationConfig {
                    enabled: true,
                    pairing_method: PairingStrategyKind::HumanSynthetic,
                    rounds: 1,
                    phases_per_round: vec![Phase::Author],
                    feedback_required: false,
                    revision_required: false,
                }),
                human_role: Some("author".to_string()),
                max_play_actions: None,
                phase_time_limits: Default::default(),
                synthetic_partner: None,
                notifications: serde_json::Value::Null,
                extra: Default::default(),
            },
            created_at: chrono::Utc::now(),
        };
        store.create_study(study.clone()).await.unwrap();

        let batch = Batch {
            id: BatchId::new(),
            study_id: study.id,
            name: "b".to_string(),
            status: BatchStatus::Running,
            actors_created: 2,
            actors_completed: 0,
            export_path: None,
            started_at: None,
            completed_at: None,
            error: None,
        };
        let llm_config = LlmConfig { provider: "stub".to_string(), model: "stub".to_string(), temperature: None, max_tokens: None };
        let human = Participant {
            id: crate::types::ParticipantId::new(),
            batch_id: batch.id,
            study_id: study.id,
            condition_id: None,
            actor_type: ActorType::Human,
            state: ParticipantState::Active,
            role: ParticipantRole::Collaborative,
            llm_config: None,
            partner_id: None,
            pairing_metadata: None,
            unique_id: "h".to_string(),
            metadata: serde_json::Value::Null,
            availability: Vec::new(),
            created_at: chrono::Utc::now(),
            completed_at: None,
        };
        let mut synthetic = human.clone();
        synthetic.id = crate::types::ParticipantId::new();
        synthetic.actor_type = ActorType::Synthetic;
        synthetic.llm_config = Some(llm_config.clone());
        synthetic.unique_id = "s".to_string();
        store.create_batch_with_actors(batch, vec![human.clone(), synthetic.clone()]).await.unwrap();

        let state = hybrid.initialize_session(&study, human.id, synthetic.id, llm_config.clone()).await.unwrap();

        let payload = HybridSyntheticPhasePayload {
            session_id: state.session_id,
            synthetic_participant_id: synthetic.id,
            human_participant_id: human.id,
            phase: Phase::Author,
            round: 1,
            llm_config,
            response_delay_ms: Some(1),
        };
        run(&store, &collaborative, &hybrid, JobId::new(), payload).await.unwrap();

        let refreshed = store.get_hybrid_session(state.session_id).await.unwrap();
        let synthetic_entry = refreshed
            .completions
            .iter()
            .find(|c| c.participant_id == synthetic.id && c.round == 1 && c.phase == Phase::Author)
            .unwrap();
        assert_eq!(synthetic_entry.status, crate::types::PhaseCompletionStatus::Completed);
    }
}
