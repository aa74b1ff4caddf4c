//! Hybrid Orchestrator (§4.12).
//!
//! Where [`collaborative::CollaborativeOrchestrator`] drives both sides of
//! a pair itself, the hybrid case has one human participant driven by an
//! external client and one synthetic participant driven by the queue
//! (§4.13's worker). So this orchestrator never runs a phase directly — it
//! only tracks a [`PhaseCompletion`] barrier per participant and fires the
//! next step once both sides of the current `(round, phase)` report in.
//! Mirrors the teacher's event-emitter pattern for long-running sandbox
//! sessions, generalized from one subject to two.

use std::sync::Arc;

use async_trait::async_trait;

use crate::broker::{queue_names, Broker};
use crate::store::Store;
use crate::types::{
    CollaborationConfig, EngineError, HybridSessionState, HybridSyntheticPhasePayload, Phase,
    PhaseCompletion, PhaseCompletionStatus, ParticipantId, SessionId, Study,
};

/// The four events the spec names (§6): `phase:ready`, `phase:complete`,
/// `session:complete`, `error`.
#[derive(Debug, Clone)]
pub enum HybridEvent {
    PhaseReady { session_id: SessionId, round: u32, phase: Phase, waiting_on: ParticipantId },
    PhaseComplete { session_id: SessionId, round: u32, phase: Phase },
    SessionComplete { session_id: SessionId },
    Error { session_id: SessionId, message: String },
}

#[async_trait]
pub trait HybridEventSink: Send + Sync {
    async fn emit(&self, event: HybridEvent);
}

/// Test/no-op sink; a real deployment wires this to SSE/websocket fanout.
pub struct NullEventSink;

#[async_trait]
impl HybridEventSink for NullEventSink {
    async fn emit(&self, _event: HybridEvent) {}
}

pub struct HybridOrchestrator {
    store: Arc<dyn Store>,
    broker: Arc<dyn Broker>,
    sink: Arc<dyn HybridEventSink>,
}

impl HybridOrchestrator {
    pub fn new(store: Arc<dyn Store>, broker: Arc<dyn Broker>, sink: Arc<dyn HybridEventSink>) -> Self {
        Self { store, broker, sink }
    }

    fn phase_sequence(collab: &CollaborationConfig) -> Vec<(u32, Phase)> {
        (1..=collab.rounds)
            .flat_map(|round| collab.phases_per_round.iter().map(move |&phase| (round, phase)))
            .collect()
    }

    /// Creates the session row with both participants' first `(round,
    /// phase)` completion pending, and kicks off whichever side(s) don't
    /// need a human to act.
    pub async fn initialize_session(
        &self,
        study: &Study,
        human_participant_id: ParticipantId,
        synthetic_participant_id: ParticipantId,
        llm_config: crate::types::LlmConfig,
    ) -> Result<HybridSessionState, EngineError> {
        let collab = study
            .config
            .collaboration
            .clone()
            .ok_or_else(|| EngineError::Validation("study has no collaboration config".to_string()))?;
        let sequence = Self::phase_sequence(&collab);
        let (round, phase) = *sequence
            .first()
            .ok_or_else(|| EngineError::Validation("collaboration config has no phases".to_string()))?;

        let state = HybridSessionState {
            session_id: SessionId::new(),
            study_id: study.id,
            participant_a: human_participant_id,
            participant_b: synthetic_participant_id,
            config: study.config.clone(),
            completions: vec![
                pending_completion(human_participant_id, synthetic_participant_id, round, phase),
                pending_completion(synthetic_participant_id, human_participant_id, round, phase),
            ],
            started_at: chrono::Utc::now(),
            completed_at: None,
        };
        self.store.create_hybrid_session(state.clone()).await.map_err(EngineError::Storage)?;

        self.dispatch_phase(&state, round, phase, human_participant_id, synthetic_participant_id, &llm_config)
            .await?;
        Ok(state)
    }

    /// Records `participant_id`'s outcome for `(round, phase)`; idempotent —
    /// calling again for an already-`Completed` entry is a no-op rather than
    /// re-firing the advance logic (§4.12 "no double advance" invariant).
    pub async fn on_phase_complete(
        &self,
        session_id: SessionId,
        participant_id: ParticipantId,
        round: u32,
        phase: Phase,
        result: serde_json::Value,
        llm_config: &crate::types::LlmConfig,
    ) -> Result<HybridSessionState, EngineError> {
        let mut state = self.store.get_hybrid_session(session_id).await.map_err(EngineError::Storage)?;

        let Some(entry) = state
            .completions
            .iter_mut()
            .find(|c| c.participant_id == participant_id && c.round == round && c.phase == phase)
        else {
            return Err(EngineError::NotFound(format!(
                "no pending completion for participant {participant_id} at round {round}, phase {phase:?}"
            )));
        };
        if entry.status == PhaseCompletionStatus::Completed {
            return Ok(state);
        }
        entry.status = PhaseCompletionStatus::Completed;
        entry.completed_at = Some(chrono::Utc::now());
        entry.result = Some(result);

        let both_done = state
            .completions
            .iter()
            .filter(|c| c.round == round && c.phase == phase)
            .all(|c| c.status == PhaseCompletionStatus::Completed);

        if !both_done {
            self.store.save_hybrid_session(state.clone()).await.map_err(EngineError::Storage)?;
            return Ok(state);
        }

        self.sink.emit(HybridEvent::PhaseComplete { session_id, round, phase }).await;

        let collab = state
            .config
            .collaboration
            .clone()
            .ok_or_else(|| EngineError::Validation("session has no collaboration config".to_string()))?;
        let sequence = Self::phase_sequence(&collab);
        let position = sequence.iter().position(|&(r, p)| r == round && p == phase);
        let next = position.and_then(|i| sequence.get(i + 1)).copied();

        let human = state.participant_a;
        let synthetic = state.participant_b;
        match next {
            Some((next_round, next_phase)) => {
                state.completions.push(pending_completion(human, synthetic, next_round, next_phase));
                state.completions.push(pending_completion(synthetic, human, next_round, next_phase));
                self.store.save_hybrid_session(state.clone()).await.map_err(EngineError::Storage)?;
                self.dispatch_phase(&state, next_round, next_phase, human, synthetic, llm_config).await?;
            }
            None => {
                state.completed_at = Some(chrono::Utc::now());
                self.store.save_hybrid_session(state.clone()).await.map_err(EngineError::Storage)?;
                self.sink.emit(HybridEvent::SessionComplete { session_id }).await;
            }
        }
        Ok(state)
    }

    /// Emits `phase:ready` for the human side and enqueues the synthetic
    /// worker's job for the synthetic side (§4.13); never runs either side
    /// directly.
    async fn dispatch_phase(
        &self,
        state: &HybridSessionState,
        round: u32,
        phase: Phase,
        human_participant_id: ParticipantId,
        synthetic_participant_id: ParticipantId,
        llm_config: &crate::types::LlmConfig,
    ) -> Result<(), EngineError> {
        self.sink
            .emit(HybridEvent::PhaseReady { session_id: state.session_id, round, phase, waiting_on: human_participant_id })
            .await;

        let payload = HybridSyntheticPhasePayload {
            session_id: state.session_id,
            synthetic_participant_id,
            human_participant_id,
            phase,
            round,
            llm_config: llm_config.clone(),
            response_delay_ms: None,
        };
        self.broker
            .enqueue(
                queue_names::HYBRID_SESSION_SYNTHETIC_PHASE,
                serde_json::json!(payload),
                None,
                None,
            )
            .await
            .map_err(EngineError::Broker)?;
        Ok(())
    }
}

fn pending_completion(participant_id: ParticipantId, partner_id: ParticipantId, round: u32, phase: Phase) -> PhaseCompletion {
    PhaseCompletion {
        participant_id,
        partner_id,
        round,
        phase,
        status: PhaseCompletionStatus::Pending,
        started_at: Some(chrono::Utc::now()),
        completed_at: None,
        result: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::InMemoryBroker;
    use crate::store::sqlite::SqliteStore;
    use crate::types::{
        ActorType, Batch, BatchId, BatchStatus, CollaborationConfig, ExecutionMode, LlmConfig,
        PairingStrategyKind, Participant, ParticipantRole, ParticipantState, StudyConfig, StudyId,
    };

    async fn setup() -> (HybridOrchestrator, Study, ParticipantId, ParticipantId, LlmConfig) {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory().unwrap());
        let broker: Arc<dyn Broker> = Arc::new(InMemoryBroker::new());
        let orchestrator = HybridOrchestrator::new(store.clone(), broker.clone(), Arc::new(NullEventSink));

        let study = Study {
            id: StudyId::new(),
            name: "s".to_string(),
            config: StudyConfig {
                execution_mode: ExecutionMode::Asynchronous,
                collaboration: Some(CollaborationConfig {
                    enabled: true,
                    pairing_method: PairingStrategyKind::HumanSynthetic,
                    rounds: 1,
                    phases_per_round: vec![Phase::Author, Phase::Play],
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
        let human = Participant {
            id: ParticipantId::new(),
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
        synthetic.id = ParticipantId::new();
        synthetic.actor_type = ActorType::Synthetic;
        synthetic.unique_id = "s".to_string();
        store.create_batch_with_actors(batch, vec![human.clone(), synthetic.clone()]).await.unwrap();

        let llm_config = LlmConfig { provider: "stub".to_string(), model: "stub".to_string(), temperature: None, max_tokens: None };
        (orchestrator, study, human.id, synthetic.id, llm_config)
    }

    #[tokio::test]
    async fn advances_to_next_phase_only_once_both_sides_complete() {
        let (orchestrator, study, human, synthetic, llm_config) = setup().await;
        let state = orchestrator.initialize_session(&study, human, synthetic, llm_config.clone()).await.unwrap();
        let session_id = state.session_id;

        orchestrator
            .on_phase_complete(session_id, human, 1, Phase::Author, serde_json::json!({}), &llm_config)
            .await
            .unwrap();
        let mid = orchestrator.store.get_hybrid_session(session_id).await.unwrap();
        assert!(mid.completions.iter().all(|c| c.round != 1 || c.phase != Phase::Play));

        let after_both = orchestrator
            .on_phase_complete(session_id, synthetic, 1, Phase::Author, serde_json::json!({}), &llm_config)
            .await
            .unwrap();
        assert!(after_both.completions.iter().any(|c| c.round == 1 && c.phase == Phase::Play));
    }

    #[tokio::test]
    async fn completing_an_already_completed_phase_is_a_noop() {
        let (orchestrator, study, human, synthetic, llm_config) = setup().await;
        let state = orchestrator.initialize_session(&study, human, synthetic, llm_config.clone()).await.unwrap();
        let session_id = state.session_id;

        orchestrator
            .on_phase_complete(session_id, human, 1, Phase::Author, serde_json::json!({}), &llm_config)
            .await
            .unwrap();
        let repeated = orchestrator
            .on_phase_complete(session_id, human, 1, Phase::Author, serde_json::json!({"x": 1}), &llm_config)
            .await
            .unwrap();
        let entry = repeated
            .completions
            .iter()
            .find(|c| c.participant_id == human && c.round == 1 && c.phase == Phase::Author)
            .unwrap();
        assert_eq!(entry.result, Some(serde_json::json!({})));
    }

    #[tokio::test]
    async fn session_completes_after_last_phase_of_last_round() {
        let (orchestrator, study, human, synthetic, llm_config) = setup().await;
        let state = orchestrator.initialize_session(&study, human, synthetic, llm_config.clone()).await.unwrap();
        let session_id = state.session_id;

        for phase in [Phase::Author, Phase::Play] {
            orchestrator.on_phase_complete(session_id, human, 1, phase, serde_json::json!({}), &llm_config).await.unwrap();
            orchestrator.on_phase_complete(session_id, synthetic, 1, phase, serde_json::json!({}), &llm_config).await.unwrap();
        }
        let finished = orchestrator.store.get_hybrid_session(session_id).await.unwrap();
        assert!(finished.completed_at.is_some());
    }
}
