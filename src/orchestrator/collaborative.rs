//! Collaborative Orchestrator (§4.9) and story persistence (§4.10).
//!
//! `runSession` drives one paired batch through every round's
//! AUTHOR/PLAY/REVIEW phases synchronously: both partners execute a phase
//! concurrently (each only ever writes its own rows, so there's no shared
//! mutable state to race on), and the orchestrator waits for both before
//! advancing. Grounded on the teacher's `scheduler::mod::AgentScheduler`
//! dispatch loop, generalized from "one agent, one task" to "two agents,
//! one phase, run together".

use std::sync::Arc;

use crate::agent_context::AgentContextService;
use crate::comment_service::CommentService;
use crate::llm_client::{ActionRecord, LlmClient, RoleContext};
use crate::store::Store;
use crate::story_plugin::PluginRegistry;
use crate::types::{
    Comment, CommentId, CommentType, EngineError, FeedbackGivenEntry, FeedbackReceivedEntry,
    LearningEntry, OwnStoryDraft, ParticipantId, PartnerStoryPlayed, Phase, Study, StoryArtifact,
};

const STORY_BUCKET: &str = "stories";
const DEFAULT_MAX_PLAY_ACTIONS: u32 = 20;

pub struct CollaborativeOrchestrator {
    store: Arc<dyn Store>,
    blob_store: Arc<dyn crate::blob_store::BlobStore>,
    agent_context: Arc<dyn AgentContextService>,
    comment_service: Arc<dyn CommentService>,
    registry: Arc<PluginRegistry>,
    llm_client: Arc<dyn LlmClient>,
}

impl CollaborativeOrchestrator {
    pub fn new(
        store: Arc<dyn Store>,
        blob_store: Arc<dyn crate::blob_store::BlobStore>,
        agent_context: Arc<dyn AgentContextService>,
        comment_service: Arc<dyn CommentService>,
        registry: Arc<PluginRegistry>,
        llm_client: Arc<dyn LlmClient>,
    ) -> Self {
        Self { store, blob_store, agent_context, comment_service, registry, llm_client }
    }

    /// Reserve-upload-confirm (§4.10): the version counter and the
    /// `PENDING` row come from one transaction, the blob upload happens
    /// outside any transaction, and the `CONFIRMED` flip is a second,
    /// separate transaction. This trades the spec's literal "one
    /// transaction" wording for never holding a DB lock across a network
    /// call, while keeping the version-density guarantee (property 5) that
    /// wording exists to protect.
    pub async fn persist_story(
        &self,
        participant_id: ParticipantId,
        plugin_type: &str,
        round: u32,
        content: &[u8],
        name: &str,
        description: &str,
    ) -> Result<StoryArtifact, EngineError> {
        let reserved = self
            .store
            .reserve_story_version(participant_id, plugin_type, round, STORY_BUCKET)
            .await
            .map_err(EngineError::Storage)?;

        if let Err(e) = self.blob_store.put(&reserved.blob_key, &reserved.bucket, content.to_vec()).await {
            // The PENDING row is left as an orphan for a cleanup sweep;
            // returning here instead of confirming keeps it out of
            // `latest_story_artifact`, which only ever looks at CONFIRMED
            // rows.
            return Err(EngineError::Blob(e));
        }

        match self.store.confirm_story_artifact(reserved.id, name, description).await {
            Ok(artifact) => Ok(artifact),
            Err(source) => {
                let failure = crate::types::StoryPersistFailure { artifact_id: Some(reserved.id), source };
                tracing::error!(
                    artifact_id = ?failure.artifact_id,
                    error = %failure.source,
                    "story confirmed blob upload but the confirming write failed; blob is orphaned"
                );
                Err(EngineError::Storage(failure.source))
            }
        }
    }

    pub async fn run_session<F>(
        &self,
        study: &Study,
        a: ParticipantId,
        b: ParticipantId,
        on_progress: F,
    ) -> Result<(), EngineError>
    where
        F: Fn(u8) + Send + Sync,
    {
        let collab = study
            .config
            .collaboration
            .clone()
            .ok_or_else(|| EngineError::Validation("study has no collaboration config".to_string()))?;

        for round in 1..=collab.rounds {
            for &phase in &collab.phases_per_round {
                let (ra, rb) = tokio::join!(
                    self.execute_phase(a, b, phase, round, study),
                    self.execute_phase(b, a, phase, round, study),
                );
                if let Err(e) = &ra {
                    tracing::error!(participant_id = %a, partner_id = %b, ?phase, round, error = %e, "collaborative phase failed for one side; partner's side is kept");
                }
                if let Err(e) = &rb {
                    tracing::error!(participant_id = %b, partner_id = %a, ?phase, round, error = %e, "collaborative phase failed for one side; partner's side is kept");
                }
                // A single side's failure never discards the other side's
                // already-persisted work (draft, play, comment) for this
                // phase; only give up on the session when neither side made
                // it through, since there's nothing left to build on.
                if ra.is_err() && rb.is_err() {
                    return ra.and(rb);
                }
            }
            on_progress(((round as f64 / collab.rounds as f64) * 100.0).round() as u8);
        }
        Ok(())
    }

    /// Runs one participant's side of one phase, for callers that don't run
    /// the whole paired session themselves (the hybrid synthetic-phase
    /// worker, §4.13, runs only the synthetic participant's side).
    pub async fn run_phase_for(
        &self,
        participant_id: ParticipantId,
        partner_id: ParticipantId,
        phase: Phase,
        round: u32,
        study: &Study,
    ) -> Result<serde_json::Value, EngineError> {
        self.execute_phase(participant_id, partner_id, phase, round, study).await?;
        Ok(serde_json::json!({ "participantId": participant_id, "phase": phase, "round": round }))
    }

    async fn execute_phase(
        &self,
        participant_id: ParticipantId,
        partner_id: ParticipantId,
        phase: Phase,
        round: u32,
        study: &Study,
    ) -> Result<(), EngineError> {
        self.agent_context
            .update_phase(participant_id, phase)
            .await
            .map_err(EngineError::Context)?;
        match phase {
            Phase::Author => self.run_author(participant_id, round).await,
            Phase::Play => self.run_play(participant_id, partner_id, round, study).await,
            Phase::Review => self.run_review(participant_id, partner_id, round).await,
        }
    }

    async fn llm_config_for(&self, participant_id: ParticipantId) -> Result<crate::types::LlmConfig, EngineError> {
        let participant = self.store.get_participant(participant_id).await.map_err(EngineError::Storage)?;
        participant
            .llm_config
            .ok_or_else(|| EngineError::Validation(format!("participant {participant_id} has no llm config")))
    }

    async fn run_author(&self, participant_id: ParticipantId, round: u32) -> Result<(), EngineError> {
        let llm_config = self.llm_config_for(participant_id).await?;
        let context = RoleContext {
            role_prompt: "Write a short branching story as a sequence of passages with choices.".to_string(),
            story_state: serde_json::Value::Null,
            available_actions: vec!["author_story".to_string()],
            history: Vec::new(),
        };
        let action = self.llm_client.generate(&context, &llm_config).await.map_err(EngineError::Llm)?;
        let passages = if action.arguments.is_null() {
            serde_json::json!([{ "text": "Once upon a time.", "choices": [] }])
        } else {
            action.arguments.clone()
        };
        let content = serde_json::to_vec(&passages)
            .map_err(|e| EngineError::Internal(format!("story serialization failed: {e}")))?;

        let artifact = self
            .persist_story(participant_id, "twine", round, &content, "Authored story", "Generated in the AUTHOR phase")
            .await?;

        self.agent_context
            .append_own_draft(
                participant_id,
                OwnStoryDraft { round, story_artifact_id: artifact.id, story_summary: action.rationale.clone() },
            )
            .await
            .map_err(EngineError::Context)?;
        Ok(())
    }

    async fn run_play(
        &self,
        participant_id: ParticipantId,
        partner_id: ParticipantId,
        round: u32,
        study: &Study,
    ) -> Result<(), EngineError> {
        let partner_story = self
            .store
            .latest_story_artifact(partner_id, "twine", Some(round))
            .await
            .map_err(EngineError::Storage)?
            .ok_or_else(|| EngineError::NotFound(format!("no confirmed story for partner {partner_id} in round {round}")))?;

        let content = self
            .blob_store
            .get(&partner_story.blob_key, &partner_story.bucket)
            .await
            .map_err(EngineError::Blob)?;
        let story_content: serde_json::Value = serde_json::from_slice(&content)
            .map_err(|e| EngineError::Validation(format!("malformed story content: {e}")))?;

        let plugin = self.registry.get("twine").map_err(EngineError::Plugin)?;
        let session_id = plugin.init_headless(story_content).await.map_err(EngineError::Plugin)?;
        let llm_config = self.llm_config_for(participant_id).await?;

        let max_actions = study.config.max_play_actions.unwrap_or(DEFAULT_MAX_PLAY_ACTIONS);
        let mut choices_made = Vec::new();
        let mut history: Vec<ActionRecord> = Vec::new();
        let mut executed = 0u32;
        while !plugin.is_complete(&session_id).await.map_err(EngineError::Plugin)? && executed < max_actions {
            let story_state = plugin.get_state(&session_id).await.map_err(EngineError::Plugin)?;
            let available_actions = plugin.get_available_actions(&session_id).await.map_err(EngineError::Plugin)?;
            if available_actions.is_empty() {
                break;
            }
            let context = RoleContext {
                role_prompt: "Play through your partner's story, making a choice at each passage.".to_string(),
                story_state,
                available_actions,
                history: history.clone(),
            };
            let action = self.llm_client.generate(&context, &llm_config).await.map_err(EngineError::Llm)?;
            plugin.execute_headless(&session_id, &action.name).await.map_err(EngineError::Plugin)?;
            choices_made.push(action.name.clone());
            history.push(ActionRecord { action: action.name, result_summary: None });
            executed += 1;
        }
        plugin.destroy(&session_id).await.map_err(EngineError::Plugin)?;

        self.agent_context
            .append_partner_story_played(
                participant_id,
                PartnerStoryPlayed {
                    round,
                    story_artifact_id: partner_story.id,
                    play_notes: format!("made {} choices", choices_made.len()),
                    choices_made,
                    observations: Vec::new(),
                    overall_impression: None,
                },
            )
            .await
            .map_err(EngineError::Context)?;
        Ok(())
    }

    async fn run_review(
        &self,
        participant_id: ParticipantId,
        partner_id: ParticipantId,
        round: u32,
    ) -> Result<(), EngineError> {
        let partner_story = self
            .store
            .latest_story_artifact(partner_id, "twine", Some(round))
            .await
            .map_err(EngineError::Storage)?;
        let llm_config = self.llm_config_for(participant_id).await?;
        let context = RoleContext {
            role_prompt: "Review your partner's story: list its strengths, its improvements, an overall assessment, and one or more comments each tagged PRAISE, SUGGESTION, CRITIQUE, or QUESTION.".to_string(),
            story_state: serde_json::Value::Null,
            available_actions: vec!["submit_feedback".to_string()],
            history: Vec::new(),
        };
        let action = self.llm_client.generate(&context, &llm_config).await.map_err(EngineError::Llm)?;

        let strengths: Vec<String> = action.arguments["strengths"]
            .as_array()
            .map(|values| values.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
            .unwrap_or_default();

        // Older single-comment payloads (`{type, content}`) still produce
        // one comment; `comments: [...]` is the richer SUBMIT_FEEDBACK shape.
        let raw_comments = action.arguments["comments"].as_array().cloned().unwrap_or_else(|| {
            vec![serde_json::json!({
                "content": action.arguments["content"].as_str().unwrap_or("No specific feedback."),
                "type": action.arguments["type"].as_str().unwrap_or("FEEDBACK"),
            })]
        });

        for raw_comment in &raw_comments {
            let comment_type = raw_comment["type"]
                .as_str()
                .map(CommentType::parse_or_feedback)
                .unwrap_or(CommentType::Feedback);
            let content = raw_comment["content"]
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| "No specific feedback.".to_string());
            let passage_id = raw_comment["passageId"].as_str().map(str::to_string);

            let comment = self
                .comment_service
                .create(Comment {
                    id: CommentId::new(),
                    author_id: participant_id,
                    target_participant_id: partner_id,
                    story_artifact_id: partner_story.as_ref().map(|a| a.id),
                    passage_id,
                    content,
                    comment_type,
                    round,
                    phase: Phase::Review,
                    parent_id: None,
                    resolved: false,
                    addressed_in_round: None,
                    created_at: chrono::Utc::now(),
                })
                .await
                .map_err(EngineError::Comment)?;

            self.agent_context
                .append_feedback_given(participant_id, FeedbackGivenEntry { round, comment_id: comment.id, target_participant_id: partner_id })
                .await
                .map_err(EngineError::Context)?;
            self.agent_context
                .append_feedback_received(partner_id, FeedbackReceivedEntry { round, comment_id: comment.id, author_id: participant_id })
                .await
                .map_err(EngineError::Context)?;
        }

        if !strengths.is_empty() {
            self.agent_context
                .append_learning(
                    partner_id,
                    LearningEntry { round, tag: "storytelling".to_string(), content: strengths.join("; ") },
                )
                .await
                .map_err(EngineError::Context)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_context::StoreAgentContextService;
    use crate::blob_store::LocalBlobStore;
    use crate::comment_service::StoreCommentService;
    use crate::llm_client::{Action, StubLlmClient};
    use crate::store::sqlite::SqliteStore;
    use crate::story_plugin::TwinePlugin;
    use crate::types::{
        ActorType, Batch, BatchId, BatchStatus, CollaborationConfig, ExecutionMode, LlmConfig,
        PairingStrategyKind, Participant, ParticipantRole, ParticipantState, StudyConfig, StudyId,
    };
    use async_trait::async_trait;

    /// Always authors a two-passage story, then plays/reviews deterministically.
    struct ScriptedLlmClient;

    #[async_trait]
    impl LlmClient for ScriptedLlmClient {
        async fn generate(&self, context: &RoleContext, _config: &LlmConfig) -> Result<Action, crate::types::LlmError> {
            if context.available_actions.contains(&"author_story".to_string()) {
                return Ok(Action {
                    name: "author_story".to_string(),
                    arguments: serde_json::json!([
                        {"text": "start", "choices": ["go"]},
                        {"text": "end", "choices": []},
                    ]),
                    rationale: Some("a tale".to_string()),
                });
            }
            if context.available_actions.contains(&"comment".to_string()) {
                return Ok(Action {
                    name: "comment".to_string(),
                    arguments: serde_json::json!({ "type": "PRAISE", "content": "Loved it." }),
                    rationale: None,
                });
            }
            Ok(Action {
                name: context.available_actions.first().cloned().unwrap_or_else(|| "wait".to_string()),
                arguments: serde_json::Value::Null,
                rationale: None,
            })
        }

        fn is_configured(&self) -> bool {
            true
        }
    }

    async fn setup() -> (CollaborativeOrchestrator, Study, ParticipantId, ParticipantId) {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory().unwrap());
        let blob_store: Arc<dyn crate::blob_store::BlobStore> =
            Arc::new(LocalBlobStore::new(std::env::temp_dir().join("study-engine-test-collab-blobs")));
        let agent_context = Arc::new(StoreAgentContextService::new(store.clone()));
        let comment_service = Arc::new(StoreCommentService::new(store.clone()));
        let mut registry = PluginRegistry::new();
        registry.register(Arc::new(TwinePlugin::new()));
        let llm_client: Arc<dyn LlmClient> = Arc::new(ScriptedLlmClient);

        let orchestrator = CollaborativeOrchestrator::new(
            store.clone(),
            blob_store,
            agent_context,
            comment_service,
            Arc::new(registry),
            llm_client,
        );

        let study = Study {
            id: StudyId::new(),
            name: "s".to_string(),
            config: StudyConfig {
                execution_mode: ExecutionMode::Synchronous,
                collaboration: Some(CollaborationConfig {
                    enabled: true,
                    pairing_method: PairingStrategyKind::Auto,
                    rounds: 1,
                    phases_per_round: vec![Phase::Author, Phase::Play, Phase::Review],
                    feedback_required: true,
                    revision_required: false,
                }),
                human_role: None,
                max_play_actions: Some(5),
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
        let a = Participant {
            id: ParticipantId::new(),
            batch_id: batch.id,
            study_id: study.id,
            condition_id: None,
            actor_type: ActorType::Synthetic,
            state: ParticipantState::Active,
            role: ParticipantRole::Collaborative,
            llm_config: Some(llm_config.clone()),
            partner_id: None,
            pairing_metadata: None,
            unique_id: "a".to_string(),
            metadata: serde_json::Value::Null,
            availability: Vec::new(),
            created_at: chrono::Utc::now(),
            completed_at: None,
        };
        let mut b = a.clone();
        b.id = ParticipantId::new();
        b.unique_id = "b".to_string();
        store.create_batch_with_actors(batch, vec![a.clone(), b.clone()]).await.unwrap();

        (orchestrator, study, a.id, b.id)
    }

    #[tokio::test]
    async fn run_session_produces_stories_plays_and_feedback_both_ways() {
        let (orchestrator, study, a, b) = setup().await;
        orchestrator.run_session(&study, a, b, |_| {}).await.unwrap();

        let story_a = orchestrator.store.latest_story_artifact(a, "twine", Some(1)).await.unwrap();
        let story_b = orchestrator.store.latest_story_artifact(b, "twine", Some(1)).await.unwrap();
        assert!(story_a.is_some());
        assert!(story_b.is_some());

        let received_a = orchestrator.comment_service.list_received(a).await.unwrap();
        let received_b = orchestrator.comment_service.list_received(b).await.unwrap();
        assert_eq!(received_a.len(), 1);
        assert_eq!(received_b.len(), 1);

        let ctx_a = orchestrator.agent_context.get_or_create(a).await.unwrap();
        assert_eq!(ctx_a.own_story_drafts.len(), 1);
        assert_eq!(ctx_a.partner_stories_played.len(), 1);
    }

    #[tokio::test]
    async fn persist_story_is_dense_under_repeated_calls() {
        let (orchestrator, _study, a, _b) = setup().await;
        let first = orchestrator.persist_story(a, "twine", 1, b"[]", "n", "d").await.unwrap();
        let second = orchestrator.persist_story(a, "twine", 1, b"[]", "n", "d").await.unwrap();
        assert_eq!(first.version + 1, second.version);
    }
}
