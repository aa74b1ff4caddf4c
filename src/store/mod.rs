//! Transactional persistent store (§4.3).
//!
//! One trait fronts every subsystem that needs durable, serializable
//! read-modify-write: studies/batches/participants/events/story artifacts
//! live here directly; [`crate::agent_context`], [`crate::comment_service`],
//! and [`crate::pairing`] are thin service wrappers over the same trait so
//! their atomicity guarantees (§4.4, §4.5, §4.6) come from a single
//! underlying transaction rather than two round trips racing each other.

pub mod sqlite;

use async_trait::async_trait;

use crate::types::{
    AgentContext, Batch, BatchId, Comment, CommentId, Event, EventType, HybridSessionState,
    LearningEntry, OwnStoryDraft, PairingMetadata, PartnerStoryPlayed, Participant, ParticipantId,
    ParticipantState, Phase, SessionId, FeedbackGivenEntry, FeedbackReceivedEntry, Study, StudyId,
    StoreError, StoryArtifact, StoryArtifactId,
};

#[async_trait]
pub trait Store: Send + Sync {
    // -- Study -------------------------------------------------------
    async fn create_study(&self, study: Study) -> Result<Study, StoreError>;
    async fn get_study(&self, id: StudyId) -> Result<Study, StoreError>;

    /// Refuses if any participant of the study is in
    /// `{ACTIVE, SCHEDULED, CONFIRMED, CHECKED_IN}`; otherwise deletes
    /// events, story artifacts, comments, agent contexts, participants,
    /// batches, then the study, in that order (§4.3).
    async fn delete_study_with_relations(&self, id: StudyId) -> Result<(), StoreError>;

    // -- Batch ---------------------------------------------------------
    /// One transaction: create the batch row, create the N participant
    /// rows, set `actorsCreated = N` (§4.3, §4.7).
    async fn create_batch_with_actors(
        &self,
        batch: Batch,
        participants: Vec<Participant>,
    ) -> Result<(), StoreError>;

    /// Appends participant rows to an already-existing batch, one
    /// transaction per call. Used by the batch creation workers (§4.7) to
    /// chunk inserts for a batch whose row was created upfront, unlike
    /// [`Store::create_batch_with_actors`] which creates both at once.
    async fn insert_participants(&self, participants: Vec<Participant>) -> Result<(), StoreError>;

    async fn get_batch(&self, id: BatchId) -> Result<Batch, StoreError>;
    async fn update_batch(&self, batch: Batch) -> Result<(), StoreError>;
    async fn list_participants_by_batch(&self, batch_id: BatchId) -> Result<Vec<Participant>, StoreError>;

    // -- Participant -----------------------------------------------------
    async fn get_participant(&self, id: ParticipantId) -> Result<Participant, StoreError>;
    async fn update_participant(&self, participant: Participant) -> Result<(), StoreError>;

    /// Inside one transaction: read the previous state, write the new
    /// state, and append a `state_change` event carrying
    /// `{previousState, newState, ...}` (§4.3).
    async fn update_participant_with_event(
        &self,
        id: ParticipantId,
        new_state: ParticipantState,
        event_data: serde_json::Value,
    ) -> Result<Event, StoreError>;

    /// Locks both rows (conceptually `SELECT ... FOR UPDATE`; SQLite gets
    /// this for free from an `IMMEDIATE` transaction) and sets `partnerId`
    /// on both symmetrically, inside one transaction (§4.6, §5).
    async fn pair_participants(
        &self,
        a: ParticipantId,
        b: ParticipantId,
        metadata: PairingMetadata,
    ) -> Result<(), StoreError>;

    /// Clears `partnerId` on both rows symmetrically, inside one transaction.
    async fn unpair_participant(&self, participant_id: ParticipantId) -> Result<(), StoreError>;

    // -- Event -----------------------------------------------------------
    async fn append_event(&self, event: Event) -> Result<(), StoreError>;
    async fn list_events_by_participant(&self, participant_id: ParticipantId) -> Result<Vec<Event>, StoreError>;
    async fn list_events_by_batch(
        &self,
        batch_id: BatchId,
        event_types: Option<&[EventType]>,
    ) -> Result<Vec<Event>, StoreError>;

    // -- Story artifact ----------------------------------------------------
    /// `version <- max(version for (participantId, pluginType)) + 1`,
    /// inserted as `PENDING` with a generated `blobKey`, inside one
    /// transaction so density holds under concurrent saves (§4.10, property
    /// 5). The caller uploads the blob to `blob_key`, then calls
    /// [`Store::confirm_story_artifact`].
    async fn reserve_story_version(
        &self,
        participant_id: ParticipantId,
        plugin_type: &str,
        round: u32,
        bucket: &str,
    ) -> Result<StoryArtifact, StoreError>;

    async fn confirm_story_artifact(
        &self,
        id: StoryArtifactId,
        name: &str,
        description: &str,
    ) -> Result<StoryArtifact, StoreError>;

    async fn delete_story_artifact(&self, id: StoryArtifactId) -> Result<(), StoreError>;
    async fn get_story_artifact(&self, id: StoryArtifactId) -> Result<StoryArtifact, StoreError>;

    /// Latest confirmed artifact for a `(participantId, pluginType)`,
    /// optionally filtered to one round; used by the PLAY phase to find the
    /// partner's story for the current round (§4.9).
    async fn latest_story_artifact(
        &self,
        participant_id: ParticipantId,
        plugin_type: &str,
        round: Option<u32>,
    ) -> Result<Option<StoryArtifact>, StoreError>;

    async fn list_story_artifacts_by_batch(&self, batch_id: BatchId) -> Result<Vec<StoryArtifact>, StoreError>;

    // -- Agent Context (§4.4) --------------------------------------------
    async fn get_or_create_agent_context(&self, participant_id: ParticipantId) -> Result<AgentContext, StoreError>;
    async fn update_agent_phase(&self, participant_id: ParticipantId, phase: Phase) -> Result<AgentContext, StoreError>;
    async fn advance_agent_round(&self, participant_id: ParticipantId) -> Result<AgentContext, StoreError>;
    async fn append_own_draft(&self, participant_id: ParticipantId, entry: OwnStoryDraft) -> Result<AgentContext, StoreError>;
    async fn append_partner_story_played(&self, participant_id: ParticipantId, entry: PartnerStoryPlayed) -> Result<AgentContext, StoreError>;
    async fn append_feedback_given(&self, participant_id: ParticipantId, entry: FeedbackGivenEntry) -> Result<AgentContext, StoreError>;
    async fn append_feedback_received(&self, participant_id: ParticipantId, entry: FeedbackReceivedEntry) -> Result<AgentContext, StoreError>;
    async fn append_learning(&self, participant_id: ParticipantId, entry: LearningEntry) -> Result<AgentContext, StoreError>;

    // -- Comment (§4.5) ---------------------------------------------------
    async fn create_comment(&self, comment: Comment) -> Result<Comment, StoreError>;
    async fn get_comment(&self, id: CommentId) -> Result<Comment, StoreError>;
    async fn list_comments_received(&self, participant_id: ParticipantId) -> Result<Vec<Comment>, StoreError>;
    async fn list_comments_authored(&self, participant_id: ParticipantId) -> Result<Vec<Comment>, StoreError>;
    async fn list_comments_by_story(&self, story_artifact_id: StoryArtifactId) -> Result<Vec<Comment>, StoreError>;
    async fn list_comments_for_round_phase(
        &self,
        target_participant_id: ParticipantId,
        round: u32,
        phase: Phase,
    ) -> Result<Vec<Comment>, StoreError>;
    async fn list_replies(&self, parent_id: CommentId) -> Result<Vec<Comment>, StoreError>;
    async fn resolve_comment(&self, id: CommentId, addressed_in_round: u32) -> Result<Comment, StoreError>;
    async fn unresolve_comment(&self, id: CommentId) -> Result<Comment, StoreError>;
    async fn update_comment_content(&self, id: CommentId, content: &str) -> Result<Comment, StoreError>;
    /// Deletes `id` and its direct replies (one level, per §3).
    async fn delete_comment_cascade_one_level(&self, id: CommentId) -> Result<(), StoreError>;

    // -- Hybrid session state (§4.12) ------------------------------------
    async fn create_hybrid_session(&self, state: HybridSessionState) -> Result<(), StoreError>;
    async fn get_hybrid_session(&self, id: SessionId) -> Result<HybridSessionState, StoreError>;
    async fn save_hybrid_session(&self, state: HybridSessionState) -> Result<(), StoreError>;
}
