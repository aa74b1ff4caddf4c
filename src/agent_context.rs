//! Agent Context Service (§4.4).
//!
//! A thin trait over [`Store`]'s agent-context operations — mirrors the
//! teacher's `context::manager::ContextManager`, which is likewise a
//! service-shaped wrapper around a persistence backend rather than holding
//! state itself. The append/update operations are atomic because each one
//! maps to a single `Store` method that does its read-modify-write inside
//! one transaction (§4.4, property 1); this trait never does two separate
//! store calls for what should be one update.

use async_trait::async_trait;
use std::sync::Arc;

use crate::store::Store;
use crate::types::{
    AgentContext, ContextError, FeedbackGivenEntry, FeedbackReceivedEntry, LearningEntry,
    OwnStoryDraft, ParticipantId, PartnerStoryPlayed, Phase,
};

#[async_trait]
pub trait AgentContextService: Send + Sync {
    async fn get_or_create(&self, participant_id: ParticipantId) -> Result<AgentContext, ContextError>;
    async fn update_phase(&self, participant_id: ParticipantId, phase: Phase) -> Result<AgentContext, ContextError>;
    async fn advance_round(&self, participant_id: ParticipantId) -> Result<AgentContext, ContextError>;
    async fn append_own_draft(&self, participant_id: ParticipantId, entry: OwnStoryDraft) -> Result<AgentContext, ContextError>;
    async fn append_partner_story_played(&self, participant_id: ParticipantId, entry: PartnerStoryPlayed) -> Result<AgentContext, ContextError>;
    async fn append_feedback_given(&self, participant_id: ParticipantId, entry: FeedbackGivenEntry) -> Result<AgentContext, ContextError>;
    async fn append_feedback_received(&self, participant_id: ParticipantId, entry: FeedbackReceivedEntry) -> Result<AgentContext, ContextError>;
    async fn append_learning(&self, participant_id: ParticipantId, entry: LearningEntry) -> Result<AgentContext, ContextError>;
}

pub struct StoreAgentContextService {
    store: Arc<dyn Store>,
}

impl StoreAgentContextService {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }
}

fn store_err(e: crate::types::StoreError) -> ContextError {
    ContextError::Store(e.to_string())
}

#[async_trait]
impl AgentContextService for StoreAgentContextService {
    async fn get_or_create(&self, participant_id: ParticipantId) -> Result<AgentContext, ContextError> {
        self.store.get_or_create_agent_context(participant_id).await.map_err(store_err)
    }

    async fn update_phase(&self, participant_id: ParticipantId, phase: Phase) -> Result<AgentContext, ContextError> {
        self.store.update_agent_phase(participant_id, phase).await.map_err(store_err)
    }

    async fn advance_round(&self, participant_id: ParticipantId) -> Result<AgentContext, ContextError> {
        self.store.advance_agent_round(participant_id).await.map_err(store_err)
    }

    async fn append_own_draft(&self, participant_id: ParticipantId, entry: OwnStoryDraft) -> Result<AgentContext, ContextError> {
        self.store.append_own_draft(participant_id, entry).await.map_err(store_err)
    }

    async fn append_partner_story_played(&self, participant_id: ParticipantId, entry: PartnerStoryPlayed) -> Result<AgentContext, ContextError> {
        self.store.append_partner_story_played(participant_id, entry).await.map_err(store_err)
    }

    async fn append_feedback_given(&self, participant_id: ParticipantId, entry: FeedbackGivenEntry) -> Result<AgentContext, ContextError> {
        self.store.append_feedback_given(participant_id, entry).await.map_err(store_err)
    }

    async fn append_feedback_received(&self, participant_id: ParticipantId, entry: FeedbackReceivedEntry) -> Result<AgentContext, ContextError> {
        self.store.append_feedback_received(participant_id, entry).await.map_err(store_err)
    }

    async fn append_learning(&self, participant_id: ParticipantId, entry: LearningEntry) -> Result<AgentContext, ContextError> {
        self.store.append_learning(participant_id, entry).await.map_err(store_err)
    }
}

/// Builds the free-text context summary the synthetic-participant prompt is
/// seeded with (§4.4): own drafts, partner plays, feedback given/received,
/// and cumulative learnings, most recent first, capped to avoid unbounded
/// prompt growth across many rounds.
pub fn build_summary(ctx: &AgentContext, max_entries_per_section: usize) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "Round {}, phase {:?}.\n",
        ctx.current_round, ctx.current_phase
    ));

    if !ctx.own_story_drafts.is_empty() {
        out.push_str("Your previous stories:\n");
        for draft in ctx.own_story_drafts.iter().rev().take(max_entries_per_section) {
            out.push_str(&format!(
                "- round {}: {}\n",
                draft.round,
                draft.story_summary.as_deref().unwrap_or("(no summary)")
            ));
        }
    }

    if !ctx.partner_stories_played.is_empty() {
        out.push_str("Partner stories you played:\n");
        for played in ctx.partner_stories_played.iter().rev().take(max_entries_per_section) {
            out.push_str(&format!("- round {}: {}\n", played.round, played.play_notes));
        }
    }

    if !ctx.feedback_received.is_empty() {
        out.push_str(&format!(
            "You have received {} pieces of feedback across all rounds.\n",
            ctx.feedback_received.len()
        ));
    }

    if !ctx.cumulative_learnings.is_empty() {
        out.push_str("Things you have learned:\n");
        for learning in ctx.cumulative_learnings.iter().rev().take(max_entries_per_section) {
            out.push_str(&format!("- [{}] {}\n", learning.tag, learning.content));
        }
    }

    out
}
