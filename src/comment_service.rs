//! Comment Service (§4.5).
//!
//! Raw CRUD lives on [`Store`]; this module adds the logic that genuinely
//! needs to be above the persistence layer: bounded-depth thread traversal
//! and the feedback summary used to seed a synthetic participant's REVIEW
//! prompt (§4.5, property 9).

use async_trait::async_trait;
use std::sync::Arc;

use crate::store::Store;
use crate::types::{Comment, CommentError, CommentId, CommentType, ParticipantId, Phase};

const DEFAULT_MAX_THREAD_DEPTH: usize = 10;

#[async_trait]
pub trait CommentService: Send + Sync {
    async fn create(&self, comment: Comment) -> Result<Comment, CommentError>;
    async fn get(&self, id: CommentId) -> Result<Comment, CommentError>;
    async fn list_received(&self, participant_id: ParticipantId) -> Result<Vec<Comment>, CommentError>;
    async fn list_authored(&self, participant_id: ParticipantId) -> Result<Vec<Comment>, CommentError>;
    async fn list_for_round_phase(&self, target_participant_id: ParticipantId, round: u32, phase: Phase) -> Result<Vec<Comment>, CommentError>;
    async fn resolve(&self, id: CommentId, addressed_in_round: u32) -> Result<Comment, CommentError>;
    async fn unresolve(&self, id: CommentId) -> Result<Comment, CommentError>;
    async fn update_content(&self, id: CommentId, content: &str) -> Result<Comment, CommentError>;
    async fn delete_with_replies(&self, id: CommentId) -> Result<(), CommentError>;

    /// Walks `parent_id` links breadth-first starting from `root`, bounded
    /// to `max_depth` levels (default 10); returns
    /// `CommentError::DepthExceeded` if the thread is deeper than that
    /// rather than silently truncating (§4.5, edge cases).
    async fn get_thread(&self, root: CommentId, max_depth: Option<usize>) -> Result<Vec<Comment>, CommentError>;

    /// Counts received comments by type for `participant_id` within
    /// `round`, used for researcher-facing stats and for the synthetic
    /// REVIEW-phase prompt (§4.5).
    async fn stats_for_round(&self, participant_id: ParticipantId, round: u32) -> Result<Vec<(CommentType, usize)>, CommentError>;
}

pub struct StoreCommentService {
    store: Arc<dyn Store>,
}

impl StoreCommentService {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }
}

fn store_err(e: crate::types::StoreError) -> CommentError {
    CommentError::Store(e.to_string())
}

#[async_trait]
impl CommentService for StoreCommentService {
    async fn create(&self, comment: Comment) -> Result<Comment, CommentError> {
        self.store.create_comment(comment).await.map_err(store_err)
    }

    async fn get(&self, id: CommentId) -> Result<Comment, CommentError> {
        self.store.get_comment(id).await.map_err(|e| match e {
            crate::types::StoreError::NotFound(_) => CommentError::NotFound(id),
            other => store_err(other),
        })
    }

    async fn list_received(&self, participant_id: ParticipantId) -> Result<Vec<Comment>, CommentError> {
        self.store.list_comments_received(participant_id).await.map_err(store_err)
    }

    async fn list_authored(&self, participant_id: ParticipantId) -> Result<Vec<Comment>, CommentError> {
        self.store.list_comments_authored(participant_id).await.map_err(store_err)
    }

    async fn list_for_round_phase(&self, target_participant_id: ParticipantId, round: u32, phase: Phase) -> Result<Vec<Comment>, CommentError> {
        self.store
            .list_comments_for_round_phase(target_participant_id, round, phase)
            .await
            .map_err(store_err)
    }

    async fn resolve(&self, id: CommentId, addressed_in_round: u32) -> Result<Comment, CommentError> {
        self.store.resolve_comment(id, addressed_in_round).await.map_err(store_err)
    }

    async fn unresolve(&self, id: CommentId) -> Result<Comment, CommentError> {
        self.store.unresolve_comment(id).await.map_err(store_err)
    }

    async fn update_content(&self, id: CommentId, content: &str) -> Result<Comment, CommentError> {
        self.store.update_comment_content(id, content).await.map_err(store_err)
    }

    async fn delete_with_replies(&self, id: CommentId) -> Result<(), CommentError> {
        self.store.delete_comment_cascade_one_level(id).await.map_err(store_err)
    }

    async fn get_thread(&self, root: CommentId, max_depth: Option<usize>) -> Result<Vec<Comment>, CommentError> {
        let max_depth = max_depth.unwrap_or(DEFAULT_MAX_THREAD_DEPTH);
        let mut thread = vec![self.get(root).await?];
        let mut frontier = vec![root];
        let mut depth = 0;

        while !frontier.is_empty() {
            depth += 1;
            if depth > max_depth {
                return Err(CommentError::DepthExceeded(max_depth));
            }
            let mut next_frontier = Vec::new();
            for parent in frontier {
                let replies = self.store.list_replies(parent).await.map_err(store_err)?;
                for reply in replies {
                    next_frontier.push(reply.id);
                    thread.push(reply);
                }
            }
            frontier = next_frontier;
        }
        Ok(thread)
    }

    async fn stats_for_round(&self, participant_id: ParticipantId, round: u32) -> Result<Vec<(CommentType, usize)>, CommentError> {
        let received = self.store.list_comments_received(participant_id).await.map_err(store_err)?;
        Ok(CommentType::canonical_order()
            .iter()
            .map(|&ty| {
                let count = received.iter().filter(|c| c.round == round && c.comment_type == ty).count();
                (ty, count)
            })
            .collect())
    }
}

/// Renders a synthetic participant's feedback-received prompt section,
/// grouped by [`CommentType::canonical_order`] so the tone is always led
/// with praise before critique (§4.5, property 9).
pub fn build_feedback_summary(comments: &[Comment]) -> String {
    let mut out = String::new();
    for &ty in CommentType::canonical_order() {
        let matching: Vec<&Comment> = comments.iter().filter(|c| c.comment_type == ty).collect();
        if matching.is_empty() {
            continue;
        }
        out.push_str(&format!("{:?}:\n", ty));
        for comment in matching {
            out.push_str(&format!("- {}\n", comment.content));
        }
    }
    out
}
