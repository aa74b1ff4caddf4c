//! Batch progress recomputation (§4.11).
//!
//! Called after any participant terminalization (completion, exclusion,
//! timeout-as-complete). A pure function over [`Store`] plus [`StatusCache`]
//! — every worker and orchestrator calls this instead of touching
//! `batch.actors_completed` directly, so the `COMPLETE` transition only ever
//! happens in one place.

use std::sync::Arc;

use crate::status_cache::StatusCache;
use crate::store::Store;
use crate::types::{BatchId, BatchStatus, ParticipantState, StoreError};

/// Recomputes `actorsCompleted` for `batch_id` and, if every participant has
/// reached a terminal state, transitions the batch to `COMPLETE` (§4.11).
///
/// Returns the refreshed batch. A worker observing `batch.status` already
/// terminal before calling this MUST NOT have gotten this far (§5) — this
/// function does not re-check that invariant, it only ever advances toward
/// `COMPLETE`.
pub async fn recompute_batch_progress(
    store: &Arc<dyn Store>,
    status_cache: &StatusCache,
    batch_id: BatchId,
) -> Result<crate::types::Batch, StoreError> {
    let participants = store.list_participants_by_batch(batch_id).await?;
    let total = participants.len() as u32;
    let completed_count = participants
        .iter()
        .filter(|p| matches!(p.state, ParticipantState::Complete | ParticipantState::Excluded))
        .count() as u32;

    let mut batch = store.get_batch(batch_id).await?;
    batch.actors_completed = completed_count;

    if total > 0 && completed_count == total && !batch.status.is_terminal() {
        batch.status = BatchStatus::Complete;
        batch.completed_at = Some(chrono::Utc::now());
    }

    store.update_batch(batch.clone()).await?;
    if batch.status.is_terminal() {
        status_cache.delete(batch_id);
    } else {
        status_cache.set(batch_id, batch.status, None);
    }
    Ok(batch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::sqlite::SqliteStore;
    use crate::types::{ActorType, Batch, Participant, ParticipantRole, Study, StudyConfig, ExecutionMode, BatchId, StudyId};

    fn sample_study() -> Study {
        Study {
            id: StudyId::new(),
            name: "s".to_string(),
            config: StudyConfig {
                execution_mode: ExecutionMode::Synchronous,
                collaboration: None,
                human_role: None,
                max_play_actions: None,
                phase_time_limits: Default::default(),
                synthetic_partner: None,
                notifications: serde_json::Value::Null,
                extra: Default::default(),
            },
            created_at: chrono::Utc::now(),
        }
    }

    fn sample_participant(batch_id: BatchId, study_id: StudyId, state: ParticipantState) -> Participant {
        Participant {
            id: crate::types::ParticipantId::new(),
            batch_id,
            study_id,
            condition_id: None,
            actor_type: ActorType::Synthetic,
            state,
            role: ParticipantRole::Player,
            llm_config: None,
            partner_id: None,
            pairing_metadata: None,
            unique_id: "p".to_string(),
            metadata: serde_json::Value::Null,
            availability: Vec::new(),
            created_at: chrono::Utc::now(),
            completed_at: None,
        }
    }

    #[tokio::test]
    async fn completes_batch_when_all_participants_terminal() {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory().unwrap());
        let cache = StatusCache::new();
        let study = sample_study();
        store.create_study(study.clone()).await.unwrap();
        let batch = Batch {
            id: BatchId::new(),
            study_id: study.id,
            name: "b".to_string(),
            status: BatchStatus::Running,
            actors_created: 0,
            actors_completed: 0,
            export_path: None,
            started_at: None,
            completed_at: None,
            error: None,
        };
        let participants = vec![
            sample_participant(batch.id, study.id, ParticipantState::Complete),
            sample_participant(batch.id, study.id, ParticipantState::Excluded),
        ];
        store.create_batch_with_actors(batch.clone(), participants).await.unwrap();

        let updated = recompute_batch_progress(&store, &cache, batch.id).await.unwrap();
        assert_eq!(updated.actors_completed, 2);
        assert_eq!(updated.status, BatchStatus::Complete);
        assert!(updated.completed_at.is_some());
        assert_eq!(cache.get(batch.id), None);
    }

    #[tokio::test]
    async fn leaves_batch_running_while_participants_active() {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory().unwrap());
        let cache = StatusCache::new();
        let study = sample_study();
        store.create_study(study.clone()).await.unwrap();
        let batch = Batch {
            id: BatchId::new(),
            study_id: study.id,
            name: "b".to_string(),
            status: BatchStatus::Running,
            actors_created: 0,
            actors_completed: 0,
            export_path: None,
            started_at: None,
            completed_at: None,
            error: None,
        };
        let participants = vec![
            sample_participant(batch.id, study.id, ParticipantState::Complete),
            sample_participant(batch.id, study.id, ParticipantState::Active),
        ];
        store.create_batch_with_actors(batch.clone(), participants).await.unwrap();

        let updated = recompute_batch_progress(&store, &cache, batch.id).await.unwrap();
        assert_eq!(updated.actors_completed, 1);
        assert_eq!(updated.status, BatchStatus::Running);
        assert_eq!(cache.get(batch.id), Some(BatchStatus::Running));
    }
}
