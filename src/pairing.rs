//! Pairing Service (§4.6).
//!
//! Strategy selection lives here; the actual symmetric write is delegated
//! to [`Store::pair_participants`], which holds the locking/transaction
//! discipline (§4.3) so this module stays pure matching logic.

use async_trait::async_trait;
use std::sync::Arc;

use crate::store::Store;
use crate::types::{
    total_overlap_hours, ActorType, PairingError, PairingMetadata, PairingStrategyKind,
    Participant, ParticipantId, ParticipantState,
};

/// Minimum weekly-availability overlap a HUMAN_HUMAN match must clear when
/// the caller requires one and doesn't name a tighter bound (§4.6).
pub const DEFAULT_MIN_OVERLAP_HOURS: f64 = 2.0;

#[async_trait]
pub trait PairingService: Send + Sync {
    /// Pair all unpaired eligible participants of a batch using `strategy`.
    /// `require_availability_overlap`/`min_overlap_hours` gate HUMAN_HUMAN
    /// matches (and the HUMAN_HUMAN phase of AUTO) on weekly-availability
    /// overlap (§4.6). Returns the pairs formed.
    async fn auto_pair(
        &self,
        batch_id: crate::types::BatchId,
        strategy: PairingStrategyKind,
        require_availability_overlap: bool,
        min_overlap_hours: f64,
        researcher_id: Option<crate::types::ResearcherId>,
    ) -> Result<Vec<(ParticipantId, ParticipantId)>, PairingError>;

    /// Pair two specific participants, validating they're in the same study
    /// and neither already has a partner (§4.6, edge cases).
    async fn manual_pair(
        &self,
        a: ParticipantId,
        b: ParticipantId,
        researcher_id: Option<crate::types::ResearcherId>,
    ) -> Result<(), PairingError>;

    async fn unpair(&self, participant_id: ParticipantId) -> Result<(), PairingError>;
}

pub struct StorePairingService {
    store: Arc<dyn Store>,
}

impl StorePairingService {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Whether `a` and `b` are eligible partners under a sequential
    /// (non-availability-aware) strategy. HUMAN_HUMAN and AUTO are matched
    /// by dedicated passes instead, so they're not handled here.
    fn eligible(strategy: PairingStrategyKind, a: ActorType, b: ActorType) -> bool {
        match strategy {
            PairingStrategyKind::SyntheticSynthetic => a == ActorType::Synthetic && b == ActorType::Synthetic,
            PairingStrategyKind::HumanSynthetic => a != b,
            PairingStrategyKind::HumanHuman | PairingStrategyKind::Auto => false,
        }
    }

    /// SYNTHETIC_SYNTHETIC and HUMAN_SYNTHETIC (§4.6): scans `unpaired` in
    /// list order, pairing each participant with the first eligible
    /// candidate still ahead of it. Participants left without a match are
    /// returned to `unpaired` so a later pass in an AUTO cascade can still
    /// consider them.
    async fn pair_greedy(
        &self,
        unpaired: &mut Vec<Participant>,
        strategy: PairingStrategyKind,
        researcher_id: Option<crate::types::ResearcherId>,
        pairs: &mut Vec<(ParticipantId, ParticipantId)>,
    ) -> Result<(), PairingError> {
        let mut leftover = Vec::new();
        while let Some(first) = unpaired.first().cloned() {
            unpaired.remove(0);
            let partner_index = unpaired
                .iter()
                .position(|candidate| Self::eligible(strategy, first.actor_type, candidate.actor_type));
            let Some(index) = partner_index else {
                leftover.push(first);
                continue;
            };
            let second = unpaired.remove(index);

            let metadata = PairingMetadata {
                paired_at: chrono::Utc::now(),
                strategy,
                matched_by: "auto".to_string(),
                overlap_hours: None,
                paired_by_researcher_id: researcher_id,
            };
            self.store
                .pair_participants(first.id, second.id, metadata)
                .await
                .map_err(|e| PairingError::BadRequest(e.to_string()))?;
            pairs.push((first.id, second.id));
        }
        unpaired.extend(leftover);
        Ok(())
    }

    /// HUMAN_HUMAN (§4.6): repeatedly finds the pair of remaining humans
    /// with the greatest weekly-availability overlap and pairs them, until
    /// fewer than two humans remain or the best remaining overlap falls
    /// below `min_overlap_hours` (when `require_overlap` is set). Humans
    /// left unpaired, and every non-human, stay in `unpaired` for a later
    /// pass.
    async fn pair_human_human(
        &self,
        unpaired: &mut Vec<Participant>,
        require_overlap: bool,
        min_overlap_hours: f64,
        researcher_id: Option<crate::types::ResearcherId>,
        pairs: &mut Vec<(ParticipantId, ParticipantId)>,
    ) -> Result<(), PairingError> {
        loop {
            let human_indices: Vec<usize> = unpaired
                .iter()
                .enumerate()
                .filter(|(_, p)| p.actor_type == ActorType::Human)
                .map(|(i, _)| i)
                .collect();
            if human_indices.len() < 2 {
                break;
            }

            let mut best: Option<(usize, usize, f64)> = None;
            for (pos, &i) in human_indices.iter().enumerate() {
                for &j in &human_indices[pos + 1..] {
                    let overlap = total_overlap_hours(&unpaired[i].availability, &unpaired[j].availability);
                    let is_better = match best {
                        Some((_, _, best_overlap)) => overlap > best_overlap,
                        None => true,
                    };
                    if is_better {
                        best = Some((i, j, overlap));
                    }
                }
            }
            let Some((i, j, overlap)) = best else { break };
            if require_overlap && overlap < min_overlap_hours {
                break;
            }

            let (lo, hi) = if i < j { (i, j) } else { (j, i) };
            let second = unpaired.remove(hi);
            let first = unpaired.remove(lo);

            let metadata = PairingMetadata {
                paired_at: chrono::Utc::now(),
                strategy: PairingStrategyKind::HumanHuman,
                matched_by: "auto".to_string(),
                overlap_hours: Some(overlap),
                paired_by_researcher_id: researcher_id,
            };
            self.store
                .pair_participants(first.id, second.id, metadata)
                .await
                .map_err(|e| PairingError::BadRequest(e.to_string()))?;
            pairs.push((first.id, second.id));
        }
        Ok(())
    }
}

#[async_trait]
impl PairingService for StorePairingService {
    async fn auto_pair(
        &self,
        batch_id: crate::types::BatchId,
        strategy: PairingStrategyKind,
        require_availability_overlap: bool,
        min_overlap_hours: f64,
        researcher_id: Option<crate::types::ResearcherId>,
    ) -> Result<Vec<(ParticipantId, ParticipantId)>, PairingError> {
        let participants = self
            .store
            .list_participants_by_batch(batch_id)
            .await
            .map_err(|e| PairingError::BadRequest(e.to_string()))?;

        let mut unpaired: Vec<_> = participants
            .into_iter()
            .filter(|p| p.partner_id.is_none())
            .filter(|p| {
                matches!(
                    p.state,
                    ParticipantState::Enrolled | ParticipantState::Scheduled | ParticipantState::Confirmed
                )
            })
            .collect();

        let mut pairs = Vec::new();
        match strategy {
            PairingStrategyKind::HumanHuman => {
                self.pair_human_human(&mut unpaired, require_availability_overlap, min_overlap_hours, researcher_id, &mut pairs)
                    .await?;
            }
            PairingStrategyKind::SyntheticSynthetic | PairingStrategyKind::HumanSynthetic => {
                self.pair_greedy(&mut unpaired, strategy, researcher_id, &mut pairs).await?;
            }
            PairingStrategyKind::Auto => {
                // HUMAN_HUMAN -> HUMAN_SYNTHETIC -> SYNTHETIC_SYNTHETIC, each
                // over the residual unpaired set (§4.6).
                self.pair_human_human(&mut unpaired, require_availability_overlap, min_overlap_hours, researcher_id, &mut pairs)
                    .await?;
                self.pair_greedy(&mut unpaired, PairingStrategyKind::HumanSynthetic, researcher_id, &mut pairs)
                    .await?;
                self.pair_greedy(&mut unpaired, PairingStrategyKind::SyntheticSynthetic, researcher_id, &mut pairs)
                    .await?;
            }
        }

        Ok(pairs)
    }

    async fn manual_pair(
        &self,
        a: ParticipantId,
        b: ParticipantId,
        researcher_id: Option<crate::types::ResearcherId>,
    ) -> Result<(), PairingError> {
        if a == b {
            return Err(PairingError::BadRequest("cannot pair a participant with themselves".to_string()));
        }
        // Fast-path validation for a friendly error on the common case;
        // `Store::pair_participants` re-checks the same conditions inside
        // its transaction, so a second `manualPair` racing this one can't
        // both pass this check and still double-pair `a` (§4.6, §5).
        let participant_a = self.store.get_participant(a).await.map_err(|_| PairingError::NotFound(a))?;
        let participant_b = self.store.get_participant(b).await.map_err(|_| PairingError::NotFound(b))?;

        if participant_a.study_id != participant_b.study_id {
            return Err(PairingError::StudyMismatch);
        }
        if participant_a.partner_id.is_some() {
            return Err(PairingError::AlreadyPaired(a));
        }
        if participant_b.partner_id.is_some() {
            return Err(PairingError::AlreadyPaired(b));
        }

        let metadata = PairingMetadata {
            paired_at: chrono::Utc::now(),
            strategy: PairingStrategyKind::Auto,
            matched_by: "manual".to_string(),
            overlap_hours: None,
            paired_by_researcher_id: researcher_id,
        };
        self.store
            .pair_participants(a, b, metadata)
            .await
            .map_err(|e| PairingError::BadRequest(e.to_string()))
    }

    async fn unpair(&self, participant_id: ParticipantId) -> Result<(), PairingError> {
        self.store
            .unpair_participant(participant_id)
            .await
            .map_err(|e| PairingError::BadRequest(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::sqlite::SqliteStore;
    use crate::types::{
        AvailabilityWindow, Batch, BatchStatus, ExecutionMode, ParticipantRole, Study, StudyConfig,
        StudyId, Weekday,
    };

    async fn setup_batch_with(store: &Arc<dyn Store>, actor_types: &[ActorType]) -> crate::types::BatchId {
        let study = Study {
            id: StudyId::new(),
            name: "s".to_string(),
            config: StudyConfig {
                execution_mode: ExecutionMode::Asynchronous,
                collaboration: None,
                human_role: None,
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
            id: crate::types::BatchId::new(),
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
        let participants: Vec<_> = actor_types
            .iter()
            .enumerate()
            .map(|(i, &actor_type)| crate::types::Participant {
                id: ParticipantId::new(),
                batch_id: batch.id,
                study_id: study.id,
                condition_id: None,
                actor_type,
                state: ParticipantState::Enrolled,
                role: ParticipantRole::Player,
                llm_config: None,
                partner_id: None,
                pairing_metadata: None,
                unique_id: format!("p-{i}"),
                metadata: serde_json::Value::Null,
                availability: Vec::new(),
                created_at: chrono::Utc::now(),
                completed_at: None,
            })
            .collect();
        store.create_batch_with_actors(batch.clone(), participants).await.unwrap();
        batch.id
    }

    #[tokio::test]
    async fn auto_pair_matches_human_synthetic_pairs() {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory().unwrap());
        let batch_id = setup_batch_with(&store, &[ActorType::Human, ActorType::Synthetic]).await;
        let service = StorePairingService::new(store.clone());
        let pairs = service
            .auto_pair(batch_id, PairingStrategyKind::HumanSynthetic, false, DEFAULT_MIN_OVERLAP_HOURS, None)
            .await
            .unwrap();
        assert_eq!(pairs.len(), 1);
    }

    #[tokio::test]
    async fn auto_pair_ignores_participants_outside_pairable_states() {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory().unwrap());
        let batch_id = setup_batch_with(&store, &[ActorType::Human, ActorType::Synthetic]).await;
        let participants = store.list_participants_by_batch(batch_id).await.unwrap();
        store
            .update_participant_with_event(participants[0].id, ParticipantState::Withdrawn, serde_json::json!({}))
            .await
            .unwrap();

        let service = StorePairingService::new(store.clone());
        let pairs = service
            .auto_pair(batch_id, PairingStrategyKind::HumanSynthetic, false, DEFAULT_MIN_OVERLAP_HOURS, None)
            .await
            .unwrap();
        assert!(pairs.is_empty(), "a withdrawn participant must never be auto-paired");
    }

    #[tokio::test]
    async fn human_human_prefers_the_pair_with_the_most_overlap() {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory().unwrap());
        let batch_id = setup_batch_with(&store, &[ActorType::Human, ActorType::Human, ActorType::Human]).await;
        let participants = store.list_participants_by_batch(batch_id).await.unwrap();

        // p0: Mon 9-12. p1: Mon 10-11 (1h overlap with p0). p2: Mon 9-12 (3h
        // overlap with p0) -- p0 and p2 should be matched, leaving p1 unpaired.
        let windows = [
            vec![AvailabilityWindow { day: Weekday::Monday, start_hour: 9.0, end_hour: 12.0 }],
            vec![AvailabilityWindow { day: Weekday::Monday, start_hour: 10.0, end_hour: 11.0 }],
            vec![AvailabilityWindow { day: Weekday::Monday, start_hour: 9.0, end_hour: 12.0 }],
        ];
        for (participant, availability) in participants.iter().zip(windows) {
            let mut updated = participant.clone();
            updated.availability = availability;
            store.update_participant(updated).await.unwrap();
        }

        let service = StorePairingService::new(store.clone());
        let pairs = service
            .auto_pair(batch_id, PairingStrategyKind::HumanHuman, false, DEFAULT_MIN_OVERLAP_HOURS, None)
            .await
            .unwrap();

        assert_eq!(pairs.len(), 1);
        let (a, b) = pairs[0];
        assert!((a == participants[0].id && b == participants[2].id) || (a == participants[2].id && b == participants[0].id));
    }

    #[tokio::test]
    async fn human_human_skips_pairs_below_required_overlap() {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory().unwrap());
        let batch_id = setup_batch_with(&store, &[ActorType::Human, ActorType::Human]).await;
        let participants = store.list_participants_by_batch(batch_id).await.unwrap();

        let windows = [
            vec![AvailabilityWindow { day: Weekday::Monday, start_hour: 9.0, end_hour: 10.0 }],
            vec![AvailabilityWindow { day: Weekday::Tuesday, start_hour: 9.0, end_hour: 10.0 }],
        ];
        for (participant, availability) in participants.iter().zip(windows) {
            let mut updated = participant.clone();
            updated.availability = availability;
            store.update_participant(updated).await.unwrap();
        }

        let service = StorePairingService::new(store.clone());
        let pairs = service
            .auto_pair(batch_id, PairingStrategyKind::HumanHuman, true, DEFAULT_MIN_OVERLAP_HOURS, None)
            .await
            .unwrap();
        assert!(pairs.is_empty(), "zero-overlap humans must not be paired when overlap is required");
    }

    #[tokio::test]
    async fn manual_pair_rejects_self_pairing() {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory().unwrap());
        let batch_id = setup_batch_with(&store, &[ActorType::Human]).await;
        let participants = store.list_participants_by_batch(batch_id).await.unwrap();
        let service = StorePairingService::new(store.clone());
        let result = service.manual_pair(participants[0].id, participants[0].id, None).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn manual_pair_rejects_already_paired() {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory().unwrap());
        let batch_id = setup_batch_with(&store, &[ActorType::Human, ActorType::Synthetic, ActorType::Human]).await;
        let participants = store.list_participants_by_batch(batch_id).await.unwrap();
        let service = StorePairingService::new(store.clone());
        service.manual_pair(participants[0].id, participants[1].id, None).await.unwrap();
        let result = service.manual_pair(participants[0].id, participants[2].id, None).await;
        assert!(matches!(result, Err(PairingError::AlreadyPaired(_))));
    }
}
