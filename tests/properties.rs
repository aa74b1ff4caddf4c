//! Property tests for the invariants the engine's concurrency and ordering
//! guarantees rest on: append monotonicity, partner symmetry, round
//! progression, story version density, idempotent enqueue, and the
//! feedback summary's canonical ordering.

use std::sync::Arc;

use study_engine::agent_context::{AgentContextService, StoreAgentContextService};
use study_engine::broker::memory::InMemoryBroker;
use study_engine::broker::{queue_names, Broker};
use study_engine::comment_service::build_feedback_summary;
use study_engine::pairing::{PairingService, StorePairingService};
use study_engine::store::sqlite::SqliteStore;
use study_engine::store::Store;
use study_engine::types::{
    ActorType, Batch, BatchId, BatchStatus, Comment, CommentId, CommentType, ExecutionMode,
    OwnStoryDraft, ParticipantId, ParticipantRole, ParticipantState, Phase, Study, StudyConfig,
    StudyId,
};

fn sample_study() -> Study {
    Study {
        id: StudyId::new(),
        name: "properties".to_string(),
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
    }
}

fn sample_participant(batch_id: BatchId, study_id: StudyId, unique_id: &str, actor_type: ActorType) -> study_engine::types::Participant {
    study_engine::types::Participant {
        id: ParticipantId::new(),
        batch_id,
        study_id,
        condition_id: None,
        actor_type,
        state: ParticipantState::Enrolled,
        role: ParticipantRole::Player,
        llm_config: None,
        partner_id: None,
        pairing_metadata: None,
        unique_id: unique_id.to_string(),
        metadata: serde_json::Value::Null,
        availability: Vec::new(),
        created_at: chrono::Utc::now(),
        completed_at: None,
    }
}

async fn seeded_batch(store: &Arc<dyn Store>, actors: &[(ActorType, &str)]) -> (BatchId, Vec<ParticipantId>) {
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
    let participants: Vec<_> = actors
        .iter()
        .map(|(actor_type, unique_id)| sample_participant(batch.id, study.id, unique_id, *actor_type))
        .collect();
    let ids = participants.iter().map(|p| p.id).collect();
    store.create_batch_with_actors(batch.clone(), participants).await.unwrap();
    (batch.id, ids)
}

/// Property 1: K concurrent `appendOwnDraft` calls never lose an update —
/// the final context has exactly K drafts, one per round value written.
#[tokio::test]
async fn append_own_draft_is_dense_under_concurrency() {
    let store: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory().unwrap());
    let (_batch_id, ids) = seeded_batch(&store, &[(ActorType::Synthetic, "p")]).await;
    let participant_id = ids[0];
    let service = Arc::new(StoreAgentContextService::new(store.clone()));

    const K: u32 = 20;
    let mut handles = Vec::with_capacity(K as usize);
    for round in 0..K {
        let service = service.clone();
        handles.push(tokio::spawn(async move {
            service
                .append_own_draft(
                    participant_id,
                    OwnStoryDraft { round, story_artifact_id: None, story_summary: format!("draft {round}") },
                )
                .await
                .unwrap();
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let ctx = service.get_or_create(participant_id).await.unwrap();
    assert_eq!(ctx.own_story_drafts.len(), K as usize);
    let mut rounds: Vec<u32> = ctx.own_story_drafts.iter().map(|d| d.round).collect();
    rounds.sort_unstable();
    rounds.dedup();
    assert_eq!(rounds.len(), K as usize, "no draft should be lost to a lost update");
}

/// Property 2: pairing and unpairing keep both sides' `partnerId` in sync —
/// never one set without the other.
#[tokio::test]
async fn pairing_and_unpairing_stay_symmetric() {
    let store: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory().unwrap());
    let (_batch_id, ids) = seeded_batch(
        &store,
        &[(ActorType::Human, "a"), (ActorType::Synthetic, "b")],
    )
    .await;
    let (a, b) = (ids[0], ids[1]);
    let pairing = StorePairingService::new(store.clone());

    pairing.manual_pair(a, b, None).await.unwrap();
    let pa = store.get_participant(a).await.unwrap();
    let pb = store.get_participant(b).await.unwrap();
    assert_eq!(pa.partner_id, Some(b));
    assert_eq!(pb.partner_id, Some(a));

    pairing.unpair(a).await.unwrap();
    let pa = store.get_participant(a).await.unwrap();
    let pb = store.get_participant(b).await.unwrap();
    assert_eq!(pa.partner_id, None, "unpairing the first side must clear it");
    assert_eq!(pb.partner_id, None, "unpairing one side must clear its partner's pointer too");
}

/// Property 4: advancing a round strictly increases `currentRound` by one
/// and resets `currentPhase` back to AUTHOR.
#[tokio::test]
async fn advancing_round_increments_and_resets_phase() {
    let store: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory().unwrap());
    let (_batch_id, ids) = seeded_batch(&store, &[(ActorType::Synthetic, "p")]).await;
    let participant_id = ids[0];
    let service = StoreAgentContextService::new(store.clone());

    let initial = service.get_or_create(participant_id).await.unwrap();
    assert_eq!(initial.current_round, 1);
    assert_eq!(initial.current_phase, Phase::Author);

    service.update_phase(participant_id, Phase::Review).await.unwrap();
    let advanced = service.advance_round(participant_id).await.unwrap();
    assert_eq!(advanced.current_round, initial.current_round + 1);
    assert_eq!(advanced.current_phase, Phase::Author);
}

/// Property 5: reserving story versions for the same (participant, plugin)
/// pair under concurrency yields a contiguous `1..=K` run, no gaps or
/// duplicates, because the store serializes the read-max-then-insert in
/// one transaction per call.
#[tokio::test]
async fn story_version_reservation_is_dense_under_concurrency() {
    let store: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory().unwrap());
    let (_batch_id, ids) = seeded_batch(&store, &[(ActorType::Synthetic, "p")]).await;
    let participant_id = ids[0];

    const K: u32 = 15;
    let mut handles = Vec::with_capacity(K as usize);
    for _ in 0..K {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store.reserve_story_version(participant_id, "twine", 1, "default").await.unwrap()
        }));
    }
    let mut versions: Vec<u32> = Vec::with_capacity(K as usize);
    for handle in handles {
        versions.push(handle.await.unwrap().version);
    }
    versions.sort_unstable();
    assert_eq!(versions, (1..=K).collect::<Vec<_>>());
}

/// Property 6: enqueuing twice with the same job id is idempotent — exactly
/// one job ends up waiting on the queue.
#[tokio::test]
async fn enqueue_with_same_job_id_is_idempotent() {
    let broker: Arc<dyn Broker> = Arc::new(InMemoryBroker::new());
    let job_id = study_engine::types::deterministic_job_id("properties-test-idempotent-enqueue");

    let first = broker
        .enqueue(queue_names::SYNTHETIC_EXECUTION, serde_json::json!({ "n": 1 }), Some(job_id), None)
        .await
        .unwrap();
    let second = broker
        .enqueue(queue_names::SYNTHETIC_EXECUTION, serde_json::json!({ "n": 2 }), Some(job_id), None)
        .await
        .unwrap();

    assert_eq!(first, second);
    let stats = broker.stats(queue_names::SYNTHETIC_EXECUTION).await.unwrap();
    assert_eq!(stats.waiting, 1);
}

/// Property 9: the feedback summary lists present categories in canonical
/// order (PRAISE, SUGGESTION, CRITIQUE, QUESTION, FEEDBACK) and omits any
/// category with no comments — QUESTION is left out here on purpose.
#[tokio::test]
async fn feedback_summary_orders_categories_and_skips_empty_ones() {
    let author_id = ParticipantId::new();
    let target_id = ParticipantId::new();
    let make = |comment_type: CommentType, content: &str| Comment {
        id: CommentId::new(),
        author_id,
        target_participant_id: target_id,
        story_artifact_id: None,
        passage_id: None,
        content: content.to_string(),
        comment_type,
        round: 1,
        phase: Phase::Review,
        parent_id: None,
        resolved: false,
        addressed_in_round: None,
        created_at: chrono::Utc::now(),
    };

    let comments = vec![
        make(CommentType::Critique, "too short"),
        make(CommentType::Feedback, "general note"),
        make(CommentType::Praise, "loved the twist"),
        make(CommentType::Suggestion, "add a second ending"),
    ];

    let summary = build_feedback_summary(&comments);
    let praise_at = summary.find("Praise").expect("present category must appear");
    let suggestion_at = summary.find("Suggestion").expect("present category must appear");
    let critique_at = summary.find("Critique").expect("present category must appear");
    let feedback_at = summary.find("Feedback").expect("present category must appear");

    assert!(praise_at < suggestion_at);
    assert!(suggestion_at < critique_at);
    assert!(critique_at < feedback_at);
    assert!(!summary.contains("Question"), "an empty category must not appear in the summary");
}
