//! Batch Creation Workers (§4.7).
//!
//! Two entry points, one per queue (§6): [`run_single_actor`] on
//! `batch-creation`, [`run_paired`] on `collaborative-batch-creation`. Both
//! materialize a batch definition into participant rows plus one downstream
//! execution job per participant / per pair, chunked so a single transaction
//! never holds more than 100 inserts.

use std::sync::Arc;

use crate::broker::{queue_names, Broker};
use crate::store::Store;
use crate::types::{
    batch_prefix, deterministic_job_id, ActorType, Batch, BatchCreationPayload, BatchId,
    BatchStatus, EngineError, JobId, JobPriority, PairedBatchCreationPayload, PairingMetadata,
    PairingStrategyKind, Participant, ParticipantRole, ParticipantState, StudyId,
};

const CHUNK_SIZE: usize = 100;

async fn mark_failed(store: &Arc<dyn Store>, batch_id: BatchId, error: &str) {
    if let Ok(mut batch) = store.get_batch(batch_id).await {
        batch.status = BatchStatus::Failed;
        batch.error = Some(error.to_string());
        // Best-effort: a failure recording the failure is logged, not propagated.
        let _ = store.update_batch(batch).await;
    }
}

fn build_participant(
    batch_id: BatchId,
    study_id: StudyId,
    condition_id: Option<crate::types::ConditionId>,
    role: ParticipantRole,
    llm_config: Option<crate::types::LlmConfig>,
    unique_id: String,
    metadata: serde_json::Value,
) -> Participant {
    Participant {
        id: crate::types::ParticipantId::new(),
        batch_id,
        study_id,
        condition_id,
        actor_type: ActorType::Synthetic,
        state: ParticipantState::Enrolled,
        role,
        llm_config,
        partner_id: None,
        pairing_metadata: None,
        unique_id,
        metadata,
        availability: Vec::new(),
        created_at: chrono::Utc::now(),
        completed_at: None,
    }
}

/// Single-actor variant (§4.7): one synthetic participant per execution job.
pub async fn run_single_actor(
    store: &Arc<dyn Store>,
    broker: &Arc<dyn Broker>,
    job_id: JobId,
    payload: BatchCreationPayload,
) -> Result<serde_json::Value, EngineError> {
    let result = run_single_actor_inner(store, broker, job_id, &payload).await;
    if let Err(e) = &result {
        mark_failed(store, payload.batch_id, &e.to_string()).await;
    }
    result
}

async fn run_single_actor_inner(
    store: &Arc<dyn Store>,
    broker: &Arc<dyn Broker>,
    job_id: JobId,
    payload: &BatchCreationPayload,
) -> Result<serde_json::Value, EngineError> {
    let mut batch = store
        .get_batch(payload.batch_id)
        .await
        .map_err(EngineError::Storage)?;
    batch.status = BatchStatus::Running;
    batch.started_at = Some(chrono::Utc::now());
    store.update_batch(batch.clone()).await.map_err(EngineError::Storage)?;

    let prefix = batch_prefix(payload.batch_id);
    let mut participants = Vec::with_capacity(payload.actor_count as usize);
    for i in 0..payload.actor_count {
        let metadata = serde_json::json!({
            "createdByBatch": payload.batch_id,
            "priority": payload.priority,
            "batchIndex": i,
        });
        participants.push(build_participant(
            payload.batch_id,
            payload.study_id,
            payload.condition_id,
            payload.role,
            payload.llm_config.clone(),
            format!("{prefix}-{}", i + 1),
            metadata,
        ));
    }

    let _ = broker.update_progress(job_id, 5).await;
    for (chunk_index, chunk) in participants.chunks(CHUNK_SIZE).enumerate() {
        store
            .insert_participants(chunk.to_vec())
            .await
            .map_err(EngineError::Storage)?;
        let progress = 5 + ((chunk_index + 1) * 75 / participants.len().div_ceil(CHUNK_SIZE).max(1)) as u8;
        let _ = broker.update_progress(job_id, progress.min(80)).await;
    }

    batch.actors_created = participants.len() as u32;
    store.update_batch(batch.clone()).await.map_err(EngineError::Storage)?;

    let jobs: Vec<_> = participants
        .iter()
        .map(|p| {
            let exec_job_id = deterministic_job_id(&format!("exec-{}-{}", payload.batch_id, p.id));
            let exec_payload = crate::types::SyntheticExecutionPayload {
                participant_id: p.id,
                condition_id: payload.condition_id,
                batch_execution_id: Some(payload.batch_id),
                task_config: Default::default(),
                priority: payload.priority,
            };
            (Some(exec_job_id), serde_json::json!(exec_payload), Some(payload.priority))
        })
        .collect();
    broker
        .enqueue_bulk(queue_names::SYNTHETIC_EXECUTION, jobs)
        .await
        .map_err(EngineError::Broker)?;
    let _ = broker.update_progress(job_id, 100).await;

    Ok(serde_json::json!({ "batchId": payload.batch_id, "actorsCreated": participants.len() }))
}

/// Paired variant (§4.7): creates N pairs with symmetric `partnerId`, one
/// collaborative-session job per pair.
pub async fn run_paired(
    store: &Arc<dyn Store>,
    broker: &Arc<dyn Broker>,
    job_id: JobId,
    payload: PairedBatchCreationPayload,
) -> Result<serde_json::Value, EngineError> {
    let result = run_paired_inner(store, broker, job_id, &payload).await;
    if let Err(e) = &result {
        mark_failed(store, payload.batch_id, &e.to_string()).await;
    }
    result
}

async fn run_paired_inner(
    store: &Arc<dyn Store>,
    broker: &Arc<dyn Broker>,
    job_id: JobId,
    payload: &PairedBatchCreationPayload,
) -> Result<serde_json::Value, EngineError> {
    let mut batch = store
        .get_batch(payload.batch_id)
        .await
        .map_err(EngineError::Storage)?;
    batch.status = BatchStatus::Running;
    batch.started_at = Some(chrono::Utc::now());
    store.update_batch(batch.clone()).await.map_err(EngineError::Storage)?;

    let prefix = batch_prefix(payload.batch_id);
    let mut participants = Vec::with_capacity(payload.pair_count as usize * 2);
    let mut pair_ids = Vec::with_capacity(payload.pair_count as usize);
    for k in 0..payload.pair_count {
        let metadata = serde_json::json!({ "createdByBatch": payload.batch_id, "priority": payload.priority, "pairIndex": k });
        let config_b = if payload.vary_partner_config {
            payload.partner_llm_config.clone().or_else(|| payload.llm_config.clone())
        } else {
            payload.llm_config.clone()
        };
        let a = build_participant(
            payload.batch_id,
            payload.study_id,
            payload.condition_id,
            ParticipantRole::Collaborative,
            payload.llm_config.clone(),
            format!("{prefix}-pair{k}-A"),
            metadata.clone(),
        );
        let b = build_participant(
            payload.batch_id,
            payload.study_id,
            payload.condition_id,
            ParticipantRole::Collaborative,
            config_b,
            format!("{prefix}-pair{k}-B"),
            metadata,
        );
        pair_ids.push((a.id, b.id));
        participants.push(a);
        participants.push(b);
    }

    let _ = broker.update_progress(job_id, 5).await;
    for chunk in participants.chunks(CHUNK_SIZE) {
        store
            .insert_participants(chunk.to_vec())
            .await
            .map_err(EngineError::Storage)?;
    }
    batch.actors_created = participants.len() as u32;
    store.update_batch(batch.clone()).await.map_err(EngineError::Storage)?;

    for &(a, b) in &pair_ids {
        let metadata = PairingMetadata {
            paired_at: chrono::Utc::now(),
            strategy: PairingStrategyKind::Auto,
            matched_by: "batch-creation".to_string(),
            overlap_hours: None,
            paired_by_researcher_id: None,
        };
        store.pair_participants(a, b, metadata).await.map_err(EngineError::Storage)?;
    }
    let _ = broker.update_progress(job_id, 80).await;

    let jobs: Vec<_> = pair_ids
        .iter()
        .map(|&(a, b)| {
            let exec_job_id = deterministic_job_id(&format!("collab-{}-{}", payload.batch_id, a));
            let payload = serde_json::json!({ "participantA": a, "participantB": b, "batchId": payload.batch_id });
            (Some(exec_job_id), payload, None)
        })
        .collect();
    broker
        .enqueue_bulk(queue_names::COLLABORATIVE_SESSION, jobs)
        .await
        .map_err(EngineError::Broker)?;
    let _ = broker.update_progress(job_id, 100).await;

    Ok(serde_json::json!({ "batchId": payload.batch_id, "pairsCreated": pair_ids.len() }))
}
