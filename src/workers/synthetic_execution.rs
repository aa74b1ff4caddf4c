//! Synthetic Execution Worker (§4.8).
//!
//! Drives one synthetic participant through a headless story session: ask
//! the [`StoryPlugin`] for state and available actions, ask the
//! [`LlmClient`] for the next action, repeat until the plugin reports
//! completion, `maxActions` is hit, or the wall-clock `timeoutMs` elapses.
//! Every [`STATUS_RECHECK_INTERVAL`] actions the worker re-reads the owning
//! batch's status so a pause or stop drains the job instead of fighting it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::blob_store::BlobStore;
use crate::broker::Broker;
use crate::llm_client::{ActionRecord, LlmClient, RoleContext};
use crate::progress::recompute_batch_progress;
use crate::status_cache::StatusCache;
use crate::store::Store;
use crate::story_plugin::PluginRegistry;
use crate::types::{
    BatchId, BatchStatus, BatchStoppedError, EngineError, Event, EventId, EventType, JobId,
    ParticipantId, ParticipantState, SyntheticExecutionPayload, WorkerOutcome,
};

const STATUS_RECHECK_INTERVAL: u32 = 5;
const STORY_CONTENT_BUCKET: &str = "story-definitions";

/// Default one-passage story used when a task doesn't name a `story_id`
/// (keeps the worker runnable without a seeded blob store).
fn default_story_content() -> serde_json::Value {
    serde_json::json!([{ "text": "the end", "choices": [] }])
}

async fn load_story_content(
    blob_store: &Arc<dyn BlobStore>,
    story_id: Option<&str>,
) -> Result<serde_json::Value, EngineError> {
    let Some(story_id) = story_id else {
        return Ok(default_story_content());
    };
    let bytes = blob_store
        .get(&format!("{story_id}.json"), STORY_CONTENT_BUCKET)
        .await
        .map_err(EngineError::Blob)?;
    serde_json::from_slice(&bytes)
        .map_err(|e| EngineError::Validation(format!("malformed story content: {e}")))
}

async fn batch_status(
    store: &Arc<dyn Store>,
    status_cache: &StatusCache,
    batch_id: BatchId,
) -> Result<BatchStatus, EngineError> {
    if let Some(status) = status_cache.get(batch_id) {
        return Ok(status);
    }
    let batch = store.get_batch(batch_id).await.map_err(EngineError::Storage)?;
    status_cache.set(batch_id, batch.status, None);
    Ok(batch.status)
}

/// What to do about an in-flight job when the owning batch's status is
/// checked (§4.8 step 1, §5 suspension points).
enum BatchGuard {
    /// Batch is running; proceed.
    Runnable,
    /// Batch is `DELETING`/`FAILED`/`COMPLETE`: the job should report
    /// `SKIPPED` rather than be requeued or treated as a failure.
    Skip(WorkerOutcome),
}

/// Checks the owning batch's status without touching the participant.
/// `PAUSED` raises a retryable error so the broker re-queues with backoff;
/// any other terminal status resolves to `BatchGuard::Skip` so the caller
/// can stop cleanly instead of propagating an error.
async fn guard_batch_runnable(
    store: &Arc<dyn Store>,
    status_cache: &StatusCache,
    batch_id: BatchId,
) -> Result<BatchGuard, EngineError> {
    let status = batch_status(store, status_cache, batch_id).await?;
    if status == BatchStatus::Paused {
        return Err(BatchStoppedError::Paused(batch_id).into());
    }
    if status.is_terminal() {
        return Ok(BatchGuard::Skip(WorkerOutcome::Skipped));
    }
    Ok(BatchGuard::Runnable)
}

async fn emit(
    store: &Arc<dyn Store>,
    participant_id: ParticipantId,
    event_type: EventType,
    data: serde_json::Value,
) -> Result<(), EngineError> {
    store
        .append_event(Event {
            id: EventId::new(),
            participant_id,
            timestamp: chrono::Utc::now(),
            event_type,
            data,
        })
        .await
        .map_err(EngineError::Storage)
}

pub async fn run(
    store: &Arc<dyn Store>,
    broker: &Arc<dyn Broker>,
    blob_store: &Arc<dyn BlobStore>,
    status_cache: &StatusCache,
    registry: &PluginRegistry,
    llm_client: &Arc<dyn LlmClient>,
    job_id: JobId,
    payload: SyntheticExecutionPayload,
) -> Result<serde_json::Value, EngineError> {
    let mut participant = store
        .get_participant(payload.participant_id)
        .await
        .map_err(EngineError::Storage)?;

    if let BatchGuard::Skip(outcome) = guard_batch_runnable(store, status_cache, participant.batch_id).await? {
        return Ok(serde_json::json!({ "participantId": participant.id, "outcome": outcome }));
    }

    participant.state = ParticipantState::Active;
    store
        .update_participant_with_event(participant.id, ParticipantState::Active, serde_json::json!({}))
        .await
        .map_err(EngineError::Storage)?;
    emit(store, participant.id, EventType::SessionStart, serde_json::json!({ "jobId": job_id }))
        .await?;

    let plugin = registry.get(&payload.task_config.plugin_type).map_err(EngineError::Plugin)?;
    let story_content = load_story_content(blob_store, payload.task_config.story_id.as_deref()).await?;
    let session_id = plugin.init_headless(story_content).await.map_err(EngineError::Plugin)?;

    let llm_config = participant.llm_config.clone().ok_or_else(|| {
        EngineError::Validation(format!("participant {} has no llm config", participant.id))
    })?;
    let role_prompt = format!("You are playing the role of {:?} in a collaborative story.", participant.role);
    let mut history: Vec<ActionRecord> = Vec::new();

    let deadline = Instant::now() + Duration::from_millis(payload.task_config.timeout_ms);
    let mut actions_executed: u32 = 0;
    let outcome = loop {
        if actions_executed > 0 && actions_executed % STATUS_RECHECK_INTERVAL == 0 {
            match guard_batch_runnable(store, status_cache, participant.batch_id).await {
                Ok(BatchGuard::Runnable) => {}
                Ok(BatchGuard::Skip(outcome)) => {
                    let _ = plugin.destroy(&session_id).await;
                    return Ok(serde_json::json!({ "participantId": participant.id, "outcome": outcome }));
                }
                Err(e) => {
                    let _ = plugin.destroy(&session_id).await;
                    return Err(e);
                }
            }
        }

        if plugin.is_complete(&session_id).await.map_err(EngineError::Plugin)? {
            break WorkerOutcome::Completed;
        }
        if actions_executed >= payload.task_config.max_actions {
            break WorkerOutcome::Partial;
        }
        if Instant::now() >= deadline {
            break WorkerOutcome::Timeout { actions_executed };
        }

        let story_state = plugin.get_state(&session_id).await.map_err(EngineError::Plugin)?;
        let available_actions = plugin.get_available_actions(&session_id).await.map_err(EngineError::Plugin)?;
        if available_actions.is_empty() {
            break WorkerOutcome::Completed;
        }

        let context = RoleContext {
            role_prompt: role_prompt.clone(),
            story_state,
            available_actions,
            history: history.clone(),
        };
        let action = match llm_client.generate(&context, &llm_config).await {
            Ok(action) => action,
            Err(e) => {
                emit(
                    store,
                    participant.id,
                    EventType::SyntheticError,
                    serde_json::json!({ "action": "generate", "error": e.to_string() }),
                )
                .await?;
                let _ = plugin.destroy(&session_id).await;
                return Err(EngineError::Llm(e));
            }
        };
        let result = plugin.execute_headless(&session_id, &action.name).await;
        match result {
            Ok(state) => {
                emit(
                    store,
                    participant.id,
                    EventType::SyntheticAction,
                    serde_json::json!({ "action": action.name, "state": state }),
                )
                .await?;
                history.push(ActionRecord { action: action.name.clone(), result_summary: None });
                actions_executed += 1;
            }
            Err(e) => {
                emit(
                    store,
                    participant.id,
                    EventType::SyntheticError,
                    serde_json::json!({ "action": action.name, "error": e.to_string() }),
                )
                .await?;
                let _ = plugin.destroy(&session_id).await;
                return Err(EngineError::Plugin(e));
            }
        }
    };

    plugin.destroy(&session_id).await.map_err(EngineError::Plugin)?;

    let final_state = match &outcome {
        WorkerOutcome::Completed => ParticipantState::Complete,
        WorkerOutcome::Timeout { .. } => {
            emit(store, participant.id, EventType::SyntheticTimeout, serde_json::json!({ "actionsExecuted": actions_executed }))
                .await?;
            ParticipantState::Complete
        }
        WorkerOutcome::Partial => ParticipantState::Complete,
        WorkerOutcome::Skipped => ParticipantState::Enrolled,
    };
    store
        .update_participant_with_event(participant.id, final_state, serde_json::json!({ "outcome": outcome }))
        .await
        .map_err(EngineError::Storage)?;
    emit(store, participant.id, EventType::SessionEnd, serde_json::json!({ "outcome": outcome }))
        .await?;

    recompute_batch_progress(store, status_cache, participant.batch_id)
        .await
        .map_err(EngineError::Storage)?;
    let _ = broker.update_progress(job_id, 100).await;

    Ok(serde_json::json!({ "participantId": participant.id, "outcome": outcome }))
}
