//! Data Export Worker (§4.14).
//!
//! Three bulk reads — participants, events, story artifact metadata — and
//! one write to the blob store. No row-by-row trips: a batch export job
//! enumerates everything once, per the spec's `"one pass, not N queries"`
//! guidance for this worker specifically (§5 doesn't apply its usual
//! shared-resource caution here, since nothing else writes these rows while
//! an export runs).

use std::sync::Arc;

use crate::blob_store::BlobStore;
use crate::broker::Broker;
use crate::store::Store;
use crate::types::{EngineError, ExportFormat, ExportPayload, JobId};

const EXPORT_BUCKET: &str = "exports";

#[derive(serde::Serialize)]
struct ExportRecord {
    participant: serde_json::Value,
    events: Vec<serde_json::Value>,
    story_artifacts: Vec<serde_json::Value>,
    survey_responses: Option<serde_json::Value>,
}

pub async fn run(
    store: &Arc<dyn Store>,
    broker: &Arc<dyn Broker>,
    blob_store: &Arc<dyn BlobStore>,
    job_id: JobId,
    payload: ExportPayload,
) -> Result<serde_json::Value, EngineError> {
    let _ = broker.update_progress(job_id, 5).await;

    let mut participants = store
        .list_participants_by_batch(payload.batch_id)
        .await
        .map_err(EngineError::Storage)?;
    if let Some(ids) = &payload.participant_ids {
        participants.retain(|p| ids.contains(&p.id));
    }

    let events = if payload.include_events {
        store
            .list_events_by_batch(payload.batch_id, payload.event_types.as_deref())
            .await
            .map_err(EngineError::Storage)?
    } else {
        Vec::new()
    };

    let story_artifacts = if payload.include_story_data {
        store
            .list_story_artifacts_by_batch(payload.batch_id)
            .await
            .map_err(EngineError::Storage)?
    } else {
        Vec::new()
    };
    let _ = broker.update_progress(job_id, 50).await;

    let records: Vec<ExportRecord> = participants
        .iter()
        .map(|p| {
            let own_events: Vec<_> = events
                .iter()
                .filter(|e| e.participant_id == p.id)
                .map(|e| serde_json::json!(e))
                .collect();
            let own_artifacts: Vec<_> = story_artifacts
                .iter()
                .filter(|a| a.participant_id == p.id)
                .map(|a| serde_json::json!(a))
                .collect();
            // Survey responses have no dedicated table; they ride along in
            // participant metadata (§9 "everything is JSON").
            let survey_responses = if payload.include_survey_responses {
                p.metadata.get("surveyResponses").cloned()
            } else {
                None
            };
            ExportRecord {
                participant: serde_json::json!(p),
                events: own_events,
                story_artifacts: own_artifacts,
                survey_responses,
            }
        })
        .collect();

    let (bytes, ext) = render(&records, payload.format)?;
    let _ = broker.update_progress(job_id, 80).await;

    let timestamp = records_timestamp();
    let key = format!(
        "{}/batch-{}/{}.{}",
        payload.study_id, payload.batch_id, timestamp, ext
    );
    blob_store
        .put(&key, EXPORT_BUCKET, bytes)
        .await
        .map_err(EngineError::Blob)?;

    let mut batch = store.get_batch(payload.batch_id).await.map_err(EngineError::Storage)?;
    batch.export_path = Some(format!("{EXPORT_BUCKET}/{key}"));
    store.update_batch(batch).await.map_err(EngineError::Storage)?;

    let _ = broker.update_progress(job_id, 100).await;
    Ok(serde_json::json!({ "batchId": payload.batch_id, "exportPath": format!("{EXPORT_BUCKET}/{key}"), "recordCount": records.len() }))
}

/// ISO-8601 timestamp with colons stripped so the result is a valid blob key
/// (§6 key format).
fn records_timestamp() -> String {
    chrono::Utc::now().format("%Y%m%dT%H%M%S%.3fZ").to_string()
}

fn render(records: &[ExportRecord], format: ExportFormat) -> Result<(Vec<u8>, &'static str), EngineError> {
    match format {
        ExportFormat::Json => {
            let bytes = serde_json::to_vec_pretty(records)
                .map_err(|e| EngineError::Internal(format!("export serialization failed: {e}")))?;
            Ok((bytes, "json"))
        }
        ExportFormat::Jsonl => {
            let mut out = Vec::new();
            for record in records {
                serde_json::to_writer(&mut out, record)
                    .map_err(|e| EngineError::Internal(format!("export serialization failed: {e}")))?;
                out.push(b'\n');
            }
            Ok((out, "jsonl"))
        }
        ExportFormat::Csv => {
            let mut out = String::from("participantId,uniqueId,state,eventCount,storyArtifactCount\n");
            for record in records {
                let participant = &record.participant;
                out.push_str(&format!(
                    "{},{},{},{},{}\n",
                    participant["id"].as_str().unwrap_or_default(),
                    participant["unique_id"].as_str().unwrap_or_default(),
                    participant["state"].as_str().unwrap_or_default(),
                    record.events.len(),
                    record.story_artifacts.len(),
                ));
            }
            Ok((out.into_bytes(), "csv"))
        }
    }
}
