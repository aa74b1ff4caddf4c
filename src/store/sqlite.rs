//! SQLite-backed [`Store`] (§4.3).
//!
//! Grounded directly on the teacher's `scheduler::job_store::SqliteJobStore`:
//! WAL mode, schema created before the connection is wrapped in a
//! `tokio::sync::Mutex` (so schema init never blocks inside an async
//! context), and one connection shared behind the mutex rather than a pool
//! — SQLite serializes writers anyway. Every multi-statement operation that
//! needs atomicity opens an `IMMEDIATE` transaction so two connections can't
//! interleave a read-modify-write.
//!
//! Most tables pair a handful of indexed columns (used for lookups and
//! joins) with a `json` column holding the full serialized domain struct —
//! the "JSON-valued columns for semi-structured fields" the spec calls for,
//! without hand-rolling a column per field of ten different structs.

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use tokio::sync::Mutex;

use super::Store;
use crate::types::{
    AgentContext, Batch, BatchId, Comment, CommentId, Event, EventId, EventType,
    FeedbackGivenEntry, FeedbackReceivedEntry, HybridSessionState, LearningEntry, OwnStoryDraft,
    PairingMetadata, ParticipantId, ParticipantState, PartnerStoryPlayed, Phase, SessionId, Study,
    StudyId, StoreError, StoryArtifact, StoryArtifactId, ArtifactStatus, Participant,
};

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

fn ser<T: serde::Serialize>(v: &T) -> Result<String, StoreError> {
    serde_json::to_string(v).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn de<T: serde::de::DeserializeOwned>(raw: &str) -> Result<T, StoreError> {
    serde_json::from_str(raw).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn sqlite_err(e: rusqlite::Error) -> StoreError {
    StoreError::Sqlite(e.to_string())
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Sqlite(e.to_string()))?;
        }
        let conn = Connection::open(path).map_err(sqlite_err)?;
        conn.pragma_update(None, "journal_mode", "WAL").map_err(sqlite_err)?;
        Self::init_schema(&conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(sqlite_err)?;
        Self::init_schema(&conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Default database path: `$XDG_DATA_HOME/study-engine/engine.db`.
    pub fn default_path() -> std::path::PathBuf {
        let base = dirs::data_dir().unwrap_or_else(|| std::path::PathBuf::from("."));
        base.join("study-engine").join("engine.db")
    }

    fn init_schema(conn: &Connection) -> Result<(), StoreError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS studies (
                id TEXT PRIMARY KEY,
                json TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS batches (
                id TEXT PRIMARY KEY,
                study_id TEXT NOT NULL,
                json TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_batches_study ON batches(study_id);

            CREATE TABLE IF NOT EXISTS participants (
                id TEXT PRIMARY KEY,
                batch_id TEXT NOT NULL,
                study_id TEXT NOT NULL,
                state TEXT NOT NULL,
                json TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_participants_batch ON participants(batch_id);
            CREATE INDEX IF NOT EXISTS idx_participants_study ON participants(study_id);

            CREATE TABLE IF NOT EXISTS events (
                id TEXT PRIMARY KEY,
                participant_id TEXT NOT NULL,
                event_type TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                json TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_events_participant ON events(participant_id);

            CREATE TABLE IF NOT EXISTS story_artifacts (
                id TEXT PRIMARY KEY,
                participant_id TEXT NOT NULL,
                plugin_type TEXT NOT NULL,
                version INTEGER NOT NULL,
                status TEXT NOT NULL,
                json TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_story_artifacts_participant ON story_artifacts(participant_id, plugin_type);

            CREATE TABLE IF NOT EXISTS agent_contexts (
                participant_id TEXT PRIMARY KEY,
                json TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS comments (
                id TEXT PRIMARY KEY,
                author_id TEXT NOT NULL,
                target_participant_id TEXT NOT NULL,
                parent_id TEXT,
                story_artifact_id TEXT,
                round INTEGER NOT NULL,
                phase TEXT NOT NULL,
                json TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_comments_target ON comments(target_participant_id);
            CREATE INDEX IF NOT EXISTS idx_comments_author ON comments(author_id);
            CREATE INDEX IF NOT EXISTS idx_comments_story ON comments(story_artifact_id);
            CREATE INDEX IF NOT EXISTS idx_comments_parent ON comments(parent_id);

            CREATE TABLE IF NOT EXISTS hybrid_sessions (
                session_id TEXT PRIMARY KEY,
                json TEXT NOT NULL
            );",
        )
        .map_err(sqlite_err)?;
        Ok(())
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn create_study(&self, study: Study) -> Result<Study, StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO studies (id, json) VALUES (?1, ?2)",
            params![study.id.to_string(), ser(&study)?],
        )
        .map_err(sqlite_err)?;
        Ok(study)
    }

    async fn get_study(&self, id: StudyId) -> Result<Study, StoreError> {
        let conn = self.conn.lock().await;
        let raw: String = conn
            .query_row("SELECT json FROM studies WHERE id = ?1", params![id.to_string()], |r| r.get(0))
            .optional()
            .map_err(sqlite_err)?
            .ok_or_else(|| StoreError::NotFound(format!("study {id}")))?;
        de(&raw)
    }

    async fn delete_study_with_relations(&self, id: StudyId) -> Result<(), StoreError> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction().map_err(sqlite_err)?;
        {
            let mut stmt = tx
                .prepare("SELECT state FROM participants WHERE study_id = ?1")
                .map_err(sqlite_err)?;
            let blocking = [
                ParticipantState::Active,
                ParticipantState::Scheduled,
                ParticipantState::Confirmed,
                ParticipantState::CheckedIn,
            ];
            let states: Vec<String> = stmt
                .query_map(params![id.to_string()], |r| r.get::<_, String>(0))
                .map_err(sqlite_err)?
                .collect::<Result<_, _>>()
                .map_err(sqlite_err)?;
            for raw in states {
                let state: ParticipantState = de(&raw)?;
                if blocking.contains(&state) {
                    return Err(StoreError::Conflict(format!(
                        "study {id} has a participant in state {raw}; cannot delete"
                    )));
                }
            }
        }
        tx.execute(
            "DELETE FROM events WHERE participant_id IN (SELECT id FROM participants WHERE study_id = ?1)",
            params![id.to_string()],
        )
        .map_err(sqlite_err)?;
        tx.execute(
            "DELETE FROM story_artifacts WHERE participant_id IN (SELECT id FROM participants WHERE study_id = ?1)",
            params![id.to_string()],
        )
        .map_err(sqlite_err)?;
        tx.execute(
            "DELETE FROM comments WHERE author_id IN (SELECT id FROM participants WHERE study_id = ?1)
                OR target_participant_id IN (SELECT id FROM participants WHERE study_id = ?1)",
            params![id.to_string()],
        )
        .map_err(sqlite_err)?;
        tx.execute(
            "DELETE FROM agent_contexts WHERE participant_id IN (SELECT id FROM participants WHERE study_id = ?1)",
            params![id.to_string()],
        )
        .map_err(sqlite_err)?;
        tx.execute("DELETE FROM participants WHERE study_id = ?1", params![id.to_string()])
            .map_err(sqlite_err)?;
        tx.execute("DELETE FROM batches WHERE study_id = ?1", params![id.to_string()])
            .map_err(sqlite_err)?;
        tx.execute("DELETE FROM studies WHERE id = ?1", params![id.to_string()])
            .map_err(sqlite_err)?;
        tx.commit().map_err(sqlite_err)?;
        Ok(())
    }

    async fn create_batch_with_actors(
        &self,
        mut batch: Batch,
        participants: Vec<Participant>,
    ) -> Result<(), StoreError> {
        batch.actors_created = participants.len() as u32;
        batch.check_invariant().map_err(StoreError::Conflict)?;
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate).map_err(sqlite_err)?;
        tx.execute(
            "INSERT INTO batches (id, study_id, json) VALUES (?1, ?2, ?3)",
            params![batch.id.to_string(), batch.study_id.to_string(), ser(&batch)?],
        )
        .map_err(sqlite_err)?;
        for p in &participants {
            tx.execute(
                "INSERT INTO participants (id, batch_id, study_id, state, json) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    p.id.to_string(),
                    p.batch_id.to_string(),
                    p.study_id.to_string(),
                    ser(&p.state)?,
                    ser(p)?,
                ],
            )
            .map_err(sqlite_err)?;
        }
        tx.commit().map_err(sqlite_err)?;
        Ok(())
    }

    async fn insert_participants(&self, participants: Vec<Participant>) -> Result<(), StoreError> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate).map_err(sqlite_err)?;
        for p in &participants {
            tx.execute(
                "INSERT INTO participants (id, batch_id, study_id, state, json) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    p.id.to_string(),
                    p.batch_id.to_string(),
                    p.study_id.to_string(),
                    ser(&p.state)?,
                    ser(p)?,
                ],
            )
            .map_err(sqlite_err)?;
        }
        tx.commit().map_err(sqlite_err)?;
        Ok(())
    }

    async fn get_batch(&self, id: BatchId) -> Result<Batch, StoreError> {
        let conn = self.conn.lock().await;
        let raw: String = conn
            .query_row("SELECT json FROM batches WHERE id = ?1", params![id.to_string()], |r| r.get(0))
            .optional()
            .map_err(sqlite_err)?
            .ok_or_else(|| StoreError::NotFound(format!("batch {id}")))?;
        de(&raw)
    }

    async fn update_batch(&self, batch: Batch) -> Result<(), StoreError> {
        batch.check_invariant().map_err(StoreError::Conflict)?;
        let conn = self.conn.lock().await;
        let changed = conn
            .execute(
                "UPDATE batches SET json = ?2 WHERE id = ?1",
                params![batch.id.to_string(), ser(&batch)?],
            )
            .map_err(sqlite_err)?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("batch {}", batch.id)));
        }
        Ok(())
    }

    async fn list_participants_by_batch(&self, batch_id: BatchId) -> Result<Vec<Participant>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare("SELECT json FROM participants WHERE batch_id = ?1")
            .map_err(sqlite_err)?;
        let rows: Vec<String> = stmt
            .query_map(params![batch_id.to_string()], |r| r.get(0))
            .map_err(sqlite_err)?
            .collect::<Result<_, _>>()
            .map_err(sqlite_err)?;
        rows.iter().map(|r| de(r)).collect()
    }

    async fn get_participant(&self, id: ParticipantId) -> Result<Participant, StoreError> {
        let conn = self.conn.lock().await;
        let raw: String = conn
            .query_row("SELECT json FROM participants WHERE id = ?1", params![id.to_string()], |r| r.get(0))
            .optional()
            .map_err(sqlite_err)?
            .ok_or_else(|| StoreError::NotFound(format!("participant {id}")))?;
        de(&raw)
    }

    async fn update_participant(&self, participant: Participant) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        let changed = conn
            .execute(
                "UPDATE participants SET state = ?2, json = ?3 WHERE id = ?1",
                params![participant.id.to_string(), ser(&participant.state)?, ser(&participant)?],
            )
            .map_err(sqlite_err)?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("participant {}", participant.id)));
        }
        Ok(())
    }

    async fn update_participant_with_event(
        &self,
        id: ParticipantId,
        new_state: ParticipantState,
        event_data: serde_json::Value,
    ) -> Result<Event, StoreError> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate).map_err(sqlite_err)?;
        let raw: String = tx
            .query_row("SELECT json FROM participants WHERE id = ?1", params![id.to_string()], |r| r.get(0))
            .optional()
            .map_err(sqlite_err)?
            .ok_or_else(|| StoreError::NotFound(format!("participant {id}")))?;
        let mut participant: Participant = de(&raw)?;
        let previous_state = participant.state;
        participant.state = new_state;
        if new_state == ParticipantState::Complete {
            participant.completed_at = Some(chrono::Utc::now());
        }
        tx.execute(
            "UPDATE participants SET state = ?2, json = ?3 WHERE id = ?1",
            params![id.to_string(), ser(&new_state)?, ser(&participant)?],
        )
        .map_err(sqlite_err)?;

        let mut data = serde_json::Map::new();
        data.insert("previousState".to_string(), serde_json::json!(previous_state));
        data.insert("newState".to_string(), serde_json::json!(new_state));
        if let serde_json::Value::Object(extra) = event_data {
            for (k, v) in extra {
                data.insert(k, v);
            }
        }
        let event = Event {
            id: EventId::new(),
            participant_id: id,
            timestamp: chrono::Utc::now(),
            event_type: EventType::StateChange,
            data: serde_json::Value::Object(data),
        };
        tx.execute(
            "INSERT INTO events (id, participant_id, event_type, timestamp, json) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                event.id.to_string(),
                event.participant_id.to_string(),
                ser(&event.event_type)?,
                event.timestamp.to_rfc3339(),
                ser(&event)?,
            ],
        )
        .map_err(sqlite_err)?;
        tx.commit().map_err(sqlite_err)?;
        Ok(event)
    }

    async fn pair_participants(
        &self,
        a: ParticipantId,
        b: ParticipantId,
        metadata: PairingMetadata,
    ) -> Result<(), StoreError> {
        if a == b {
            return Err(StoreError::Conflict(format!("cannot pair participant {a} with themselves")));
        }
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate).map_err(sqlite_err)?;

        // Re-reads both rows inside this transaction rather than trusting a
        // caller's earlier read, so two concurrent pairing attempts that
        // both target `a` can't both pass the already-paired check before
        // either commits (§4.6, §5 shared-resource policy).
        let mut rows = Vec::with_capacity(2);
        for id in [a, b] {
            let raw: String = tx
                .query_row("SELECT json FROM participants WHERE id = ?1", params![id.to_string()], |r| r.get(0))
                .optional()
                .map_err(sqlite_err)?
                .ok_or_else(|| StoreError::NotFound(format!("participant {id}")))?;
            rows.push(de::<Participant>(&raw)?);
        }
        let (mut participant_a, mut participant_b) = (rows.remove(0), rows.remove(0));

        if participant_a.study_id != participant_b.study_id {
            return Err(StoreError::Conflict("participants are not in the same study".to_string()));
        }
        if participant_a.partner_id.is_some() {
            return Err(StoreError::Conflict(format!("participant {a} already has a partner")));
        }
        if participant_b.partner_id.is_some() {
            return Err(StoreError::Conflict(format!("participant {b} already has a partner")));
        }

        participant_a.partner_id = Some(b);
        participant_a.pairing_metadata = Some(metadata.clone());
        participant_b.partner_id = Some(a);
        participant_b.pairing_metadata = Some(metadata);
        for (id, p) in [(a, &participant_a), (b, &participant_b)] {
            tx.execute(
                "UPDATE participants SET json = ?2 WHERE id = ?1",
                params![id.to_string(), ser(p)?],
            )
            .map_err(sqlite_err)?;
        }
        tx.commit().map_err(sqlite_err)?;
        Ok(())
    }

    async fn unpair_participant(&self, participant_id: ParticipantId) -> Result<(), StoreError> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate).map_err(sqlite_err)?;
        let raw: String = tx
            .query_row("SELECT json FROM participants WHERE id = ?1", params![participant_id.to_string()], |r| r.get(0))
            .optional()
            .map_err(sqlite_err)?
            .ok_or_else(|| StoreError::NotFound(format!("participant {participant_id}")))?;
        let mut p: Participant = de(&raw)?;
        let partner = p.partner_id.take();
        p.pairing_metadata = None;
        tx.execute(
            "UPDATE participants SET json = ?2 WHERE id = ?1",
            params![participant_id.to_string(), ser(&p)?],
        )
        .map_err(sqlite_err)?;
        if let Some(partner) = partner {
            if let Some(raw) = tx
                .query_row("SELECT json FROM participants WHERE id = ?1", params![partner.to_string()], |r| r.get::<_, String>(0))
                .optional()
                .map_err(sqlite_err)?
            {
                let mut other: Participant = de(&raw)?;
                other.partner_id = None;
                other.pairing_metadata = None;
                tx.execute(
                    "UPDATE participants SET json = ?2 WHERE id = ?1",
                    params![partner.to_string(), ser(&other)?],
                )
                .map_err(sqlite_err)?;
            }
        }
        tx.commit().map_err(sqlite_err)?;
        Ok(())
    }

    async fn append_event(&self, event: Event) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO events (id, participant_id, event_type, timestamp, json) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                event.id.to_string(),
                event.participant_id.to_string(),
                ser(&event.event_type)?,
                event.timestamp.to_rfc3339(),
                ser(&event)?,
            ],
        )
        .map_err(sqlite_err)?;
        Ok(())
    }

    async fn list_events_by_participant(&self, participant_id: ParticipantId) -> Result<Vec<Event>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare("SELECT json FROM events WHERE participant_id = ?1 ORDER BY timestamp ASC")
            .map_err(sqlite_err)?;
        let rows: Vec<String> = stmt
            .query_map(params![participant_id.to_string()], |r| r.get(0))
            .map_err(sqlite_err)?
            .collect::<Result<_, _>>()
            .map_err(sqlite_err)?;
        rows.iter().map(|r| de(r)).collect()
    }

    async fn list_events_by_batch(
        &self,
        batch_id: BatchId,
        event_types: Option<&[EventType]>,
    ) -> Result<Vec<Event>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT e.json FROM events e
                 JOIN participants p ON p.id = e.participant_id
                 WHERE p.batch_id = ?1
                 ORDER BY e.timestamp ASC",
            )
            .map_err(sqlite_err)?;
        let rows: Vec<String> = stmt
            .query_map(params![batch_id.to_string()], |r| r.get(0))
            .map_err(sqlite_err)?
            .collect::<Result<_, _>>()
            .map_err(sqlite_err)?;
        let events: Vec<Event> = rows.iter().map(|r| de(r)).collect::<Result<_, _>>()?;
        match event_types {
            None => Ok(events),
            Some(types) => Ok(events.into_iter().filter(|e| types.contains(&e.event_type)).collect()),
        }
    }

    async fn reserve_story_version(
        &self,
        participant_id: ParticipantId,
        plugin_type: &str,
        round: u32,
        bucket: &str,
    ) -> Result<StoryArtifact, StoreError> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate).map_err(sqlite_err)?;
        let max_version: Option<u32> = tx
            .query_row(
                "SELECT MAX(version) FROM story_artifacts WHERE participant_id = ?1 AND plugin_type = ?2",
                params![participant_id.to_string(), plugin_type],
                |r| r.get(0),
            )
            .map_err(sqlite_err)?;
        let version = max_version.unwrap_or(0) + 1;
        let now = chrono::Utc::now();
        let blob_key = format!(
            "stories/{participant_id}/{plugin_type}/v{version}_{}.json",
            now.timestamp_millis()
        );
        let artifact = StoryArtifact {
            id: StoryArtifactId::new(),
            participant_id,
            plugin_type: plugin_type.to_string(),
            version,
            blob_key,
            bucket: bucket.to_string(),
            status: ArtifactStatus::Pending,
            name: String::new(),
            description: String::new(),
            round,
            created_at: now,
        };
        tx.execute(
            "INSERT INTO story_artifacts (id, participant_id, plugin_type, version, status, json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                artifact.id.to_string(),
                artifact.participant_id.to_string(),
                artifact.plugin_type,
                artifact.version,
                ser(&artifact.status)?,
                ser(&artifact)?,
            ],
        )
        .map_err(sqlite_err)?;
        tx.commit().map_err(sqlite_err)?;
        Ok(artifact)
    }

    async fn confirm_story_artifact(
        &self,
        id: StoryArtifactId,
        name: &str,
        description: &str,
    ) -> Result<StoryArtifact, StoreError> {
        let conn = self.conn.lock().await;
        let raw: String = conn
            .query_row("SELECT json FROM story_artifacts WHERE id = ?1", params![id.to_string()], |r| r.get(0))
            .optional()
            .map_err(sqlite_err)?
            .ok_or_else(|| StoreError::NotFound(format!("story artifact {id}")))?;
        let mut artifact: StoryArtifact = de(&raw)?;
        artifact.status = ArtifactStatus::Confirmed;
        artifact.name = name.to_string();
        artifact.description = description.to_string();
        conn.execute(
            "UPDATE story_artifacts SET status = ?2, json = ?3 WHERE id = ?1",
            params![id.to_string(), ser(&artifact.status)?, ser(&artifact)?],
        )
        .map_err(sqlite_err)?;
        Ok(artifact)
    }

    async fn delete_story_artifact(&self, id: StoryArtifactId) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute("DELETE FROM story_artifacts WHERE id = ?1", params![id.to_string()])
            .map_err(sqlite_err)?;
        Ok(())
    }

    async fn get_story_artifact(&self, id: StoryArtifactId) -> Result<StoryArtifact, StoreError> {
        let conn = self.conn.lock().await;
        let raw: String = conn
            .query_row("SELECT json FROM story_artifacts WHERE id = ?1", params![id.to_string()], |r| r.get(0))
            .optional()
            .map_err(sqlite_err)?
            .ok_or_else(|| StoreError::NotFound(format!("story artifact {id}")))?;
        de(&raw)
    }

    async fn latest_story_artifact(
        &self,
        participant_id: ParticipantId,
        plugin_type: &str,
        round: Option<u32>,
    ) -> Result<Option<StoryArtifact>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT json FROM story_artifacts
                 WHERE participant_id = ?1 AND plugin_type = ?2 AND status = ?3
                 ORDER BY version DESC",
            )
            .map_err(sqlite_err)?;
        let rows: Vec<String> = stmt
            .query_map(
                params![participant_id.to_string(), plugin_type, ser(&ArtifactStatus::Confirmed)?],
                |r| r.get(0),
            )
            .map_err(sqlite_err)?
            .collect::<Result<_, _>>()
            .map_err(sqlite_err)?;
        for raw in rows {
            let artifact: StoryArtifact = de(&raw)?;
            if round.is_none() || round == Some(artifact.round) {
                return Ok(Some(artifact));
            }
        }
        Ok(None)
    }

    async fn list_story_artifacts_by_batch(&self, batch_id: BatchId) -> Result<Vec<StoryArtifact>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT s.json FROM story_artifacts s
                 JOIN participants p ON p.id = s.participant_id
                 WHERE p.batch_id = ?1",
            )
            .map_err(sqlite_err)?;
        let rows: Vec<String> = stmt
            .query_map(params![batch_id.to_string()], |r| r.get(0))
            .map_err(sqlite_err)?
            .collect::<Result<_, _>>()
            .map_err(sqlite_err)?;
        rows.iter().map(|r| de(r)).collect()
    }

    async fn get_or_create_agent_context(&self, participant_id: ParticipantId) -> Result<AgentContext, StoreError> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate).map_err(sqlite_err)?;
        let existing: Option<String> = tx
            .query_row(
                "SELECT json FROM agent_contexts WHERE participant_id = ?1",
                params![participant_id.to_string()],
                |r| r.get(0),
            )
            .optional()
            .map_err(sqlite_err)?;
        let ctx = match existing {
            Some(raw) => de(&raw)?,
            None => {
                let ctx = AgentContext::new(participant_id);
                tx.execute(
                    "INSERT INTO agent_contexts (participant_id, json) VALUES (?1, ?2)",
                    params![participant_id.to_string(), ser(&ctx)?],
                )
                .map_err(sqlite_err)?;
                ctx
            }
        };
        tx.commit().map_err(sqlite_err)?;
        Ok(ctx)
    }

    async fn update_agent_phase(&self, participant_id: ParticipantId, phase: Phase) -> Result<AgentContext, StoreError> {
        self.with_agent_context(participant_id, |ctx| ctx.current_phase = phase).await
    }

    async fn advance_agent_round(&self, participant_id: ParticipantId) -> Result<AgentContext, StoreError> {
        self.with_agent_context(participant_id, |ctx| {
            ctx.current_round += 1;
            ctx.current_phase = Phase::Author;
        })
        .await
    }

    async fn append_own_draft(&self, participant_id: ParticipantId, entry: OwnStoryDraft) -> Result<AgentContext, StoreError> {
        self.with_agent_context(participant_id, |ctx| ctx.own_story_drafts.push(entry)).await
    }

    async fn append_partner_story_played(&self, participant_id: ParticipantId, entry: PartnerStoryPlayed) -> Result<AgentContext, StoreError> {
        self.with_agent_context(participant_id, |ctx| ctx.partner_stories_played.push(entry)).await
    }

    async fn append_feedback_given(&self, participant_id: ParticipantId, entry: FeedbackGivenEntry) -> Result<AgentContext, StoreError> {
        self.with_agent_context(participant_id, |ctx| ctx.feedback_given.push(entry)).await
    }

    async fn append_feedback_received(&self, participant_id: ParticipantId, entry: FeedbackReceivedEntry) -> Result<AgentContext, StoreError> {
        self.with_agent_context(participant_id, |ctx| ctx.feedback_received.push(entry)).await
    }

    async fn append_learning(&self, participant_id: ParticipantId, entry: LearningEntry) -> Result<AgentContext, StoreError> {
        self.with_agent_context(participant_id, |ctx| ctx.cumulative_learnings.push(entry)).await
    }

    async fn create_comment(&self, comment: Comment) -> Result<Comment, StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO comments (id, author_id, target_participant_id, parent_id, story_artifact_id, round, phase, json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                comment.id.to_string(),
                comment.author_id.to_string(),
                comment.target_participant_id.to_string(),
                comment.parent_id.map(|id| id.to_string()),
                comment.story_artifact_id.map(|id| id.to_string()),
                comment.round,
                ser(&comment.phase)?,
                ser(&comment)?,
            ],
        )
        .map_err(sqlite_err)?;
        Ok(comment)
    }

    async fn get_comment(&self, id: CommentId) -> Result<Comment, StoreError> {
        let conn = self.conn.lock().await;
        let raw: String = conn
            .query_row("SELECT json FROM comments WHERE id = ?1", params![id.to_string()], |r| r.get(0))
            .optional()
            .map_err(sqlite_err)?
            .ok_or_else(|| StoreError::NotFound(format!("comment {id}")))?;
        de(&raw)
    }

    async fn list_comments_received(&self, participant_id: ParticipantId) -> Result<Vec<Comment>, StoreError> {
        self.list_comments_by("target_participant_id", &participant_id.to_string()).await
    }

    async fn list_comments_authored(&self, participant_id: ParticipantId) -> Result<Vec<Comment>, StoreError> {
        self.list_comments_by("author_id", &participant_id.to_string()).await
    }

    async fn list_comments_by_story(&self, story_artifact_id: StoryArtifactId) -> Result<Vec<Comment>, StoreError> {
        self.list_comments_by("story_artifact_id", &story_artifact_id.to_string()).await
    }

    async fn list_comments_for_round_phase(
        &self,
        target_participant_id: ParticipantId,
        round: u32,
        phase: Phase,
    ) -> Result<Vec<Comment>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT json FROM comments WHERE target_participant_id = ?1 AND round = ?2 AND phase = ?3",
            )
            .map_err(sqlite_err)?;
        let rows: Vec<String> = stmt
            .query_map(params![target_participant_id.to_string(), round, ser(&phase)?], |r| r.get(0))
            .map_err(sqlite_err)?
            .collect::<Result<_, _>>()
            .map_err(sqlite_err)?;
        rows.iter().map(|r| de(r)).collect()
    }

    async fn list_replies(&self, parent_id: CommentId) -> Result<Vec<Comment>, StoreError> {
        self.list_comments_by("parent_id", &parent_id.to_string()).await
    }

    async fn resolve_comment(&self, id: CommentId, addressed_in_round: u32) -> Result<Comment, StoreError> {
        self.with_comment(id, |c| {
            c.resolved = true;
            c.addressed_in_round = Some(addressed_in_round);
        })
        .await
    }

    async fn unresolve_comment(&self, id: CommentId) -> Result<Comment, StoreError> {
        self.with_comment(id, |c| {
            c.resolved = false;
            c.addressed_in_round = None;
        })
        .await
    }

    async fn update_comment_content(&self, id: CommentId, content: &str) -> Result<Comment, StoreError> {
        self.with_comment(id, |c| c.content = content.to_string()).await
    }

    async fn delete_comment_cascade_one_level(&self, id: CommentId) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute("DELETE FROM comments WHERE parent_id = ?1", params![id.to_string()])
            .map_err(sqlite_err)?;
        conn.execute("DELETE FROM comments WHERE id = ?1", params![id.to_string()])
            .map_err(sqlite_err)?;
        Ok(())
    }

    async fn create_hybrid_session(&self, state: HybridSessionState) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO hybrid_sessions (session_id, json) VALUES (?1, ?2)",
            params![state.session_id.to_string(), ser(&state)?],
        )
        .map_err(sqlite_err)?;
        Ok(())
    }

    async fn get_hybrid_session(&self, id: SessionId) -> Result<HybridSessionState, StoreError> {
        let conn = self.conn.lock().await;
        let raw: String = conn
            .query_row("SELECT json FROM hybrid_sessions WHERE session_id = ?1", params![id.to_string()], |r| r.get(0))
            .optional()
            .map_err(sqlite_err)?
            .ok_or_else(|| StoreError::NotFound(format!("hybrid session {id}")))?;
        de(&raw)
    }

    async fn save_hybrid_session(&self, state: HybridSessionState) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        let changed = conn
            .execute(
                "UPDATE hybrid_sessions SET json = ?2 WHERE session_id = ?1",
                params![state.session_id.to_string(), ser(&state)?],
            )
            .map_err(sqlite_err)?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("hybrid session {}", state.session_id)));
        }
        Ok(())
    }
}

impl SqliteStore {
    async fn with_agent_context(
        &self,
        participant_id: ParticipantId,
        f: impl FnOnce(&mut AgentContext) + Send,
    ) -> Result<AgentContext, StoreError> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate).map_err(sqlite_err)?;
        let raw: String = tx
            .query_row(
                "SELECT json FROM agent_contexts WHERE participant_id = ?1",
                params![participant_id.to_string()],
                |r| r.get(0),
            )
            .optional()
            .map_err(sqlite_err)?
            .unwrap_or_else(|| ser(&AgentContext::new(participant_id)).expect("AgentContext serializes"));
        let mut ctx: AgentContext = de(&raw)?;
        f(&mut ctx);
        tx.execute(
            "INSERT OR REPLACE INTO agent_contexts (participant_id, json) VALUES (?1, ?2)",
            params![participant_id.to_string(), ser(&ctx)?],
        )
        .map_err(sqlite_err)?;
        tx.commit().map_err(sqlite_err)?;
        Ok(ctx)
    }

    async fn with_comment(
        &self,
        id: CommentId,
        f: impl FnOnce(&mut Comment) + Send,
    ) -> Result<Comment, StoreError> {
        let conn = self.conn.lock().await;
        let raw: String = conn
            .query_row("SELECT json FROM comments WHERE id = ?1", params![id.to_string()], |r| r.get(0))
            .optional()
            .map_err(sqlite_err)?
            .ok_or_else(|| StoreError::NotFound(format!("comment {id}")))?;
        let mut comment: Comment = de(&raw)?;
        f(&mut comment);
        conn.execute(
            "UPDATE comments SET json = ?2 WHERE id = ?1",
            params![id.to_string(), ser(&comment)?],
        )
        .map_err(sqlite_err)?;
        Ok(comment)
    }

    async fn list_comments_by(&self, column: &str, value: &str) -> Result<Vec<Comment>, StoreError> {
        let conn = self.conn.lock().await;
        let sql = format!("SELECT json FROM comments WHERE {column} = ?1");
        let mut stmt = conn.prepare(&sql).map_err(sqlite_err)?;
        let rows: Vec<String> = stmt
            .query_map(params![value], |r| r.get(0))
            .map_err(sqlite_err)?
            .collect::<Result<_, _>>()
            .map_err(sqlite_err)?;
        rows.iter().map(|r| de(r)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ActorType, ParticipantRole, StudyConfig, ExecutionMode};

    fn sample_study() -> Study {
        Study {
            id: StudyId::new(),
            name: "test study".to_string(),
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

    fn sample_participant(batch_id: BatchId, study_id: StudyId) -> Participant {
        Participant {
            id: ParticipantId::new(),
            batch_id,
            study_id,
            condition_id: None,
            actor_type: ActorType::Synthetic,
            state: ParticipantState::Enrolled,
            role: ParticipantRole::Player,
            llm_config: None,
            partner_id: None,
            pairing_metadata: None,
            unique_id: "p-1".to_string(),
            metadata: serde_json::Value::Null,
            availability: Vec::new(),
            created_at: chrono::Utc::now(),
            completed_at: None,
        }
    }

    #[tokio::test]
    async fn create_and_get_study_round_trips() {
        let store = SqliteStore::open_in_memory().unwrap();
        let study = sample_study();
        store.create_study(study.clone()).await.unwrap();
        let fetched = store.get_study(study.id).await.unwrap();
        assert_eq!(fetched.name, study.name);
    }

    #[tokio::test]
    async fn update_participant_with_event_appends_state_change() {
        let store = SqliteStore::open_in_memory().unwrap();
        let study = sample_study();
        store.create_study(study.clone()).await.unwrap();
        let batch = Batch {
            id: BatchId::new(),
            study_id: study.id,
            name: "batch".to_string(),
            status: crate::types::BatchStatus::Running,
            actors_created: 0,
            actors_completed: 0,
            export_path: None,
            started_at: None,
            completed_at: None,
            error: None,
        };
        let participant = sample_participant(batch.id, study.id);
        store
            .create_batch_with_actors(batch.clone(), vec![participant.clone()])
            .await
            .unwrap();

        let event = store
            .update_participant_with_event(participant.id, ParticipantState::Active, serde_json::json!({}))
            .await
            .unwrap();
        assert_eq!(event.event_type, EventType::StateChange);

        let updated = store.get_participant(participant.id).await.unwrap();
        assert_eq!(updated.state, ParticipantState::Active);

        let events = store.list_events_by_participant(participant.id).await.unwrap();
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn story_version_reservation_is_dense() {
        let store = SqliteStore::open_in_memory().unwrap();
        let participant_id = ParticipantId::new();
        let a = store.reserve_story_version(participant_id, "twine", 1, "default").await.unwrap();
        let b = store.reserve_story_version(participant_id, "twine", 1, "default").await.unwrap();
        assert_eq!(a.version, 1);
        assert_eq!(b.version, 2);
        let confirmed = store.confirm_story_artifact(a.id, "name", "desc").await.unwrap();
        assert_eq!(confirmed.status, ArtifactStatus::Confirmed);
    }

    #[tokio::test]
    async fn pair_participants_is_symmetric() {
        let store = SqliteStore::open_in_memory().unwrap();
        let study = sample_study();
        store.create_study(study.clone()).await.unwrap();
        let batch = Batch {
            id: BatchId::new(),
            study_id: study.id,
            name: "batch".to_string(),
            status: crate::types::BatchStatus::Running,
            actors_created: 0,
            actors_completed: 0,
            export_path: None,
            started_at: None,
            completed_at: None,
            error: None,
        };
        let p1 = sample_participant(batch.id, study.id);
        let p2 = sample_participant(batch.id, study.id);
        store
            .create_batch_with_actors(batch.clone(), vec![p1.clone(), p2.clone()])
            .await
            .unwrap();

        let metadata = PairingMetadata {
            paired_at: chrono::Utc::now(),
            strategy: crate::types::PairingStrategyKind::Auto,
            matched_by: "test".to_string(),
            overlap_hours: None,
            paired_by_researcher_id: None,
        };
        store.pair_participants(p1.id, p2.id, metadata).await.unwrap();

        let got1 = store.get_participant(p1.id).await.unwrap();
        let got2 = store.get_participant(p2.id).await.unwrap();
        assert_eq!(got1.partner_id, Some(p2.id));
        assert_eq!(got2.partner_id, Some(p1.id));

        store.unpair_participant(p1.id).await.unwrap();
        let got1 = store.get_participant(p1.id).await.unwrap();
        let got2 = store.get_participant(p2.id).await.unwrap();
        assert_eq!(got1.partner_id, None);
        assert_eq!(got2.partner_id, None);
    }
}
