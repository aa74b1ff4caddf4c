//! Core data model (§3 of `SPEC_FULL.md`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::ids::{
    AgentDefinitionId, BatchId, CommentId, ConditionId, ParticipantId, ResearcherId, SessionId,
    StoryArtifactId, StudyId,
};

/// Execution mode declared on a study's configuration document (§3, §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionMode {
    Synchronous,
    Asynchronous,
    /// Reserved; not implemented (open question, §9). Producing a job
    /// against a `Timed` study returns `EngineError::Validation` with a
    /// `NotImplemented` message rather than silently behaving like
    /// `Asynchronous`.
    Timed,
}

/// One stage of a collaborative round (§3 Agent Context, Glossary).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    Author,
    Play,
    Review,
}

impl Phase {
    pub fn index(self) -> usize {
        match self {
            Phase::Author => 0,
            Phase::Play => 1,
            Phase::Review => 2,
        }
    }
}

/// Per-phase time limits, keyed by phase name (§6 study config document).
pub type PhaseTimeLimits = HashMap<Phase, u64>;

/// Collaboration protocol embedded in a study's config document (§3, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollaborationConfig {
    pub enabled: bool,
    pub pairing_method: PairingStrategyKind,
    pub rounds: u32,
    #[serde(default = "default_phases")]
    pub phases_per_round: Vec<Phase>,
    pub feedback_required: bool,
    pub revision_required: bool,
}

fn default_phases() -> Vec<Phase> {
    vec![Phase::Author, Phase::Play, Phase::Review]
}

/// Study configuration document (§3, §6). Unknown extra fields are
/// preserved in `extra` rather than rejected, per §6.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StudyConfig {
    pub execution_mode: ExecutionMode,
    pub collaboration: Option<CollaborationConfig>,
    pub human_role: Option<String>,
    #[serde(default)]
    pub max_play_actions: Option<u32>,
    #[serde(default)]
    pub phase_time_limits: PhaseTimeLimits,
    pub synthetic_partner: Option<SyntheticPartnerConfig>,
    #[serde(default)]
    pub notifications: serde_json::Value,
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyntheticPartnerConfig {
    pub llm_config: Option<LlmConfig>,
    pub response_delay_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    pub provider: String,
    pub model: String,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Study {
    pub id: StudyId,
    pub name: String,
    pub config: StudyConfig,
    pub created_at: DateTime<Utc>,
}

/// Batch status (§3). Monotone along
/// `RUNNING → {PAUSED ↔ RUNNING}* → {COMPLETE | FAILED | DELETING}` (§5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchStatus {
    Draft,
    Queued,
    Running,
    Paused,
    Complete,
    Failed,
    Deleting,
}

impl BatchStatus {
    /// A worker that observes a terminal status MUST NOT mutate
    /// participant state on the batch's behalf (§5).
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            BatchStatus::Complete | BatchStatus::Failed | BatchStatus::Deleting
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    pub id: BatchId,
    pub study_id: StudyId,
    pub name: String,
    pub status: BatchStatus,
    pub actors_created: u32,
    pub actors_completed: u32,
    pub export_path: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl Batch {
    /// Invariant check mirrored at every write site (§3): `actorsCompleted
    /// <= actorsCreated`.
    pub fn check_invariant(&self) -> Result<(), String> {
        if self.actors_completed > self.actors_created {
            return Err(format!(
                "actorsCompleted ({}) exceeds actorsCreated ({}) for batch {}",
                self.actors_completed, self.actors_created, self.id
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActorType {
    Human,
    Synthetic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ParticipantState {
    Enrolled,
    Scheduled,
    Confirmed,
    CheckedIn,
    Active,
    Complete,
    Withdrawn,
    Excluded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ParticipantRole {
    Player,
    Collaborative,
    Evaluator,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairingMetadata {
    pub paired_at: DateTime<Utc>,
    pub strategy: PairingStrategyKind,
    pub matched_by: String,
    #[serde(default)]
    pub overlap_hours: Option<f64>,
    #[serde(default)]
    pub paired_by_researcher_id: Option<ResearcherId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PairingStrategyKind {
    HumanHuman,
    SyntheticSynthetic,
    HumanSynthetic,
    Auto,
}

/// Day of a recurring weekly availability window (§4.6 HUMAN_HUMAN matching).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Weekday {
    Monday,
    Tuesday,
    Wednesday,
    Thursday,
    Friday,
    Saturday,
    Sunday,
}

/// One recurring weekly window a human participant is available, expressed
/// as hours on a 24-hour clock (`startHour < endHour`, both in `0.0..24.0`).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AvailabilityWindow {
    pub day: Weekday,
    pub start_hour: f64,
    pub end_hour: f64,
}

impl AvailabilityWindow {
    /// Hours of overlap with `other`; zero unless both windows fall on the
    /// same day and their hour ranges intersect (§4.6).
    pub fn overlap_hours(&self, other: &AvailabilityWindow) -> f64 {
        if self.day != other.day {
            return 0.0;
        }
        let start = self.start_hour.max(other.start_hour);
        let end = self.end_hour.min(other.end_hour);
        (end - start).max(0.0)
    }
}

/// Sum of overlap across every pair of windows in two weekly schedules
/// (§4.6 HUMAN_HUMAN matching: "hours of same day-of-week × intersection of
/// start..end").
pub fn total_overlap_hours(a: &[AvailabilityWindow], b: &[AvailabilityWindow]) -> f64 {
    a.iter()
        .flat_map(|wa| b.iter().map(move |wb| wa.overlap_hours(wb)))
        .sum()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    pub id: ParticipantId,
    pub batch_id: BatchId,
    pub study_id: StudyId,
    pub condition_id: Option<ConditionId>,
    pub actor_type: ActorType,
    pub state: ParticipantState,
    pub role: ParticipantRole,
    pub llm_config: Option<LlmConfig>,
    pub partner_id: Option<ParticipantId>,
    pub pairing_metadata: Option<PairingMetadata>,
    pub unique_id: String,
    pub metadata: serde_json::Value,
    /// Recurring weekly availability, used by HUMAN_HUMAN pairing to
    /// maximize overlap (§4.6). Empty for synthetic participants and for
    /// humans who haven't reported a schedule.
    #[serde(default)]
    pub availability: Vec<AvailabilityWindow>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Event type enum (§3). Kept open-ended via `Other` so a future event kind
/// doesn't require a store migration, matching the spec's "string enum".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventType {
    SessionStart,
    SessionEnd,
    SyntheticAction,
    SyntheticError,
    SyntheticTimeout,
    StateChange,
    Other(String),
}

impl EventType {
    fn as_str(&self) -> &str {
        match self {
            EventType::SessionStart => "SESSION_START",
            EventType::SessionEnd => "SESSION_END",
            EventType::SyntheticAction => "SYNTHETIC_ACTION",
            EventType::SyntheticError => "SYNTHETIC_ERROR",
            EventType::SyntheticTimeout => "SYNTHETIC_TIMEOUT",
            EventType::StateChange => "state_change",
            EventType::Other(s) => s.as_str(),
        }
    }

    fn parse(raw: &str) -> Self {
        match raw {
            "SESSION_START" => EventType::SessionStart,
            "SESSION_END" => EventType::SessionEnd,
            "SYNTHETIC_ACTION" => EventType::SyntheticAction,
            "SYNTHETIC_ERROR" => EventType::SyntheticError,
            "SYNTHETIC_TIMEOUT" => EventType::SyntheticTimeout,
            "state_change" => EventType::StateChange,
            other => EventType::Other(other.to_string()),
        }
    }
}

impl Serialize for EventType {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EventType {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Ok(EventType::parse(&raw))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub participant_id: ParticipantId,
    pub timestamp: DateTime<Utc>,
    pub event_type: EventType,
    pub data: serde_json::Value,
}

use super::ids::EventId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ArtifactStatus {
    Pending,
    Confirmed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoryArtifact {
    pub id: StoryArtifactId,
    pub participant_id: ParticipantId,
    pub plugin_type: String,
    pub version: u32,
    pub blob_key: String,
    pub bucket: String,
    pub status: ArtifactStatus,
    pub name: String,
    pub description: String,
    pub round: u32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommentType {
    Feedback,
    Praise,
    Suggestion,
    Critique,
    Question,
}

impl CommentType {
    /// Canonical ordering used by `build_feedback_summary` (§4.5, property 9).
    pub fn canonical_order() -> &'static [CommentType] {
        &[
            CommentType::Praise,
            CommentType::Suggestion,
            CommentType::Critique,
            CommentType::Question,
            CommentType::Feedback,
        ]
    }

    /// Parse a free-form LLM-supplied comment type string, defaulting to
    /// `Feedback` for anything unrecognized (§4.9 REVIEW phase).
    pub fn parse_or_feedback(raw: &str) -> Self {
        match raw.to_ascii_uppercase().as_str() {
            "PRAISE" => CommentType::Praise,
            "SUGGESTION" => CommentType::Suggestion,
            "CRITIQUE" => CommentType::Critique,
            "QUESTION" => CommentType::Question,
            _ => CommentType::Feedback,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Comment {
    pub id: CommentId,
    pub author_id: ParticipantId,
    pub target_participant_id: ParticipantId,
    pub story_artifact_id: Option<StoryArtifactId>,
    pub passage_id: Option<String>,
    pub content: String,
    pub comment_type: CommentType,
    pub round: u32,
    pub phase: Phase,
    pub parent_id: Option<CommentId>,
    pub resolved: bool,
    pub addressed_in_round: Option<u32>,
    pub created_at: DateTime<Utc>,
}

/// One entry in an agent context append-only list, tagged by round (§3, §9
/// "everything is JSON" — modeled as a tagged sum type, not a bag of JSON).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OwnStoryDraft {
    pub round: u32,
    pub story_artifact_id: StoryArtifactId,
    pub story_summary: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartnerStoryPlayed {
    pub round: u32,
    pub story_artifact_id: StoryArtifactId,
    pub play_notes: String,
    pub choices_made: Vec<String>,
    pub observations: Vec<String>,
    pub overall_impression: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackGivenEntry {
    pub round: u32,
    pub comment_id: CommentId,
    pub target_participant_id: ParticipantId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackReceivedEntry {
    pub round: u32,
    pub comment_id: CommentId,
    pub author_id: ParticipantId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearningEntry {
    pub round: u32,
    pub tag: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentContext {
    pub participant_id: ParticipantId,
    pub current_round: u32,
    pub current_phase: Phase,
    pub own_story_drafts: Vec<OwnStoryDraft>,
    pub partner_stories_played: Vec<PartnerStoryPlayed>,
    pub feedback_given: Vec<FeedbackGivenEntry>,
    pub feedback_received: Vec<FeedbackReceivedEntry>,
    pub cumulative_learnings: Vec<LearningEntry>,
}

impl AgentContext {
    pub fn new(participant_id: ParticipantId) -> Self {
        Self {
            participant_id,
            current_round: 1,
            current_phase: Phase::Author,
            own_story_drafts: Vec::new(),
            partner_stories_played: Vec::new(),
            feedback_given: Vec::new(),
            feedback_received: Vec::new(),
            cumulative_learnings: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PhaseCompletionStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseCompletion {
    pub participant_id: ParticipantId,
    pub partner_id: ParticipantId,
    pub round: u32,
    pub phase: Phase,
    pub status: PhaseCompletionStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HybridSessionState {
    pub session_id: SessionId,
    pub study_id: StudyId,
    pub participant_a: ParticipantId,
    pub participant_b: ParticipantId,
    pub config: StudyConfig,
    pub completions: Vec<PhaseCompletion>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Job priority (§3, §6). Lower numeric value runs first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum JobPriority {
    RealTime = 1,
    High = 5,
    Normal = 10,
    Low = 20,
}

impl Default for JobPriority {
    fn default() -> Self {
        JobPriority::Normal
    }
}

/// Batch-creation worker input (§4.7, single-actor variant).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchCreationPayload {
    pub batch_id: BatchId,
    pub study_id: StudyId,
    pub actor_count: u32,
    pub role: ParticipantRole,
    pub llm_config: Option<LlmConfig>,
    pub condition_id: Option<ConditionId>,
    pub agent_definition_id: Option<AgentDefinitionId>,
    #[serde(default)]
    pub priority: JobPriority,
}

/// Batch-creation worker input (§4.7, paired variant).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairedBatchCreationPayload {
    pub batch_id: BatchId,
    pub study_id: StudyId,
    pub pair_count: u32,
    pub llm_config: Option<LlmConfig>,
    pub vary_partner_config: bool,
    pub partner_llm_config: Option<LlmConfig>,
    pub condition_id: Option<ConditionId>,
    #[serde(default)]
    pub priority: JobPriority,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    #[serde(default = "default_plugin_type")]
    pub plugin_type: String,
    pub story_id: Option<String>,
    #[serde(default = "default_max_actions")]
    pub max_actions: u32,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_plugin_type() -> String {
    "twine".to_string()
}

fn default_max_actions() -> u32 {
    100
}

fn default_timeout_ms() -> u64 {
    300_000
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            plugin_type: default_plugin_type(),
            story_id: None,
            max_actions: default_max_actions(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

/// Synthetic-execution worker input (§4.8).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyntheticExecutionPayload {
    pub participant_id: ParticipantId,
    pub condition_id: Option<ConditionId>,
    pub batch_execution_id: Option<BatchId>,
    #[serde(default)]
    pub task_config: TaskConfig,
    #[serde(default)]
    pub priority: JobPriority,
}

/// Export worker input (§4.14).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExportFormat {
    Json,
    Jsonl,
    Csv,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportPayload {
    pub batch_id: BatchId,
    pub study_id: StudyId,
    pub format: ExportFormat,
    #[serde(default = "default_true")]
    pub include_events: bool,
    #[serde(default = "default_true")]
    pub include_survey_responses: bool,
    #[serde(default = "default_true")]
    pub include_story_data: bool,
    pub participant_ids: Option<Vec<ParticipantId>>,
    pub event_types: Option<Vec<EventType>>,
}

fn default_true() -> bool {
    true
}

/// Hybrid synthetic-phase worker input (§4.13).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HybridSyntheticPhasePayload {
    pub session_id: SessionId,
    pub synthetic_participant_id: ParticipantId,
    pub human_participant_id: ParticipantId,
    pub phase: Phase,
    pub round: u32,
    pub llm_config: LlmConfig,
    pub response_delay_ms: Option<u64>,
}

/// Outcome returned by a synthetic-execution job (§4.8, §7, §8).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerOutcome {
    Skipped,
    Completed,
    Timeout { actions_executed: u32 },
    Partial,
}
