//! Newtype identifiers used across the engine.
//!
//! Every row type in the store is addressed by one of these instead of a
//! bare `Uuid`, so a `ParticipantId` can never be passed where a `BatchId`
//! is expected.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! uuid_id {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn from_uuid(id: Uuid) -> Self {
                Self(id)
            }

            pub fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(Uuid::parse_str(s)?))
            }
        }
    };
}

uuid_id!(StudyId);
uuid_id!(BatchId);
uuid_id!(ConditionId);
uuid_id!(ParticipantId);
uuid_id!(EventId);
uuid_id!(StoryArtifactId);
uuid_id!(CommentId);
uuid_id!(SessionId);
uuid_id!(JobId);
uuid_id!(AgentDefinitionId);
uuid_id!(ResearcherId);

/// The first 8 characters of a batch id, used as a human-scannable prefix
/// for generated participant `uniqueId`s (see §4.7 of the engine spec).
pub fn batch_prefix(batch_id: BatchId) -> String {
    batch_id.to_string().chars().take(8).collect()
}

/// Turns a human-readable idempotency key (e.g. `exec-{batchId}-{participantId}`,
/// §4.7/§4.1 property 6) into a stable [`JobId`]: the same key always yields
/// the same UUID, so re-enqueuing with the same logical key hits the
/// broker's idempotent-on-`job_id` path rather than minting a new job.
pub fn deterministic_job_id(key: &str) -> JobId {
    JobId::from_uuid(Uuid::new_v5(&Uuid::NAMESPACE_OID, key.as_bytes()))
}
