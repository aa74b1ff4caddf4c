//! Prelude for binaries embedding the engine.
//!
//! Import everything a caller needs to stand up a [`StudyEngine`] with one
//! line:
//!
//! ```ignore
//! use study_engine::prelude::*;
//! ```

pub use crate::config::Config;
pub use crate::types::*;
pub use crate::{StudyEngine, StudyEngineError};

pub use crate::blob_store::{BlobStore, LocalBlobStore};
pub use crate::broker::{memory::InMemoryBroker, queue_names, Broker};
pub use crate::llm_client::{LlmClient, StubLlmClient};
pub use crate::store::{sqlite::SqliteStore, Store};
pub use crate::story_plugin::{PluginRegistry, StoryPlugin, TwinePlugin};

pub use crate::orchestrator::collaborative::CollaborativeOrchestrator;
pub use crate::orchestrator::hybrid::{HybridOrchestrator, NullEventSink};
