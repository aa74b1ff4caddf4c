//! Low-latency `batch → status` cache (§4.2).
//!
//! Backed by a `DashMap`, the same concurrent map the teacher reaches for
//! in the scheduler (`scheduler::mod::AgentStatus` bookkeeping). Writers
//! update the cache and the store inside the same logical operation;
//! readers prefer the cache and fall back to the store. The invariant a
//! stale cache must never violate: it never reports a terminal status for
//! a batch that is actually non-terminal (§4.2).

use dashmap::DashMap;
use std::time::{Duration, Instant};

use crate::types::{BatchId, BatchStatus};

const DEFAULT_TTL: Duration = Duration::from_secs(3600);

struct Entry {
    status: BatchStatus,
    expires_at: Instant,
}

pub struct StatusCache {
    entries: DashMap<BatchId, Entry>,
    default_ttl: Duration,
}

impl StatusCache {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            default_ttl: DEFAULT_TTL,
        }
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            default_ttl: ttl,
        }
    }

    pub fn set(&self, batch_id: BatchId, status: BatchStatus, ttl: Option<Duration>) {
        self.entries.insert(
            batch_id,
            Entry {
                status,
                expires_at: Instant::now() + ttl.unwrap_or(self.default_ttl),
            },
        );
    }

    /// Returns `None` on a cache miss or expiry — callers fall back to the
    /// store in that case (§4.2).
    pub fn get(&self, batch_id: BatchId) -> Option<BatchStatus> {
        match self.entries.get(&batch_id) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.status),
            Some(_) => {
                drop(self.entries.get(&batch_id));
                self.entries.remove(&batch_id);
                None
            }
            None => None,
        }
    }

    pub fn delete(&self, batch_id: BatchId) {
        self.entries.remove(&batch_id);
    }
}

impl Default for StatusCache {
    fn default() -> Self {
        Self::new()
    }
}
