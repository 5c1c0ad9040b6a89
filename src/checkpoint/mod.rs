pub mod json_store;
pub mod memory;
#[cfg(feature = "redis")]
pub mod redis_store;

use std::collections::{BTreeMap, BTreeSet};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::engine::interrupt::InterruptEvent;
use crate::engine::scope::ScopeState;

pub use json_store::JsonCheckpointStore;
pub use memory::MemoryCheckpointStore;
#[cfg(feature = "redis")]
pub use redis_store::RedisCheckpointStore;

/// Everything needed to continue a suspended execution tree, stored under
/// the root execution ID.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointState {
    pub execute_id: String,
    pub workflow_id: String,
    pub commit_id: String,
    /// Coerced Start node input.
    #[serde(default)]
    pub input: Map<String, Value>,
    #[serde(default)]
    pub root: ScopeState,
    /// Open interrupt events by event ID.
    #[serde(default)]
    pub interrupts: BTreeMap<String, InterruptEvent>,
    /// Event IDs already consumed by a resume.
    #[serde(default)]
    pub resumed: BTreeSet<String>,
    /// Next event sequence number for this execution tree.
    #[serde(default)]
    pub next_seq: u64,
    pub updated_at: DateTime<Utc>,
}

impl CheckpointState {
    pub fn new(execute_id: &str, workflow_id: &str, commit_id: &str, input: Map<String, Value>) -> Self {
        Self {
            execute_id: execute_id.to_string(),
            workflow_id: workflow_id.to_string(),
            commit_id: commit_id.to_string(),
            input,
            root: ScopeState::default(),
            interrupts: BTreeMap::new(),
            resumed: BTreeSet::new(),
            next_seq: 1,
            updated_at: Utc::now(),
        }
    }
}

/// Durable store of in-flight execution state. The single source of truth
/// for which interrupts are outstanding.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn save(&self, execute_id: &str, state: &CheckpointState) -> Result<()>;

    async fn load(&self, execute_id: &str) -> Result<Option<CheckpointState>>;

    /// Remove the checkpoint. Missing checkpoints are not an error.
    async fn delete(&self, execute_id: &str) -> Result<()>;

    /// Open interrupts, oldest first.
    async fn list_open_interrupts(&self, execute_id: &str) -> Result<Vec<InterruptEvent>> {
        let mut events: Vec<InterruptEvent> = match self.load(execute_id).await? {
            Some(state) => state.interrupts.into_values().collect(),
            None => Vec::new(),
        };
        events.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(events)
    }
}
