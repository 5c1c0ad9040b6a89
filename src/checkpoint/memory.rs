use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{Result, anyhow};
use async_trait::async_trait;

use super::{CheckpointState, CheckpointStore};

/// In-process checkpoint store. State lives as long as the store instance.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    states: Mutex<HashMap<String, CheckpointState>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn save(&self, execute_id: &str, state: &CheckpointState) -> Result<()> {
        self.states
            .lock()
            .map_err(|_| anyhow!("checkpoint store lock poisoned"))?
            .insert(execute_id.to_string(), state.clone());
        Ok(())
    }

    async fn load(&self, execute_id: &str) -> Result<Option<CheckpointState>> {
        Ok(self
            .states
            .lock()
            .map_err(|_| anyhow!("checkpoint store lock poisoned"))?
            .get(execute_id)
            .cloned())
    }

    async fn delete(&self, execute_id: &str) -> Result<()> {
        self.states
            .lock()
            .map_err(|_| anyhow!("checkpoint store lock poisoned"))?
            .remove(execute_id);
        Ok(())
    }
}
