use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{CheckpointState, CheckpointStore};

/// File-based checkpoint store. Each execution tree is one JSON file,
/// replaced atomically on every save.
pub struct JsonCheckpointStore {
    base_dir: PathBuf,
    lock: RwLock<()>,
}

impl JsonCheckpointStore {
    pub fn new(base_dir: impl AsRef<Path>) -> Self {
        Self {
            base_dir: base_dir.as_ref().to_path_buf(),
            lock: RwLock::new(()),
        }
    }

    fn path(&self, execute_id: &str) -> PathBuf {
        self.base_dir.join(format!("{}.json", execute_id))
    }
}

#[async_trait]
impl CheckpointStore for JsonCheckpointStore {
    async fn save(&self, execute_id: &str, state: &CheckpointState) -> Result<()> {
        let _lock = self.lock.write().await;
        tokio::fs::create_dir_all(&self.base_dir).await?;

        let path = self.path(execute_id);
        let tmp_path = path.with_extension("json.tmp");
        let data = serde_json::to_string_pretty(state)?;
        tokio::fs::write(&tmp_path, &data)
            .await
            .with_context(|| format!("Failed to write checkpoint: {}", tmp_path.display()))?;
        tokio::fs::rename(&tmp_path, &path).await?;
        Ok(())
    }

    async fn load(&self, execute_id: &str) -> Result<Option<CheckpointState>> {
        let _lock = self.lock.read().await;
        let path = self.path(execute_id);
        if !path.exists() {
            return Ok(None);
        }
        let data = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read checkpoint: {}", path.display()))?;
        let state = serde_json::from_str(&data)
            .with_context(|| format!("Failed to parse checkpoint: {}", execute_id))?;
        Ok(Some(state))
    }

    async fn delete(&self, execute_id: &str) -> Result<()> {
        let _lock = self.lock.write().await;
        let path = self.path(execute_id);
        if path.exists() {
            tokio::fs::remove_file(&path).await?;
        }
        Ok(())
    }
}
