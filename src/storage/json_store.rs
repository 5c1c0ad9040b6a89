use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result, bail};
use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::RwLock;

use crate::canvas::Canvas;
use crate::engine::types::*;

use super::*;

/// File-based JSON repository.
///
/// Layout under `base_dir`:
/// - `workflows/<id>.json`: meta, draft, versions, outgoing references
/// - `snapshots/<commit>.json`: frozen canvases
/// - `executions/<id>.json`: execution plus node results
/// - `history/<workflow>/<node>.json`: latest successful node result
pub struct JsonRepository {
    base_dir: PathBuf,
    lock: RwLock<()>,
}

impl JsonRepository {
    pub fn new(base_dir: impl AsRef<Path>) -> Self {
        Self {
            base_dir: base_dir.as_ref().to_path_buf(),
            lock: RwLock::new(()),
        }
    }

    fn workflow_path(&self, id: &str) -> PathBuf {
        self.base_dir.join("workflows").join(format!("{}.json", id))
    }

    fn snapshot_path(&self, commit_id: &str) -> PathBuf {
        self.base_dir.join("snapshots").join(format!("{}.json", commit_id))
    }

    fn execution_path(&self, id: &str) -> PathBuf {
        self.base_dir.join("executions").join(format!("{}.json", id))
    }

    fn history_path(&self, workflow_id: &str, node_id: &str) -> PathBuf {
        self.base_dir
            .join("history")
            .join(workflow_id)
            .join(format!("{}.json", node_id))
    }

    async fn read<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
        if !path.exists() {
            return Ok(None);
        }
        let data = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let value = serde_json::from_str(&data)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(Some(value))
    }

    async fn write<T: Serialize>(path: &Path, value: &T) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp_path = path.with_extension("json.tmp");
        let data = serde_json::to_string_pretty(value)?;
        tokio::fs::write(&tmp_path, &data).await?;
        tokio::fs::rename(&tmp_path, path).await?;
        Ok(())
    }

    async fn read_dir<T: DeserializeOwned>(dir: &Path) -> Result<Vec<T>> {
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut items = Vec::new();
        let mut entries = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json")
                && let Some(item) = Self::read::<T>(&path).await?
            {
                items.push(item);
            }
        }
        Ok(items)
    }

    async fn read_execution(&self, id: &str) -> Result<ExecutionRecord> {
        match Self::read::<ExecutionRecord>(&self.execution_path(id)).await? {
            Some(record) => Ok(record),
            None => bail!("Execution '{}' not found", id),
        }
    }
}

#[async_trait]
impl Repository for JsonRepository {
    async fn put_workflow(&self, record: &WorkflowRecord) -> Result<()> {
        let _lock = self.lock.write().await;
        Self::write(&self.workflow_path(&record.meta.id), record).await
    }

    async fn get_workflow(&self, id: &str) -> Result<Option<WorkflowRecord>> {
        let _lock = self.lock.read().await;
        Self::read(&self.workflow_path(id)).await
    }

    async fn delete_workflow(&self, id: &str) -> Result<()> {
        let _lock = self.lock.write().await;
        let path = self.workflow_path(id);
        if path.exists() {
            tokio::fs::remove_file(&path).await?;
        }
        Ok(())
    }

    async fn list_workflows(&self, space_id: &str) -> Result<Vec<WorkflowMeta>> {
        let _lock = self.lock.read().await;
        let records: Vec<WorkflowRecord> = Self::read_dir(&self.base_dir.join("workflows")).await?;
        let mut metas: Vec<WorkflowMeta> = records
            .into_iter()
            .filter(|w| w.meta.space_id == space_id)
            .map(|w| w.meta)
            .collect();
        metas.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(metas)
    }

    async fn get_referrers(&self, id: &str) -> Result<Vec<String>> {
        let _lock = self.lock.read().await;
        let records: Vec<WorkflowRecord> = Self::read_dir(&self.base_dir.join("workflows")).await?;
        let mut ids: Vec<String> = records
            .into_iter()
            .filter(|w| w.references.iter().any(|r| r == id))
            .map(|w| w.meta.id)
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn save_snapshot(&self, commit_id: &str, canvas: &Canvas) -> Result<()> {
        let _lock = self.lock.write().await;
        let path = self.snapshot_path(commit_id);
        // Content-addressed: an existing snapshot is already identical.
        if path.exists() {
            return Ok(());
        }
        Self::write(&path, canvas).await
    }

    async fn get_snapshot(&self, commit_id: &str) -> Result<Option<Canvas>> {
        let _lock = self.lock.read().await;
        Self::read(&self.snapshot_path(commit_id)).await
    }

    async fn create_execution(&self, execution: &Execution) -> Result<()> {
        let _lock = self.lock.write().await;
        let path = self.execution_path(&execution.id);
        if path.exists() {
            bail!("Execution '{}' already exists", execution.id);
        }
        let record = ExecutionRecord {
            execution: execution.clone(),
            node_results: Default::default(),
        };
        Self::write(&path, &record).await
    }

    async fn get_execution(&self, id: &str) -> Result<Option<Execution>> {
        let _lock = self.lock.read().await;
        Ok(Self::read::<ExecutionRecord>(&self.execution_path(id))
            .await?
            .map(|r| r.execution))
    }

    async fn list_child_executions(&self, parent_id: &str) -> Result<Vec<Execution>> {
        let _lock = self.lock.read().await;
        let records: Vec<ExecutionRecord> =
            Self::read_dir(&self.base_dir.join("executions")).await?;
        let mut children: Vec<Execution> = records
            .into_iter()
            .map(|r| r.execution)
            .filter(|e| e.parent_execute_id.as_deref() == Some(parent_id))
            .collect();
        children.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(children)
    }

    async fn transition_execution(
        &self,
        id: &str,
        from: ExecutionStatus,
        to: ExecutionStatus,
        update: Transition,
    ) -> Result<bool> {
        let _lock = self.lock.write().await;
        let mut record = self.read_execution(id).await?;
        if !apply_transition(&mut record.execution, from, to, update) {
            return Ok(false);
        }
        Self::write(&self.execution_path(id), &record).await?;
        Ok(true)
    }

    async fn add_usage(&self, id: &str, usage: &TokenUsage) -> Result<()> {
        let _lock = self.lock.write().await;
        let mut record = self.read_execution(id).await?;
        record.execution.usage.add(usage);
        Self::write(&self.execution_path(id), &record).await
    }

    async fn upsert_node_result(&self, result: &NodeResult) -> Result<()> {
        let _lock = self.lock.write().await;
        let mut record = self.read_execution(&result.execute_id).await?;
        record.node_results.insert(result.key(), result.clone());
        Self::write(&self.execution_path(&result.execute_id), &record).await?;
        if result.status == NodeStatus::Success {
            Self::write(
                &self.history_path(&result.workflow_id, &result.node_id),
                result,
            )
            .await?;
        }
        Ok(())
    }

    async fn list_node_results(&self, execute_id: &str) -> Result<Vec<NodeResult>> {
        let _lock = self.lock.read().await;
        Ok(Self::read::<ExecutionRecord>(&self.execution_path(execute_id))
            .await?
            .map(|r| sorted_results(&r))
            .unwrap_or_default())
    }

    async fn latest_successful_node_result(
        &self,
        workflow_id: &str,
        node_id: &str,
    ) -> Result<Option<NodeResult>> {
        let _lock = self.lock.read().await;
        Self::read(&self.history_path(workflow_id, node_id)).await
    }
}
