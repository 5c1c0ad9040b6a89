use std::collections::HashMap;

use anyhow::{Result, bail};
use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::canvas::Canvas;
use crate::engine::types::*;

use super::*;

#[derive(Default)]
struct Tables {
    workflows: HashMap<String, WorkflowRecord>,
    snapshots: HashMap<String, Canvas>,
    executions: HashMap<String, ExecutionRecord>,
    /// `(workflow_id, node_id)` -> latest successful result.
    history: HashMap<(String, String), NodeResult>,
}

/// In-memory repository for tests and embedded use.
#[derive(Default)]
pub struct MemoryRepository {
    tables: RwLock<Tables>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn put_workflow(&self, record: &WorkflowRecord) -> Result<()> {
        self.tables
            .write()
            .await
            .workflows
            .insert(record.meta.id.clone(), record.clone());
        Ok(())
    }

    async fn get_workflow(&self, id: &str) -> Result<Option<WorkflowRecord>> {
        Ok(self.tables.read().await.workflows.get(id).cloned())
    }

    async fn delete_workflow(&self, id: &str) -> Result<()> {
        self.tables.write().await.workflows.remove(id);
        Ok(())
    }

    async fn list_workflows(&self, space_id: &str) -> Result<Vec<WorkflowMeta>> {
        let tables = self.tables.read().await;
        let mut metas: Vec<WorkflowMeta> = tables
            .workflows
            .values()
            .filter(|w| w.meta.space_id == space_id)
            .map(|w| w.meta.clone())
            .collect();
        metas.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(metas)
    }

    async fn get_referrers(&self, id: &str) -> Result<Vec<String>> {
        let tables = self.tables.read().await;
        let mut ids: Vec<String> = tables
            .workflows
            .values()
            .filter(|w| w.references.iter().any(|r| r == id))
            .map(|w| w.meta.id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn save_snapshot(&self, commit_id: &str, canvas: &Canvas) -> Result<()> {
        self.tables
            .write()
            .await
            .snapshots
            .entry(commit_id.to_string())
            .or_insert_with(|| canvas.clone());
        Ok(())
    }

    async fn get_snapshot(&self, commit_id: &str) -> Result<Option<Canvas>> {
        Ok(self.tables.read().await.snapshots.get(commit_id).cloned())
    }

    async fn create_execution(&self, execution: &Execution) -> Result<()> {
        let mut tables = self.tables.write().await;
        if tables.executions.contains_key(&execution.id) {
            bail!("Execution '{}' already exists", execution.id);
        }
        tables.executions.insert(
            execution.id.clone(),
            ExecutionRecord {
                execution: execution.clone(),
                node_results: Default::default(),
            },
        );
        Ok(())
    }

    async fn get_execution(&self, id: &str) -> Result<Option<Execution>> {
        Ok(self
            .tables
            .read()
            .await
            .executions
            .get(id)
            .map(|r| r.execution.clone()))
    }

    async fn list_child_executions(&self, parent_id: &str) -> Result<Vec<Execution>> {
        let tables = self.tables.read().await;
        let mut children: Vec<Execution> = tables
            .executions
            .values()
            .filter(|r| r.execution.parent_execute_id.as_deref() == Some(parent_id))
            .map(|r| r.execution.clone())
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
        let mut tables = self.tables.write().await;
        let Some(record) = tables.executions.get_mut(id) else {
            bail!("Execution '{}' not found", id);
        };
        Ok(apply_transition(&mut record.execution, from, to, update))
    }

    async fn add_usage(&self, id: &str, usage: &TokenUsage) -> Result<()> {
        let mut tables = self.tables.write().await;
        if let Some(record) = tables.executions.get_mut(id) {
            record.execution.usage.add(usage);
        }
        Ok(())
    }

    async fn upsert_node_result(&self, result: &NodeResult) -> Result<()> {
        let mut tables = self.tables.write().await;
        let Some(record) = tables.executions.get_mut(&result.execute_id) else {
            bail!("Execution '{}' not found", result.execute_id);
        };
        record.node_results.insert(result.key(), result.clone());
        if result.status == NodeStatus::Success {
            tables.history.insert(
                (result.workflow_id.clone(), result.node_id.clone()),
                result.clone(),
            );
        }
        Ok(())
    }

    async fn list_node_results(&self, execute_id: &str) -> Result<Vec<NodeResult>> {
        let tables = self.tables.read().await;
        Ok(tables
            .executions
            .get(execute_id)
            .map(sorted_results)
            .unwrap_or_default())
    }

    async fn latest_successful_node_result(
        &self,
        workflow_id: &str,
        node_id: &str,
    ) -> Result<Option<NodeResult>> {
        Ok(self
            .tables
            .read()
            .await
            .history
            .get(&(workflow_id.to_string(), node_id.to_string()))
            .cloned())
    }
}
