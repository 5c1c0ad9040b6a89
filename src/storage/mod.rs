pub mod json_store;
pub mod memory;

use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::canvas::Canvas;
use crate::engine::types::*;

pub use json_store::JsonRepository;
pub use memory::MemoryRepository;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowMeta {
    pub id: String,
    pub space_id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub creator_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Latest editable canvas of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Draft {
    pub canvas: Canvas,
    pub commit_id: String,
    pub updated_at: DateTime<Utc>,
}

/// An immutable published snapshot; the canvas lives under `commit_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishedVersion {
    pub version: String,
    pub commit_id: String,
    #[serde(default)]
    pub description: String,
    pub published_at: DateTime<Utc>,
}

/// Everything stored per workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRecord {
    pub meta: WorkflowMeta,
    #[serde(default)]
    pub draft: Option<Draft>,
    /// Oldest first.
    #[serde(default)]
    pub versions: Vec<PublishedVersion>,
    /// Workflows the latest published version calls.
    #[serde(default)]
    pub references: Vec<String>,
}

impl WorkflowRecord {
    pub fn version(&self, version: Option<&str>) -> Option<&PublishedVersion> {
        match version {
            Some(v) => self.versions.iter().find(|p| p.version == v),
            None => self.versions.last(),
        }
    }
}

/// An execution with its node results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub execution: Execution,
    #[serde(default)]
    pub node_results: BTreeMap<String, NodeResult>,
}

/// Field updates applied when an execution leaves Running.
#[derive(Debug, Clone, Default)]
pub struct Transition {
    pub reason: Option<String>,
    pub error_code: Option<i64>,
    pub output: Option<Value>,
}

/// Relational-style persistence for workflows, versions, executions, node results.
#[async_trait]
pub trait Repository: Send + Sync {
    async fn put_workflow(&self, record: &WorkflowRecord) -> Result<()>;

    async fn get_workflow(&self, id: &str) -> Result<Option<WorkflowRecord>>;

    async fn delete_workflow(&self, id: &str) -> Result<()>;

    async fn list_workflows(&self, space_id: &str) -> Result<Vec<WorkflowMeta>>;

    /// Workflows whose latest published version calls `id`.
    async fn get_referrers(&self, id: &str) -> Result<Vec<String>>;

    async fn save_snapshot(&self, commit_id: &str, canvas: &Canvas) -> Result<()>;

    async fn get_snapshot(&self, commit_id: &str) -> Result<Option<Canvas>>;

    async fn create_execution(&self, execution: &Execution) -> Result<()>;

    async fn get_execution(&self, id: &str) -> Result<Option<Execution>>;

    async fn list_child_executions(&self, parent_id: &str) -> Result<Vec<Execution>>;

    /// Compare-and-set status change. Returns false when the execution was
    /// not in `from` (the other side of the race already won).
    async fn transition_execution(
        &self,
        id: &str,
        from: ExecutionStatus,
        to: ExecutionStatus,
        update: Transition,
    ) -> Result<bool>;

    async fn add_usage(&self, id: &str, usage: &TokenUsage) -> Result<()>;

    /// Insert or replace by `(execute_id, node_id, index)`. Successful
    /// results also become the latest success for `(workflow_id, node_id)`.
    async fn upsert_node_result(&self, result: &NodeResult) -> Result<()>;

    async fn list_node_results(&self, execute_id: &str) -> Result<Vec<NodeResult>>;

    async fn latest_successful_node_result(
        &self,
        workflow_id: &str,
        node_id: &str,
    ) -> Result<Option<NodeResult>>;
}

pub(crate) fn apply_transition(
    execution: &mut Execution,
    from: ExecutionStatus,
    to: ExecutionStatus,
    update: Transition,
) -> bool {
    if execution.status != from {
        return false;
    }
    execution.status = to;
    if update.reason.is_some() {
        execution.reason = update.reason;
    }
    if update.error_code.is_some() {
        execution.error_code = update.error_code;
    }
    if update.output.is_some() {
        execution.output = update.output;
    }
    if to.is_terminal() {
        execution.finished_at = Some(Utc::now());
    }
    true
}

pub(crate) fn sorted_results(record: &ExecutionRecord) -> Vec<NodeResult> {
    let mut results: Vec<NodeResult> = record.node_results.values().cloned().collect();
    results.sort_by(|a, b| {
        a.started_at
            .cmp(&b.started_at)
            .then_with(|| a.node_id.cmp(&b.node_id))
            .then_with(|| a.index.cmp(&b.index))
    });
    results
}
