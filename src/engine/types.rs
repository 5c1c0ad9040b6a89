use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::canvas::NodeKind;

/// Status of a workflow execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Running,
    Success,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, ExecutionStatus::Running)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionStatus::Running => write!(f, "running"),
            ExecutionStatus::Success => write!(f, "success"),
            ExecutionStatus::Failed => write!(f, "failed"),
            ExecutionStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Status of one node within an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Running,
    Success,
    Failed,
    Interrupted,
    Skipped,
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeStatus::Running => write!(f, "running"),
            NodeStatus::Success => write!(f, "success"),
            NodeStatus::Failed => write!(f, "failed"),
            NodeStatus::Interrupted => write!(f, "interrupted"),
            NodeStatus::Skipped => write!(f, "skipped"),
        }
    }
}

/// How an execution was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecuteMode {
    TestRun,
    NodeDebug,
    Release,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost: f64,
}

impl TokenUsage {
    pub fn add(&mut self, other: &TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cost += other.cost;
    }

    pub fn is_zero(&self) -> bool {
        self.input_tokens == 0 && self.output_tokens == 0 && self.cost == 0.0
    }
}

/// One run of a workflow against a fixed canvas snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: String,
    pub workflow_id: String,
    pub space_id: String,
    /// Published version, `None` for draft runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub commit_id: String,
    pub mode: ExecuteMode,
    pub status: ExecutionStatus,
    /// Failure or cancellation reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<i64>,
    pub root_execute_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_execute_id: Option<String>,
    /// SubWorkflow node that created this execution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_node_id: Option<String>,
    #[serde(default)]
    pub input: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default)]
    pub usage: TokenUsage,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Execution {
    pub fn is_root(&self) -> bool {
        self.parent_execute_id.is_none()
    }
}

/// Per-node-per-execution record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeResult {
    pub execute_id: String,
    pub workflow_id: String,
    pub node_id: String,
    pub node_type: NodeKind,
    pub node_title: String,
    /// Iteration index for nodes inside a loop or batch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
    pub status: NodeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    /// Error body, also present on soft failures that continued with default output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub attempt: u32,
    #[serde(default)]
    pub usage: TokenUsage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_execute_id: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl NodeResult {
    pub fn new(execute_id: &str, workflow_id: &str, node_id: &str, kind: NodeKind, title: &str) -> Self {
        Self {
            execute_id: execute_id.to_string(),
            workflow_id: workflow_id.to_string(),
            node_id: node_id.to_string(),
            node_type: kind,
            node_title: title.to_string(),
            index: None,
            status: NodeStatus::Running,
            input: None,
            output: None,
            error: None,
            attempt: 0,
            usage: TokenUsage::default(),
            sub_execute_id: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Storage key: `(execute_id, node_id, index?)`.
    pub fn key(&self) -> String {
        result_key(&self.execute_id, &self.node_id, self.index)
    }

    pub fn finish(&mut self, status: NodeStatus) {
        self.status = status;
        self.finished_at = Some(Utc::now());
    }
}

pub fn result_key(execute_id: &str, node_id: &str, index: Option<usize>) -> String {
    match index {
        Some(i) => format!("{}/{}[{}]", execute_id, node_id, i),
        None => format!("{}/{}", execute_id, node_id),
    }
}
