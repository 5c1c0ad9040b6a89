use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::canvas::NodeKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterruptType {
    /// Free-form input form.
    Input,
    /// Structured question / answer.
    Question,
    /// External tool call awaiting approval.
    ToolConfirmation,
}

impl fmt::Display for InterruptType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InterruptType::Input => write!(f, "input"),
            InterruptType::Question => write!(f, "question"),
            InterruptType::ToolConfirmation => write!(f, "tool_confirmation"),
        }
    }
}

/// One step on the path from the root execution to a suspended node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AddressSegment {
    /// Iteration `index` of a loop or batch node.
    Iteration { node_id: String, index: usize },
    /// Child execution created by a sub-workflow node.
    SubExecution { node_id: String, execute_id: String },
}

impl AddressSegment {
    /// The composite or sub-workflow node this segment passes through.
    pub fn node_id(&self) -> &str {
        match self {
            AddressSegment::Iteration { node_id, .. } | AddressSegment::SubExecution { node_id, .. } => {
                node_id
            }
        }
    }
}

/// Resumption point: ancestry segments followed by the suspended node.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NodeAddress {
    #[serde(default)]
    pub segments: Vec<AddressSegment>,
    pub node_id: String,
}

impl NodeAddress {
    pub fn new(segments: Vec<AddressSegment>, node_id: &str) -> Self {
        Self {
            segments,
            node_id: node_id.to_string(),
        }
    }

    /// Execution IDs of every sub-execution on the path, outermost first.
    pub fn sub_executions(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|s| match s {
            AddressSegment::SubExecution { execute_id, .. } => Some(execute_id.as_str()),
            AddressSegment::Iteration { .. } => None,
        })
    }

    /// Whether this address lies inside the given (possibly root) execution.
    pub fn is_within(&self, root_execute_id: &str, execute_id: &str) -> bool {
        execute_id == root_execute_id || self.sub_executions().any(|id| id == execute_id)
    }

    /// Iteration index of the innermost composite, if any.
    pub fn innermost_index(&self) -> Option<usize> {
        self.segments.iter().rev().find_map(|s| match s {
            AddressSegment::Iteration { index, .. } => Some(*index),
            AddressSegment::SubExecution { .. } => None,
        })
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for seg in &self.segments {
            match seg {
                AddressSegment::Iteration { node_id, index } => write!(f, "{}[{}]/", node_id, index)?,
                AddressSegment::SubExecution {
                    node_id,
                    execute_id,
                } => write!(f, "{}>{}/", node_id, execute_id)?,
            }
        }
        f.write_str(&self.node_id)
    }
}

/// Globally addressable event ID: `<root>:<address>#<seq>`.
pub fn event_id(root_execute_id: &str, address: &NodeAddress, seq: u64) -> String {
    format!("{}:{}#{}", root_execute_id, address, seq)
}

/// Root execution ID embedded in an event ID.
pub fn event_root(event_id: &str) -> Option<&str> {
    event_id.split_once(':').map(|(root, _)| root)
}

/// A durable suspension point awaiting external data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterruptEvent {
    pub id: String,
    pub root_execute_id: String,
    /// Execution the suspended node belongs to (root or a sub-execution).
    pub execute_id: String,
    pub event_type: InterruptType,
    pub node_id: String,
    pub node_type: NodeKind,
    pub node_title: String,
    /// What is being asked; shown to the user verbatim.
    pub payload: Value,
    pub address: NodeAddress,
    pub created_at: DateTime<Utc>,
}
