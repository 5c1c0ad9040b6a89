use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::canvas::{Edge, Node};
use crate::engine::interrupt::{AddressSegment, NodeAddress};

/// Resumable state of one graph level (the root canvas, one composite
/// iteration, or one sub-execution).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScopeState {
    /// Outputs of nodes that reached a terminal state.
    #[serde(default)]
    pub outputs: BTreeMap<String, Value>,
    /// Port chosen by each completed node (`None` = unnamed default).
    #[serde(default)]
    pub ports: BTreeMap<String, Option<String>>,
    #[serde(default)]
    pub skipped: BTreeSet<String>,
    /// Nodes that suspended, with whatever they need to continue.
    #[serde(default)]
    pub pending: BTreeMap<String, PendingNode>,
    /// Loop variable writes made by variable assigners in this scope.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub assignments: Map<String, Value>,
}

impl ScopeState {
    pub fn is_done(&self, node_id: &str) -> bool {
        self.outputs.contains_key(node_id) || self.skipped.contains(node_id)
    }

    pub fn pending_at(&self, address: &NodeAddress) -> Option<&PendingNode> {
        let mut scope: &ScopeState = self;
        for seg in &address.segments {
            scope = match (seg, scope.pending.get(seg.node_id())?) {
                (AddressSegment::Iteration { index, .. }, PendingNode::Composite(c)) => {
                    c.iterations.get(index)?
                }
                (AddressSegment::SubExecution { execute_id, .. }, PendingNode::SubWorkflow(s))
                    if &s.execute_id == execute_id =>
                {
                    &s.scope
                }
                _ => return None,
            };
        }
        scope.pending.get(&address.node_id)
    }

    /// Walk an address down to the pending entry of the suspended node.
    pub fn pending_at_mut(&mut self, address: &NodeAddress) -> Option<&mut PendingNode> {
        let mut scope: &mut ScopeState = self;
        for seg in &address.segments {
            scope = match seg {
                AddressSegment::Iteration { node_id, index } => match scope.pending.get_mut(node_id)? {
                    PendingNode::Composite(c) => c.iterations.get_mut(index)?,
                    _ => return None,
                },
                AddressSegment::SubExecution {
                    node_id,
                    execute_id,
                } => match scope.pending.get_mut(node_id)? {
                    PendingNode::SubWorkflow(s) if &s.execute_id == execute_id => &mut s.scope,
                    _ => return None,
                },
            };
        }
        scope.pending.get_mut(&address.node_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PendingNode {
    /// A capability provider asked for external data.
    Interrupt(InterruptState),
    Composite(CompositeState),
    SubWorkflow(SubWorkflowState),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterruptState {
    pub event_id: String,
    /// Set by resume; consumed on the next dispatch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume: Option<Value>,
    /// Provider-private state carried across rounds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<Value>,
    /// Retry attempt the node was on when it suspended.
    #[serde(default)]
    pub attempt: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompositeState {
    /// Inputs resolved at first dispatch; iterations always see the same items.
    #[serde(default)]
    pub input: Map<String, Value>,
    /// Loop: next iteration to start.
    #[serde(default)]
    pub next_index: usize,
    /// Finished iteration outputs keyed by index.
    #[serde(default)]
    pub results: BTreeMap<usize, Value>,
    /// Indices in the order their iterations finished.
    #[serde(default)]
    pub completion_order: Vec<usize>,
    /// Suspended iterations.
    #[serde(default)]
    pub iterations: BTreeMap<usize, ScopeState>,
    /// Loop variables as of the start of the next iteration.
    #[serde(default)]
    pub variables: Map<String, Value>,
    #[serde(default)]
    pub broken: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubWorkflowState {
    pub execute_id: String,
    pub workflow_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub commit_id: String,
    #[serde(default)]
    pub input: Map<String, Value>,
    #[serde(default)]
    pub scope: ScopeState,
}

/// Inbound-edge index over one graph level.
pub struct Graph<'a> {
    pub nodes: &'a [Node],
    inbound: HashMap<&'a str, Vec<&'a Edge>>,
}

impl<'a> Graph<'a> {
    pub fn new(nodes: &'a [Node], edges: &'a [Edge]) -> Self {
        let mut inbound: HashMap<&'a str, Vec<&'a Edge>> = HashMap::new();
        for e in edges {
            inbound.entry(e.target.as_str()).or_default().push(e);
        }
        Self { nodes, inbound }
    }

    pub fn inbound(&self, node_id: &str) -> &[&'a Edge] {
        self.inbound.get(node_id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Whether `edge` carries control given its source's chosen port.
    pub fn edge_taken(edge: &Edge, state: &ScopeState) -> bool {
        if state.skipped.contains(&edge.source) {
            return false;
        }
        let chosen = state.ports.get(&edge.source).cloned().flatten();
        match (edge.source_port.as_deref(), chosen.as_deref()) {
            (None, None) | (None, Some(crate::canvas::PORT_DEFAULT)) => true,
            (Some(want), Some(got)) => want == got,
            (Some(crate::canvas::PORT_DEFAULT), None) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn pending_lookup_follows_iterations_and_sub_executions() {
        let mut leaf = ScopeState::default();
        leaf.pending.insert(
            "ask".into(),
            PendingNode::Interrupt(InterruptState {
                event_id: "e1".into(),
                resume: None,
                state: None,
                attempt: 0,
            }),
        );
        let mut child = ScopeState::default();
        let mut composite = CompositeState::default();
        composite.iterations.insert(1, leaf);
        child
            .pending
            .insert("batch".into(), PendingNode::Composite(composite));
        let mut root = ScopeState::default();
        root.pending.insert(
            "sub".into(),
            PendingNode::SubWorkflow(SubWorkflowState {
                execute_id: "c1".into(),
                workflow_id: "w2".into(),
                version: None,
                commit_id: "abc".into(),
                input: Map::new(),
                scope: child,
            }),
        );

        let addr = NodeAddress::new(
            vec![
                AddressSegment::SubExecution {
                    node_id: "sub".into(),
                    execute_id: "c1".into(),
                },
                AddressSegment::Iteration {
                    node_id: "batch".into(),
                    index: 1,
                },
            ],
            "ask",
        );
        match root.pending_at_mut(&addr) {
            Some(PendingNode::Interrupt(s)) => s.resume = Some(json!("yes")),
            other => panic!("unexpected {other:?}"),
        }

        let wrong = NodeAddress::new(
            vec![AddressSegment::SubExecution {
                node_id: "sub".into(),
                execute_id: "other".into(),
            }],
            "ask",
        );
        assert!(root.pending_at_mut(&wrong).is_none());
    }

    #[test]
    fn unnamed_edges_follow_default_port() {
        let mut state = ScopeState::default();
        state.ports.insert("a".into(), Some("default".into()));
        state.ports.insert("b".into(), Some("branch_error".into()));
        assert!(Graph::edge_taken(&Edge::new("a", "x"), &state));
        assert!(!Graph::edge_taken(&Edge::new("b", "x"), &state));
        assert!(Graph::edge_taken(&Edge::from_port("b", "branch_error", "x"), &state));
        state.skipped.insert("c".into());
        assert!(!Graph::edge_taken(&Edge::new("c", "x"), &state));
    }
}
