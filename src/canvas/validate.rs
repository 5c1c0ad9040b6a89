use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::types::*;

/// The node an issue is scoped to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRef {
    #[serde(rename = "nodeID")]
    pub node_id: String,
    #[serde(rename = "nodeName")]
    pub node_name: String,
}

/// The edge an issue is scoped to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathRef {
    pub start: String,
    pub end: String,
}

/// One validation diagnostic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    #[serde(rename = "nodeError", default, skip_serializing_if = "Option::is_none")]
    pub node: Option<NodeRef>,
    #[serde(rename = "pathError", default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathRef>,
    pub message: String,
}

impl Issue {
    pub fn canvas(message: impl Into<String>) -> Self {
        Self {
            node: None,
            path: None,
            message: message.into(),
        }
    }

    pub fn node(node: &Node, message: impl Into<String>) -> Self {
        Self {
            node: Some(NodeRef {
                node_id: node.id.clone(),
                node_name: node.title().to_string(),
            }),
            path: None,
            message: message.into(),
        }
    }

    pub fn edge(edge: &Edge, message: impl Into<String>) -> Self {
        Self {
            node: None,
            path: Some(PathRef {
                start: edge.source.clone(),
                end: edge.target.clone(),
            }),
            message: message.into(),
        }
    }
}

impl fmt::Display for Issue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.node, &self.path) {
            (Some(n), _) => write!(f, "[{}] {}", n.node_id, self.message),
            (None, Some(p)) => write!(f, "[{} -> {}] {}", p.start, p.end, self.message),
            (None, None) => f.write_str(&self.message),
        }
    }
}

/// One level of graph: the top-level canvas or a composite's subgraph.
struct Scope<'a> {
    nodes: &'a [Node],
    edges: &'a [Edge],
    /// Composite node owning this scope.
    owner: Option<&'a Node>,
}

impl<'a> Scope<'a> {
    fn node(&self, id: &str) -> Option<&'a Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Node IDs that can reach `id` along edges of this scope.
    fn ancestors(&self, id: &str) -> HashSet<&'a str> {
        let mut seen = HashSet::new();
        let mut stack = vec![id];
        while let Some(cur) = stack.pop() {
            for e in self.edges.iter().filter(|e| e.target == cur) {
                if seen.insert(e.source.as_str()) {
                    stack.push(e.source.as_str());
                }
            }
        }
        seen
    }

    fn reaches(&self, from: &str, to: &str) -> bool {
        let mut seen = HashSet::new();
        let mut stack = vec![from];
        while let Some(cur) = stack.pop() {
            if cur == to {
                return true;
            }
            for e in self.edges.iter().filter(|e| e.source == cur) {
                if seen.insert(e.target.as_str()) {
                    stack.push(e.target.as_str());
                }
            }
        }
        false
    }
}

/// Validate a whole canvas, collecting every issue instead of stopping at the first.
pub fn validate_tree(canvas: &Canvas) -> Vec<Issue> {
    let mut issues = Vec::new();

    if canvas.version != CANVAS_VERSION {
        issues.push(Issue::canvas(format!(
            "unsupported canvas version '{}'",
            canvas.version
        )));
    }

    let starts: Vec<&Node> = canvas
        .nodes
        .iter()
        .filter(|n| n.kind == NodeKind::Start)
        .collect();
    match starts.len() {
        0 => issues.push(Issue::canvas("canvas has no start node")),
        1 => {}
        _ => {
            for s in &starts[1..] {
                issues.push(Issue::node(s, "canvas has more than one start node"));
            }
        }
    }
    if !canvas.nodes.iter().any(|n| n.kind == NodeKind::End) {
        issues.push(Issue::canvas("canvas has no end node"));
    }

    let mut ids = HashSet::new();
    for node in canvas.all_nodes() {
        if !ids.insert(node.id.as_str()) {
            issues.push(Issue::node(node, format!("duplicate node id '{}'", node.id)));
        }
    }

    let root = Scope {
        nodes: &canvas.nodes,
        edges: &canvas.edges,
        owner: None,
    };
    validate_scope(&root, &[], &mut issues);

    if let Some(start) = starts.first()
        && !canvas.edges.iter().any(|e| e.source == start.id)
    {
        issues.push(Issue::node(start, "start node is not connected"));
    }

    issues
}

fn validate_scope<'a>(scope: &Scope<'a>, chain: &[&Scope<'a>], issues: &mut Vec<Issue>) {
    for edge in scope.edges {
        let source = scope.node(&edge.source);
        if source.is_none() {
            issues.push(Issue::edge(
                edge,
                format!("edge source '{}' does not exist", edge.source),
            ));
        }
        if scope.node(&edge.target).is_none() {
            issues.push(Issue::edge(
                edge,
                format!("edge target '{}' does not exist", edge.target),
            ));
        }
        if let (Some(src), Some(port)) = (source, edge.source_port.as_deref()) {
            let ports = src.output_ports();
            if !ports.iter().any(|p| p == port) && !(ports.is_empty() && port == PORT_DEFAULT) {
                issues.push(Issue::edge(
                    edge,
                    format!("node '{}' has no output port '{}'", src.id, port),
                ));
            }
        }
    }

    for edge in scope.edges {
        if scope.node(&edge.source).is_some()
            && scope.node(&edge.target).is_some()
            && scope.reaches(&edge.target, &edge.source)
        {
            issues.push(Issue::edge(edge, "edge is part of a cycle"));
        }
    }

    for node in scope.nodes {
        validate_node(node, scope, chain, issues);
    }

    for node in scope.nodes.iter().filter(|n| n.kind.is_composite()) {
        let inner = Scope {
            nodes: &node.blocks,
            edges: &node.edges,
            owner: Some(node),
        };
        let mut outer = chain.to_vec();
        outer.push(scope);
        validate_scope(&inner, &outer, issues);
    }
}

fn validate_node<'a>(node: &Node, scope: &Scope<'a>, chain: &[&Scope<'a>], issues: &mut Vec<Issue>) {
    let inside = scope.owner.map(|o| o.kind);

    if !node.kind.is_composite() && (!node.blocks.is_empty() || !node.edges.is_empty()) {
        issues.push(Issue::node(node, "only loop and batch nodes may contain blocks"));
    }
    if node.kind.is_composite() && inside.is_some() {
        issues.push(Issue::node(
            node,
            "composite nodes cannot be nested inside another composite",
        ));
    }
    if matches!(node.kind, NodeKind::Break | NodeKind::Continue) && inside != Some(NodeKind::Loop) {
        issues.push(Issue::node(
            node,
            format!("{} node must be inside a loop", node.kind),
        ));
    }
    if matches!(node.kind, NodeKind::Start | NodeKind::End) && inside.is_some() {
        issues.push(Issue::node(
            node,
            format!("{} node cannot be placed inside a composite", node.kind),
        ));
    }

    check_config(node, issues);

    for port in node.output_ports() {
        if port == PORT_DEFAULT && node.kind != NodeKind::QuestionAnswer {
            continue;
        }
        let connected = scope
            .edges
            .iter()
            .any(|e| e.source == node.id && e.source_port.as_deref() == Some(port.as_str()));
        if !connected {
            issues.push(Issue::node(node, format!("output port '{}' is not connected", port)));
        }
    }

    let ancestors = scope.ancestors(&node.id);
    for param in node_params(node) {
        let Some(value) = &param.input.value else {
            if param.required {
                issues.push(Issue::node(
                    node,
                    format!("required input '{}' has no value", param.name),
                ));
            }
            continue;
        };
        if let BlockValue::Ref(r) = value {
            check_reference(node, &param.name, r, scope, &ancestors, chain, issues);
        }
    }
    // Composite outputs read from the inner subgraph.
    for param in &node.data.output_params {
        if let Some(BlockValue::Ref(r)) = &param.input.value
            && r.block_id != node.id
            && !node.blocks.iter().any(|b| b.id == r.block_id)
        {
            issues.push(Issue::node(
                node,
                format!(
                    "output '{}' references '{}' which is not inside the composite",
                    param.name, r.block_id
                ),
            ));
        }
    }
}

fn check_config(node: &Node, issues: &mut Vec<Issue>) {
    let result = match node.kind {
        NodeKind::Selector => node.config::<SelectorConfig>().map(|_| ()),
        NodeKind::Loop => match node.config::<LoopConfig>() {
            Ok(cfg) => {
                if cfg.loop_type == LoopType::Infinite
                    && !node.blocks.iter().any(|b| b.kind == NodeKind::Break)
                {
                    issues.push(Issue::node(node, "infinite loop has no break node"));
                }
                Ok(())
            }
            Err(e) => Err(e),
        },
        NodeKind::Batch => node.config::<BatchConfig>().map(|_| ()),
        NodeKind::End => node.config::<EndConfig>().map(|_| ()),
        NodeKind::Message => node.config::<MessageConfig>().map(|_| ()),
        NodeKind::QuestionAnswer => match node.config::<QuestionConfig>() {
            Ok(cfg) => {
                if cfg.options.len() > MAX_QUESTION_OPTIONS {
                    issues.push(Issue::node(
                        node,
                        format!("question has more than {} options", MAX_QUESTION_OPTIONS),
                    ));
                }
                Ok(())
            }
            Err(e) => Err(e),
        },
        NodeKind::SubWorkflow => match node.config::<SubWorkflowConfig>() {
            Ok(cfg) => {
                if cfg.workflow_id.is_empty() {
                    issues.push(Issue::node(node, "sub_workflow node has no workflowId"));
                }
                Ok(())
            }
            Err(e) => Err(e),
        },
        _ => Ok(()),
    };
    if let Err(e) = result {
        issues.push(Issue::node(node, format!("invalid config: {}", e)));
    }
}

/// Every parameter a node resolves at run time.
fn node_params(node: &Node) -> Vec<Param> {
    let mut params: Vec<Param> = node.data.inputs.clone();
    params.extend(node.data.loop_variables.iter().cloned());
    if node.kind == NodeKind::Selector
        && let Ok(cfg) = node.config::<SelectorConfig>()
    {
        for (b, branch) in cfg.branches.into_iter().enumerate() {
            for (c, cond) in branch.conditions.into_iter().enumerate() {
                params.push(Param {
                    name: format!("branches.{}.conditions.{}.left", b, c),
                    input: cond.left,
                    required: true,
                });
                if let Some(right) = cond.right {
                    params.push(Param {
                        name: format!("branches.{}.conditions.{}.right", b, c),
                        input: right,
                        required: false,
                    });
                }
            }
        }
    }
    params
}

fn check_reference<'a>(
    node: &Node,
    param: &str,
    r: &Reference,
    scope: &Scope<'a>,
    ancestors: &HashSet<&str>,
    chain: &[&Scope<'a>],
    issues: &mut Vec<Issue>,
) {
    if ancestors.contains(r.block_id.as_str()) {
        return;
    }

    // Enclosing composites and their upstream nodes are visible from inside.
    let mut owner = scope.owner;
    for outer in chain.iter().rev() {
        let Some(composite) = owner else { break };
        if composite.id == r.block_id {
            return;
        }
        if outer.ancestors(&composite.id).contains(r.block_id.as_str()) {
            return;
        }
        owner = outer.owner;
    }

    let message = if all_ids(chain, scope).contains(r.block_id.as_str()) {
        format!(
            "input '{}' references node '{}' which is not upstream",
            param, r.block_id
        )
    } else {
        format!("input '{}' references unknown node '{}'", param, r.block_id)
    };
    issues.push(Issue::node(node, message));
}

fn all_ids<'a>(chain: &[&Scope<'a>], scope: &Scope<'a>) -> HashSet<&'a str> {
    let mut out = HashSet::new();
    let roots = chain.first().map(|s| s.nodes).unwrap_or(scope.nodes);
    let mut stack: Vec<&'a Node> = roots.iter().collect();
    while let Some(n) = stack.pop() {
        out.insert(n.id.as_str());
        stack.extend(n.blocks.iter());
    }
    out
}
