pub mod builtin;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::canvas::{NodeKind, Variable};
use crate::engine::interrupt::InterruptType;
use crate::engine::types::TokenUsage;
use crate::stream::{Progress, ProgressSink};

/// Data handed back by `Resume` for a node that suspended.
#[derive(Debug, Clone)]
pub struct ResumeInfo {
    pub data: Value,
    /// Provider state saved with the interrupt.
    pub state: Option<Value>,
}

/// Lets a provider stream partial output for its node.
#[derive(Debug, Clone)]
pub struct NodeStream {
    sink: ProgressSink,
    execute_id: String,
    node_id: String,
    node_type: NodeKind,
    node_title: String,
}

impl NodeStream {
    pub fn new(sink: ProgressSink, execute_id: &str, node_id: &str, node_type: NodeKind, title: &str) -> Self {
        Self {
            sink,
            execute_id: execute_id.to_string(),
            node_id: node_id.to_string(),
            node_type,
            node_title: title.to_string(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.sink.is_enabled()
    }

    pub fn chunk(&self, content: &str) {
        self.emit(content, false);
    }

    /// Last chunk for this node.
    pub fn finish(&self, content: &str) {
        self.emit(content, true);
    }

    fn emit(&self, content: &str, is_finish: bool) {
        self.sink.send(Progress::Chunk {
            execute_id: self.execute_id.clone(),
            node_id: self.node_id.clone(),
            node_type: self.node_type,
            node_title: self.node_title.clone(),
            content: content.to_string(),
            is_finish,
        });
    }
}

/// Everything a provider gets for one attempt.
#[derive(Debug, Clone)]
pub struct NodeInput {
    pub execute_id: String,
    pub node_id: String,
    pub title: String,
    /// Resolved input parameters.
    pub inputs: Map<String, Value>,
    /// Node config, with the backup config merged in on retry attempts.
    pub config: Value,
    /// Declared output fields.
    pub outputs: Vec<Variable>,
    pub resume: Option<ResumeInfo>,
    pub attempt: u32,
    pub stream: NodeStream,
}

#[derive(Debug, Clone, Default)]
pub struct NodeOutput {
    pub output: Map<String, Value>,
    pub usage: TokenUsage,
    /// Output port chosen, for branching providers.
    pub port: Option<String>,
}

impl NodeOutput {
    pub fn new(output: Map<String, Value>) -> Self {
        Self {
            output,
            ..Default::default()
        }
    }
}

/// Request to suspend the node until resumed with external data.
#[derive(Debug, Clone)]
pub struct InterruptRequest {
    pub event_type: InterruptType,
    pub payload: Value,
    pub state: Option<Value>,
}

#[derive(Debug, Clone)]
pub enum NodeOutcome {
    Output(NodeOutput),
    Interrupt(InterruptRequest),
}

/// Trait implemented by every pluggable node capability.
#[async_trait]
pub trait CapabilityProvider: Send + Sync {
    /// The node kind this provider executes.
    fn node_type(&self) -> NodeKind;

    /// Human-readable description.
    fn description(&self) -> &str;

    async fn execute(&self, input: NodeInput) -> Result<NodeOutcome>;
}

/// Providers injected into the engine, keyed by node kind.
#[derive(Clone)]
pub struct CapabilityRegistry {
    providers: HashMap<NodeKind, Arc<dyn CapabilityProvider>>,
}

impl Default for CapabilityRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self {
            providers: HashMap::new(),
        }
    }

    /// Registry with all built-in providers. Knowledge retrieval has no
    /// built-in backend and must be registered by the embedder.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        builtin::register_all(&mut registry);
        registry
    }

    /// Register a provider, replacing any previous one for the same kind.
    pub fn register(&mut self, provider: Arc<dyn CapabilityProvider>) {
        self.providers.insert(provider.node_type(), provider);
    }

    pub fn get(&self, kind: NodeKind) -> Option<Arc<dyn CapabilityProvider>> {
        self.providers.get(&kind).cloned()
    }

    pub fn contains(&self, kind: NodeKind) -> bool {
        self.providers.contains_key(&kind)
    }

    /// List all registered kinds with descriptions.
    pub fn list(&self) -> Vec<(NodeKind, &str)> {
        let mut entries: Vec<(NodeKind, &str)> = self
            .providers
            .values()
            .map(|p| (p.node_type(), p.description()))
            .collect();
        entries.sort_by_key(|(kind, _)| kind.as_str());
        entries
    }
}
