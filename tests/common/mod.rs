//! Shared fixtures: canvas JSON builders, scripted providers and a service
//! over in-memory stores.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use serde_json::{Map, Value, json};

use canvasflow::canvas::NodeKind;
use canvasflow::checkpoint::{CheckpointStore, MemoryCheckpointStore};
use canvasflow::engine::{EngineConfig, TokenUsage};
use canvasflow::nodes::builtin::{InputProvider, PluginProvider, QuestionProvider};
use canvasflow::nodes::{CapabilityProvider, CapabilityRegistry, NodeInput, NodeOutcome, NodeOutput};
use canvasflow::service::{Caller, CreateWorkflow, PublishRequest, WorkflowService};
use canvasflow::storage::{MemoryRepository, Repository};

pub const SPACE: &str = "space-1";

pub fn caller() -> Caller {
    Caller::new(SPACE, "tester")
}

pub fn engine_config() -> EngineConfig {
    EngineConfig {
        max_concurrent_nodes: 4,
        default_batch_concurrency: 4,
        retry_backoff_ms: 0,
        run_timeout_ms: None,
        debug_url_template: "http://debug/{workflow_id}/{execute_id}".to_string(),
    }
}

/// Code stand-in steered by its config:
/// - `sleepMs`: delay before answering
/// - `failAttempts`: fail while the attempt number is below this
/// - `alwaysFail`: fail every attempt
/// - `op: "add"`: output `sum` of all numeric inputs
/// - `model`: copied to the output, so backup configs are observable
///
/// Otherwise inputs are echoed back, plus the attempt number.
pub struct ScriptedCode;

#[async_trait]
impl CapabilityProvider for ScriptedCode {
    fn node_type(&self) -> NodeKind {
        NodeKind::Code
    }

    fn description(&self) -> &str {
        "Scripted code node"
    }

    async fn execute(&self, input: NodeInput) -> Result<NodeOutcome> {
        let cfg = &input.config;
        if let Some(ms) = cfg.get("sleepMs").and_then(Value::as_u64) {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
        let fail_attempts = cfg.get("failAttempts").and_then(Value::as_u64).unwrap_or(0);
        if u64::from(input.attempt) < fail_attempts {
            bail!("scripted failure on attempt {}", input.attempt);
        }
        if cfg.get("alwaysFail").and_then(Value::as_bool).unwrap_or(false) {
            bail!("scripted failure");
        }

        let mut out = input.inputs.clone();
        if cfg.get("op").and_then(Value::as_str) == Some("add") {
            let sum: i64 = input.inputs.values().filter_map(Value::as_i64).sum();
            out = Map::from_iter([("sum".to_string(), json!(sum))]);
        }
        if let Some(model) = cfg.get("model") {
            out.insert("model".to_string(), model.clone());
        }
        out.insert("attempt".to_string(), json!(input.attempt));
        Ok(NodeOutcome::Output(NodeOutput::new(out)))
    }
}

/// LLM stand-in: streams `echo: <prompt>` in two chunks and reports usage.
pub struct ScriptedLlm;

#[async_trait]
impl CapabilityProvider for ScriptedLlm {
    fn node_type(&self) -> NodeKind {
        NodeKind::Llm
    }

    fn description(&self) -> &str {
        "Scripted LLM node"
    }

    async fn execute(&self, input: NodeInput) -> Result<NodeOutcome> {
        let prompt = input
            .inputs
            .get("prompt")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        input.stream.chunk("echo: ");
        input.stream.finish(&prompt);
        Ok(NodeOutcome::Output(NodeOutput {
            output: Map::from_iter([("output".to_string(), json!(format!("echo: {}", prompt)))]),
            usage: TokenUsage {
                input_tokens: 10,
                output_tokens: 5,
                cost: 0.0,
            },
            port: None,
        }))
    }
}

pub fn registry() -> Arc<CapabilityRegistry> {
    let mut registry = CapabilityRegistry::new();
    registry.register(Arc::new(ScriptedCode));
    registry.register(Arc::new(ScriptedLlm));
    registry.register(Arc::new(InputProvider));
    registry.register(Arc::new(QuestionProvider));
    registry.register(Arc::new(PluginProvider));
    Arc::new(registry)
}

pub fn service() -> Arc<WorkflowService> {
    service_with(
        Arc::new(MemoryRepository::new()),
        Arc::new(MemoryCheckpointStore::new()),
    )
}

pub fn service_with(repo: Arc<dyn Repository>, checkpoints: Arc<dyn CheckpointStore>) -> Arc<WorkflowService> {
    Arc::new(WorkflowService::new(registry(), repo, checkpoints, engine_config()))
}

// --- canvas JSON ---

pub fn field(name: &str, ty: &str) -> Value {
    json!({ "name": name, "type": ty })
}

pub fn required(name: &str, ty: &str) -> Value {
    json!({ "name": name, "type": ty, "required": true })
}

pub fn lit(name: &str, ty: &str, value: Value) -> Value {
    json!({
        "name": name,
        "input": { "type": ty, "value": { "type": "literal", "content": value } }
    })
}

pub fn reference(name: &str, ty: &str, block: &str, source: &str) -> Value {
    json!({
        "name": name,
        "input": { "type": ty, "value": { "type": "ref", "content": { "blockID": block, "name": source } } }
    })
}

pub fn start(fields: Value) -> Value {
    json!({ "id": "start", "type": "start", "meta": { "title": "Start" }, "data": { "outputs": fields } })
}

/// End node returning its inputs as variables.
pub fn end(inputs: Value) -> Value {
    json!({ "id": "end", "type": "end", "meta": { "title": "End" }, "data": { "inputs": inputs } })
}

pub fn node(id: &str, kind: &str, data: Value) -> Value {
    json!({ "id": id, "type": kind, "meta": { "title": id }, "data": data })
}

pub fn edge(source: &str, target: &str) -> Value {
    json!({ "sourceNodeID": source, "targetNodeID": target })
}

pub fn port_edge(source: &str, port: &str, target: &str) -> Value {
    json!({ "sourceNodeID": source, "targetNodeID": target, "sourcePortID": port })
}

pub fn canvas(nodes: Vec<Value>, edges: Vec<Value>) -> Value {
    json!({ "nodes": nodes, "edges": edges })
}

/// Start -> Input(`ask`, one required string `name`) -> End returning `name`.
pub fn input_canvas() -> Value {
    canvas(
        vec![
            start(json!([])),
            node(
                "ask",
                "input",
                json!({ "outputs": [required("name", "string")], "config": { "prompt": "Who are you?" } }),
            ),
            end(json!([reference("name", "string", "ask", "name")])),
        ],
        vec![edge("start", "ask"), edge("ask", "end")],
    )
}

pub fn object(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

// --- service shortcuts ---

/// Create a workflow whose draft is `canvas`. Returns its ID.
pub async fn draft(service: &WorkflowService, name: &str, canvas: &Value) -> String {
    let meta = service
        .create_workflow(
            &caller(),
            CreateWorkflow {
                name: name.to_string(),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    service
        .save_workflow(&caller(), &meta.id, &serde_json::to_vec(canvas).unwrap())
        .await
        .unwrap();
    meta.id
}

pub async fn publish(service: &WorkflowService, id: &str, version: &str) {
    service
        .publish_workflow(
            &caller(),
            id,
            PublishRequest {
                version: version.to_string(),
                ..Default::default()
            },
        )
        .await
        .unwrap();
}
