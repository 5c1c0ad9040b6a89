use std::collections::{BTreeMap, HashMap, HashSet};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use futures_util::future::{BoxFuture, FutureExt, join_all};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::Semaphore;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::canvas::*;
use crate::checkpoint::{CheckpointState, CheckpointStore};
use crate::coercion::{CoerceOptions, coerce_fields};
use crate::engine::interrupt::*;
use crate::engine::policy;
use crate::engine::resolve::{Env, evaluate_selector, resolve_params};
use crate::engine::scope::*;
use crate::engine::template::render;
use crate::engine::types::*;
use crate::error::{FlowError, FlowResult, codes};
use crate::nodes::{CapabilityRegistry, NodeInput, NodeOutcome, NodeStream, ResumeInfo};
use crate::storage::{Repository, Transition};
use crate::stream::{Progress, ProgressSink};

const DEFAULT_BATCH_CONCURRENCY: usize = 10;
const DEFAULT_RETRY_BACKOFF_MS: u64 = 1000;
const DEFAULT_DEBUG_URL: &str =
    "http://localhost:8080/debug?workflow_id={workflow_id}&execute_id={execute_id}";
const MAX_SUB_WORKFLOW_DEPTH: usize = 8;

/// Engine tuning. Defaults come from `CANVASFLOW_*` environment variables.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Capability calls running at once across the whole engine.
    pub max_concurrent_nodes: usize,
    /// Batch iterations running at once when a node sets no `concurrentSize`.
    pub default_batch_concurrency: usize,
    /// Initial retry backoff; doubles every attempt.
    pub retry_backoff_ms: u64,
    pub run_timeout_ms: Option<u64>,
    /// `{workflow_id}` and `{execute_id}` are substituted.
    pub debug_url_template: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

fn env_var<T: FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

impl EngineConfig {
    pub fn from_env() -> Self {
        Self {
            max_concurrent_nodes: env_var("CANVASFLOW_MAX_CONCURRENT_NODES")
                .unwrap_or_else(num_cpus::get),
            default_batch_concurrency: env_var("CANVASFLOW_BATCH_CONCURRENCY")
                .unwrap_or(DEFAULT_BATCH_CONCURRENCY),
            retry_backoff_ms: env_var("CANVASFLOW_RETRY_BACKOFF_MS")
                .unwrap_or(DEFAULT_RETRY_BACKOFF_MS),
            run_timeout_ms: env_var("CANVASFLOW_RUN_TIMEOUT_MS"),
            debug_url_template: std::env::var("CANVASFLOW_DEBUG_URL")
                .unwrap_or_else(|_| DEFAULT_DEBUG_URL.to_string()),
        }
    }

    pub fn debug_url(&self, workflow_id: &str, execute_id: &str) -> String {
        self.debug_url_template
            .replace("{workflow_id}", workflow_id)
            .replace("{execute_id}", execute_id)
    }
}

/// Per-run switches.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub sink: ProgressSink,
    /// When false, a node that tries to suspend fails the run with
    /// `InterruptNotSupported`.
    pub allow_interrupts: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            sink: ProgressSink::disabled(),
            allow_interrupts: true,
        }
    }
}

/// Where an execution stands after a run invocation returns.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub execute_id: String,
    pub status: ExecutionStatus,
    pub output: Option<Value>,
    pub reason: Option<String>,
    pub error_code: Option<i64>,
    /// Open interrupts across the whole execution tree.
    pub interrupts: Vec<InterruptEvent>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LoopSignal {
    Break,
    Continue,
}

pub(crate) enum NodeStep {
    Done { output: Value, port: Option<String> },
    Suspended(PendingNode),
    Signal(LoopSignal),
}

pub(crate) enum ScopeOutcome {
    Completed {
        state: ScopeState,
        signal: Option<LoopSignal>,
    },
    /// Waiting on interrupts, or stopped by cancellation.
    Suspended(ScopeState),
}

/// Result of dispatching one node, before it is recorded.
pub(crate) struct Dispatched {
    pub step: NodeStep,
    pub input: Option<Value>,
    pub usage: TokenUsage,
    pub attempt: u32,
    /// Soft-failure error body.
    pub error: Option<String>,
    pub sub_execute_id: Option<String>,
}

impl Dispatched {
    pub(crate) fn done(output: Map<String, Value>, port: Option<String>, input: Option<Value>) -> Self {
        Self {
            step: NodeStep::Done {
                output: Value::Object(output),
                port,
            },
            input,
            usage: TokenUsage::default(),
            attempt: 0,
            error: None,
            sub_execute_id: None,
        }
    }

    pub(crate) fn suspended(pending: PendingNode, input: Option<Value>) -> Self {
        Self {
            step: NodeStep::Suspended(pending),
            input,
            usage: TokenUsage::default(),
            attempt: 0,
            error: None,
            sub_execute_id: None,
        }
    }

    fn signal(signal: LoopSignal) -> Self {
        Self {
            step: NodeStep::Signal(signal),
            input: None,
            usage: TokenUsage::default(),
            attempt: 0,
            error: None,
            sub_execute_id: None,
        }
    }
}

/// Position of a scope within the execution tree.
#[derive(Clone)]
pub(crate) struct Frame {
    pub execute_id: String,
    pub workflow_id: String,
    /// Execution IDs from the root down to `execute_id`.
    pub lineage: Vec<String>,
    pub segments: Vec<AddressSegment>,
    /// Bindings visible from enclosing scopes.
    pub env: Arc<Env>,
    pub index: Option<usize>,
    pub depth: usize,
    /// Start node output of the execution this scope belongs to.
    pub start_input: Arc<Map<String, Value>>,
}

impl Frame {
    fn root(execution: &Execution, start_input: Map<String, Value>) -> Self {
        Self {
            execute_id: execution.id.clone(),
            workflow_id: execution.workflow_id.clone(),
            lineage: vec![execution.id.clone()],
            segments: Vec::new(),
            env: Env::root(BTreeMap::new()),
            index: None,
            depth: 0,
            start_input: Arc::new(start_input),
        }
    }

    fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// Frame for iteration `index` of a composite node dispatched under `env`.
    pub(crate) fn iteration(
        &self,
        env: &Arc<Env>,
        node: &Node,
        index: usize,
        mut vars: Map<String, Value>,
    ) -> Frame {
        vars.insert("index".to_string(), Value::from(index));
        let mut segments = self.segments.clone();
        segments.push(AddressSegment::Iteration {
            node_id: node.id.clone(),
            index,
        });
        Frame {
            segments,
            env: Env::child(env, BTreeMap::from([(node.id.clone(), Value::Object(vars))])),
            index: Some(index),
            ..self.clone()
        }
    }
}

/// State shared by every scope of one run invocation.
pub(crate) struct RunCtx {
    pub root_execute_id: String,
    pub mode: ExecuteMode,
    pub sink: ProgressSink,
    allow_interrupts: bool,
    seq: AtomicU64,
    new_events: Mutex<Vec<InterruptEvent>>,
    checkpoint: tokio::sync::Mutex<CheckpointState>,
}

impl RunCtx {
    fn new(checkpoint: CheckpointState, mode: ExecuteMode, options: RunOptions) -> Self {
        Self {
            root_execute_id: checkpoint.execute_id.clone(),
            mode,
            sink: options.sink,
            allow_interrupts: options.allow_interrupts,
            seq: AtomicU64::new(checkpoint.next_seq),
            new_events: Mutex::new(Vec::new()),
            checkpoint: tokio::sync::Mutex::new(checkpoint),
        }
    }

    fn new_event(
        &self,
        node: &Node,
        frame: &Frame,
        event_type: InterruptType,
        payload: Value,
    ) -> InterruptEvent {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        let address = NodeAddress::new(frame.segments.clone(), &node.id);
        InterruptEvent {
            id: event_id(&self.root_execute_id, &address, seq),
            root_execute_id: self.root_execute_id.clone(),
            execute_id: frame.execute_id.clone(),
            event_type,
            node_id: node.id.clone(),
            node_type: node.kind,
            node_title: node.title().to_string(),
            payload,
            address,
            created_at: Utc::now(),
        }
    }

    fn push_event(&self, event: InterruptEvent) {
        self.new_events
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(event);
    }

    fn take_events(&self) -> Vec<InterruptEvent> {
        std::mem::take(&mut *self.new_events.lock().unwrap_or_else(|p| p.into_inner()))
    }

    fn send_events(&self, events: Vec<InterruptEvent>) {
        for event in events {
            info!(execute_id = %event.execute_id, event_id = %event.id, event_type = %event.event_type, "Interrupt registered");
            self.sink.send(Progress::Interrupt(event));
        }
    }

    /// Register interrupts raised so far without waiting for the root wave to
    /// end. The root scope in the checkpoint is left as of the last wave.
    async fn announce(&self, store: &dyn CheckpointStore) -> FlowResult<()> {
        let events = self.take_events();
        if events.is_empty() {
            return Ok(());
        }
        {
            let mut ck = self.checkpoint.lock().await;
            ck.next_seq = self.seq.load(Ordering::SeqCst);
            for e in &events {
                ck.interrupts.insert(e.id.clone(), e.clone());
            }
            ck.updated_at = Utc::now();
            store.save(&ck.execute_id, &ck).await?;
        }
        self.send_events(events);
        Ok(())
    }

    /// Write the root scope and newly raised interrupts, then announce them.
    async fn persist(&self, store: &dyn CheckpointStore, root: &ScopeState) -> FlowResult<()> {
        let events = self.take_events();
        {
            let mut ck = self.checkpoint.lock().await;
            ck.root = root.clone();
            ck.next_seq = self.seq.load(Ordering::SeqCst);
            for e in &events {
                ck.interrupts.insert(e.id.clone(), e.clone());
            }
            // Interrupts whose node is no longer pending can never be resumed.
            ck.interrupts.retain(|id, e| {
                matches!(root.pending_at(&e.address), Some(PendingNode::Interrupt(s)) if &s.event_id == id)
            });
            ck.updated_at = Utc::now();
            store.save(&ck.execute_id, &ck).await?;
        }
        self.send_events(events);
        Ok(())
    }

    async fn open_interrupts(&self) -> usize {
        self.checkpoint.lock().await.interrupts.len()
    }
}

fn invalid_config(node: &Node, err: serde_json::Error) -> FlowError {
    FlowError::NodeRuntime {
        node_id: node.id.clone(),
        message: format!("invalid config: {}", err),
    }
}

/// Output of whichever End node ran in a completed scope.
pub(crate) fn end_output(graph: &Graph<'_>, state: &ScopeState) -> Option<Value> {
    graph
        .nodes
        .iter()
        .filter(|n| n.kind == NodeKind::End)
        .find_map(|n| state.outputs.get(&n.id).cloned())
}

/// The workflow execution engine: interprets canvases, suspends on
/// interrupts, and resumes from checkpoints.
pub struct WorkflowEngine {
    registry: Arc<CapabilityRegistry>,
    repo: Arc<dyn Repository>,
    checkpoints: Arc<dyn CheckpointStore>,
    config: EngineConfig,
    semaphore: Arc<Semaphore>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl WorkflowEngine {
    pub fn new(
        registry: Arc<CapabilityRegistry>,
        repo: Arc<dyn Repository>,
        checkpoints: Arc<dyn CheckpointStore>,
        config: EngineConfig,
    ) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent_nodes.max(1)));
        Self {
            registry,
            repo,
            checkpoints,
            config,
            semaphore,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &CapabilityRegistry {
        &self.registry
    }

    /// One writer per execution tree: runs and resumes serialize here.
    /// Checkpoint and stream the interrupts of a suspended composite iteration.
    pub(crate) async fn announce_interrupts(&self, ctx: &RunCtx) -> FlowResult<()> {
        ctx.announce(self.checkpoints.as_ref()).await
    }

    fn lock_for(&self, root_execute_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .entry(root_execute_id.to_string())
            .or_default()
            .clone()
    }

    fn forget_lock(&self, root_execute_id: &str) {
        self.locks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(root_execute_id);
    }

    async fn load_execution(&self, execute_id: &str) -> FlowResult<Execution> {
        self.repo
            .get_execution(execute_id)
            .await?
            .ok_or_else(|| FlowError::not_found("execution", execute_id))
    }

    async fn load_snapshot(&self, commit_id: &str) -> FlowResult<Canvas> {
        self.repo
            .get_snapshot(commit_id)
            .await?
            .ok_or_else(|| FlowError::not_found("canvas snapshot", commit_id))
    }

    async fn is_cancelled(&self, root_execute_id: &str) -> FlowResult<bool> {
        Ok(self
            .repo
            .get_execution(root_execute_id)
            .await?
            .is_some_and(|e| e.status == ExecutionStatus::Cancelled))
    }

    /// Current status of an execution plus the open interrupts of its tree.
    pub async fn report(&self, execute_id: &str) -> FlowResult<RunReport> {
        let execution = self.load_execution(execute_id).await?;
        let interrupts = self
            .checkpoints
            .list_open_interrupts(&execution.root_execute_id)
            .await?
            .into_iter()
            .filter(|e| e.address.is_within(&execution.root_execute_id, &execution.id))
            .collect();
        Ok(RunReport {
            execute_id: execution.id,
            status: execution.status,
            output: execution.output,
            reason: execution.reason,
            error_code: execution.error_code,
            interrupts,
        })
    }

    /// Drive a root execution from its checkpoint until it finishes or
    /// every runnable branch is waiting on an interrupt.
    pub async fn run(&self, execute_id: &str, options: RunOptions) -> FlowResult<RunReport> {
        let lock = self.lock_for(execute_id);
        let _guard = lock.lock().await;

        let execution = self.load_execution(execute_id).await?;
        if !execution.is_root() {
            return Err(FlowError::InvalidParam(format!(
                "execution '{}' is a sub-execution; run its root '{}'",
                execute_id, execution.root_execute_id
            )));
        }
        if execution.status.is_terminal() {
            return self.report(execute_id).await;
        }

        let checkpoint = self
            .checkpoints
            .load(execute_id)
            .await?
            .ok_or_else(|| FlowError::not_found("checkpoint", execute_id))?;
        let canvas = self.load_snapshot(&execution.commit_id).await?;
        let graph = Graph::new(&canvas.nodes, &canvas.edges);
        let root_state = checkpoint.root.clone();
        let frame = Frame::root(&execution, checkpoint.input.clone());
        let ctx = RunCtx::new(checkpoint, execution.mode, options);

        info!(execute_id = %execute_id, workflow_id = %execution.workflow_id, "Running workflow");

        let scope = self.run_scope(&ctx, &graph, root_state, &frame);
        let outcome = match self.config.run_timeout_ms {
            Some(ms) => match tokio::time::timeout(Duration::from_millis(ms), scope).await {
                Ok(r) => r,
                Err(_) => Err(FlowError::ExecutionFailed("execution timed out".to_string())),
            },
            None => scope.await,
        };

        self.finish(&ctx, &execution, &graph, outcome).await
    }

    async fn finish(
        &self,
        ctx: &RunCtx,
        execution: &Execution,
        graph: &Graph<'_>,
        outcome: FlowResult<ScopeOutcome>,
    ) -> FlowResult<RunReport> {
        let id = execution.id.as_str();
        let debug_url = self.config.debug_url(&execution.workflow_id, id);

        match outcome {
            Ok(ScopeOutcome::Completed { state, .. }) => {
                let output = end_output(graph, &state);
                let won = self
                    .repo
                    .transition_execution(
                        id,
                        ExecutionStatus::Running,
                        ExecutionStatus::Success,
                        Transition {
                            output: output.clone(),
                            ..Default::default()
                        },
                    )
                    .await?;
                self.checkpoints.delete(id).await?;
                self.forget_lock(id);
                if won {
                    info!(execute_id = %id, "Workflow execution complete");
                    ctx.sink.send(Progress::Finished {
                        execute_id: id.to_string(),
                        status: ExecutionStatus::Success,
                        output,
                        error: None,
                        debug_url,
                    });
                } else {
                    self.announce_cancelled(ctx, id, debug_url);
                }
            }
            Ok(ScopeOutcome::Suspended(state)) => {
                if self.is_cancelled(id).await? {
                    self.checkpoints.delete(id).await?;
                    self.forget_lock(id);
                    self.announce_cancelled(ctx, id, debug_url);
                } else {
                    ctx.persist(self.checkpoints.as_ref(), &state).await?;
                    if ctx.open_interrupts().await == 0 {
                        let err = FlowError::ExecutionFailed(
                            "execution stalled with no runnable node".to_string(),
                        );
                        return self.fail(ctx, execution, err, debug_url).await;
                    }
                    info!(execute_id = %id, "Workflow suspended waiting for input");
                    ctx.sink.send(Progress::Finished {
                        execute_id: id.to_string(),
                        status: ExecutionStatus::Running,
                        output: None,
                        error: None,
                        debug_url,
                    });
                }
            }
            Err(err) => return self.fail(ctx, execution, err, debug_url).await,
        }

        self.report(id).await
    }

    async fn fail(
        &self,
        ctx: &RunCtx,
        execution: &Execution,
        err: FlowError,
        debug_url: String,
    ) -> FlowResult<RunReport> {
        let id = execution.id.as_str();
        let reason = err.to_string();
        let code = err.code();
        error!(execute_id = %id, error = %reason, "Workflow execution failed");

        self.repo
            .transition_execution(
                id,
                ExecutionStatus::Running,
                ExecutionStatus::Failed,
                Transition {
                    reason: Some(reason.clone()),
                    error_code: Some(code),
                    output: None,
                },
            )
            .await?;
        self.close_descendants(id, ExecutionStatus::Failed, &reason)
            .await?;
        self.checkpoints.delete(id).await?;
        self.forget_lock(id);
        ctx.sink.send(Progress::Finished {
            execute_id: id.to_string(),
            status: ExecutionStatus::Failed,
            output: None,
            error: Some((code, reason)),
            debug_url,
        });

        if matches!(err, FlowError::Store(_) | FlowError::InterruptNotSupported) {
            return Err(err);
        }
        self.report(id).await
    }

    fn announce_cancelled(&self, ctx: &RunCtx, id: &str, debug_url: String) {
        warn!(execute_id = %id, "Workflow execution was cancelled");
        ctx.sink.send(Progress::Finished {
            execute_id: id.to_string(),
            status: ExecutionStatus::Cancelled,
            output: None,
            error: Some((codes::ERR_CANCELLED, FlowError::Cancelled.to_string())),
            debug_url,
        });
    }

    /// Move every still-running sub-execution under `parent` to `status`.
    fn close_descendants<'a>(
        &'a self,
        parent: &'a str,
        status: ExecutionStatus,
        reason: &'a str,
    ) -> BoxFuture<'a, FlowResult<()>> {
        async move {
            for child in self.repo.list_child_executions(parent).await? {
                self.repo
                    .transition_execution(
                        &child.id,
                        ExecutionStatus::Running,
                        status,
                        Transition {
                            reason: Some(reason.to_string()),
                            ..Default::default()
                        },
                    )
                    .await?;
                self.close_descendants(&child.id, status, reason).await?;
            }
            Ok(())
        }
        .boxed()
    }

    /// Feed resume data to the node suspended under `event_id`.
    /// The caller runs the execution afterwards.
    pub async fn resume(&self, execute_id: &str, event_id: &str, data: Value) -> FlowResult<String> {
        let execution = self.load_execution(execute_id).await?;
        let root_id = execution.root_execute_id.clone();
        if event_root(event_id) != Some(root_id.as_str()) {
            return Err(FlowError::not_found("interrupt event", event_id));
        }

        let lock = self.lock_for(&root_id);
        let _guard = lock.lock().await;

        let root = self.load_execution(&root_id).await?;
        let mut checkpoint = match self.checkpoints.load(&root_id).await? {
            Some(c) if !root.status.is_terminal() => c,
            _ => return Err(FlowError::not_found("interrupt event", event_id)),
        };
        if checkpoint.resumed.contains(event_id) {
            return Err(FlowError::AlreadyResumed(event_id.to_string()));
        }
        let Some(event) = checkpoint.interrupts.get(event_id).cloned() else {
            return Err(FlowError::not_found("interrupt event", event_id));
        };
        if !event.address.is_within(&root_id, execute_id) {
            return Err(FlowError::not_found("interrupt event", event_id));
        }

        match checkpoint.root.pending_at_mut(&event.address) {
            Some(PendingNode::Interrupt(s)) if s.event_id == event_id => s.resume = Some(data),
            _ => return Err(FlowError::not_found("interrupt event", event_id)),
        }
        checkpoint.interrupts.remove(event_id);
        checkpoint.resumed.insert(event_id.to_string());
        checkpoint.updated_at = Utc::now();
        self.checkpoints.save(&root_id, &checkpoint).await?;

        info!(execute_id = %root_id, event_id = %event_id, "Interrupt resumed");
        Ok(root_id)
    }

    /// Cancel a running execution tree. Terminal executions are left alone.
    pub async fn cancel(&self, execute_id: &str) -> FlowResult<ExecutionStatus> {
        let execution = self.load_execution(execute_id).await?;
        let root_id = execution.root_execute_id.clone();

        let cancelled = self
            .repo
            .transition_execution(
                &root_id,
                ExecutionStatus::Running,
                ExecutionStatus::Cancelled,
                Transition {
                    reason: Some("cancelled by user".to_string()),
                    error_code: Some(codes::ERR_CANCELLED),
                    output: None,
                },
            )
            .await?;
        if cancelled {
            info!(execute_id = %root_id, "Execution cancelled");
            self.close_descendants(&root_id, ExecutionStatus::Cancelled, "cancelled by user")
                .await?;
            self.checkpoints.delete(&root_id).await?;
        }
        Ok(self.load_execution(&root_id).await?.status)
    }

    /// Walk one graph level in dependency order. Nodes whose inbound edges
    /// are all resolved dispatch together as a wave.
    pub(crate) fn run_scope<'a>(
        &'a self,
        ctx: &'a RunCtx,
        graph: &'a Graph<'a>,
        mut state: ScopeState,
        frame: &'a Frame,
    ) -> BoxFuture<'a, FlowResult<ScopeOutcome>> {
        async move {
            let mut parked: HashSet<String> = HashSet::new();

            loop {
                if self.is_cancelled(&ctx.root_execute_id).await? {
                    warn!(execute_id = %frame.execute_id, "Cancelled; no further dispatch");
                    return Ok(ScopeOutcome::Suspended(state));
                }
                self.mark_skipped(graph, &mut state, frame).await?;

                let ready: Vec<&Node> = graph
                    .nodes
                    .iter()
                    .filter(|n| {
                        !state.is_done(&n.id)
                            && !parked.contains(&n.id)
                            && graph.inbound(&n.id).iter().all(|e| state.is_done(&e.source))
                    })
                    .collect();
                if ready.is_empty() {
                    break;
                }

                let env = Env::child(&frame.env, state.outputs.clone());
                let jobs: Vec<(&Node, Option<PendingNode>)> = ready
                    .into_iter()
                    .map(|n| (n, state.pending.remove(&n.id)))
                    .collect();
                let results = join_all(jobs.into_iter().map(|(node, pending)| {
                    let env = env.clone();
                    async move { (node, self.exec_node(ctx, node, pending, env, frame).await) }
                }))
                .await;

                let mut failure = None;
                let mut signal = None;
                for (node, result) in results {
                    match result {
                        Ok(NodeStep::Done { output, port }) => {
                            if node.kind == NodeKind::VariableAssigner
                                && let Value::Object(map) = &output
                            {
                                state.assignments.extend(map.clone());
                            }
                            state.outputs.insert(node.id.clone(), output);
                            state.ports.insert(node.id.clone(), port);
                        }
                        Ok(NodeStep::Suspended(pending)) => {
                            state.pending.insert(node.id.clone(), pending);
                            parked.insert(node.id.clone());
                        }
                        Ok(NodeStep::Signal(s)) => {
                            state.outputs.insert(node.id.clone(), Value::Object(Map::new()));
                            state.ports.insert(node.id.clone(), None);
                            signal.get_or_insert(s);
                        }
                        Err(e) => {
                            failure.get_or_insert(e);
                        }
                    }
                }

                if let Some(e) = failure {
                    return Err(e);
                }
                if frame.is_root() {
                    ctx.persist(self.checkpoints.as_ref(), &state).await?;
                }
                if signal.is_some() {
                    return Ok(ScopeOutcome::Completed { state, signal });
                }
            }

            if state.pending.is_empty() {
                Ok(ScopeOutcome::Completed {
                    state,
                    signal: None,
                })
            } else {
                Ok(ScopeOutcome::Suspended(state))
            }
        }
        .boxed()
    }

    /// Skip nodes whose inbound edges are all resolved but none was taken.
    async fn mark_skipped(
        &self,
        graph: &Graph<'_>,
        state: &mut ScopeState,
        frame: &Frame,
    ) -> FlowResult<()> {
        loop {
            let newly: Vec<&Node> = graph
                .nodes
                .iter()
                .filter(|n| {
                    if state.is_done(&n.id) || state.pending.contains_key(&n.id) {
                        return false;
                    }
                    let inbound = graph.inbound(&n.id);
                    !inbound.is_empty()
                        && inbound.iter().all(|e| state.is_done(&e.source))
                        && !inbound.iter().any(|e| Graph::edge_taken(e, state))
                })
                .collect();
            if newly.is_empty() {
                return Ok(());
            }
            for node in newly {
                state.skipped.insert(node.id.clone());
                let mut record = NodeResult::new(
                    &frame.execute_id,
                    &frame.workflow_id,
                    &node.id,
                    node.kind,
                    node.title(),
                );
                record.index = frame.index;
                record.finish(NodeStatus::Skipped);
                self.repo.upsert_node_result(&record).await?;
            }
        }
    }

    /// Dispatch one node, apply its failure policy, and record the result.
    async fn exec_node(
        &self,
        ctx: &RunCtx,
        node: &Node,
        pending: Option<PendingNode>,
        env: Arc<Env>,
        frame: &Frame,
    ) -> FlowResult<NodeStep> {
        // Still waiting under its existing event.
        let pending = match pending {
            Some(PendingNode::Interrupt(s)) if s.resume.is_none() => {
                return Ok(NodeStep::Suspended(PendingNode::Interrupt(s)));
            }
            other => other,
        };

        let mut record = NodeResult::new(
            &frame.execute_id,
            &frame.workflow_id,
            &node.id,
            node.kind,
            node.title(),
        );
        record.index = frame.index;
        self.repo.upsert_node_result(&record).await?;

        let dispatched = match self.dispatch(ctx, node, pending, &env, frame).await {
            Ok(d) => d,
            Err(e) if policy::is_recoverable(&e) => {
                let message = e.to_string();
                match policy::on_exhausted(node, message.clone()) {
                    Ok(recovered) => {
                        warn!(node_id = %node.id, error = %message, "Node failed; continuing per error policy");
                        let mut d = Dispatched::done(recovered.output, recovered.port, None);
                        d.error = Some(recovered.error);
                        d
                    }
                    Err(fatal) => {
                        record.error = Some(message);
                        record.finish(NodeStatus::Failed);
                        self.repo.upsert_node_result(&record).await?;
                        return Err(fatal);
                    }
                }
            }
            Err(e) => {
                record.error = Some(e.to_string());
                record.finish(NodeStatus::Failed);
                self.repo.upsert_node_result(&record).await?;
                return Err(e);
            }
        };

        record.input = dispatched.input;
        record.attempt = dispatched.attempt;
        record.usage = dispatched.usage;
        record.sub_execute_id = dispatched.sub_execute_id;
        record.error = dispatched.error;
        match &dispatched.step {
            NodeStep::Done { output, .. } => {
                record.output = Some(output.clone());
                record.finish(NodeStatus::Success);
            }
            NodeStep::Suspended(_) => record.status = NodeStatus::Interrupted,
            NodeStep::Signal(_) => record.finish(NodeStatus::Success),
        }
        self.repo.upsert_node_result(&record).await?;

        // Sub-workflow usage was already counted by its own nodes.
        if !record.usage.is_zero() && node.kind != NodeKind::SubWorkflow {
            for id in &frame.lineage {
                self.repo.add_usage(id, &record.usage).await?;
            }
        }

        Ok(dispatched.step)
    }

    async fn dispatch(
        &self,
        ctx: &RunCtx,
        node: &Node,
        pending: Option<PendingNode>,
        env: &Arc<Env>,
        frame: &Frame,
    ) -> FlowResult<Dispatched> {
        match node.kind {
            NodeKind::Start => Ok(Dispatched::done(
                frame.start_input.as_ref().clone(),
                None,
                None,
            )),
            NodeKind::End => {
                let inputs = resolve_params(&node.data.inputs, env);
                let cfg: EndConfig = node.config().map_err(|e| invalid_config(node, e))?;
                let output = match cfg.terminate_plan {
                    TerminatePlan::ReturnVariables => inputs.clone(),
                    TerminatePlan::UseAnswerContent => {
                        let text = render(cfg.content.as_deref().unwrap_or_default(), &inputs);
                        self.node_stream(ctx, node, frame).finish(&text);
                        Map::from_iter([("output".to_string(), Value::String(text))])
                    }
                };
                Ok(Dispatched::done(output, None, Some(Value::Object(inputs))))
            }
            NodeKind::Message => {
                let inputs = resolve_params(&node.data.inputs, env);
                let cfg: MessageConfig = node.config().map_err(|e| invalid_config(node, e))?;
                let text = render(&cfg.content, &inputs);
                self.node_stream(ctx, node, frame).finish(&text);
                let output = Map::from_iter([("output".to_string(), Value::String(text))]);
                Ok(Dispatched::done(output, None, Some(Value::Object(inputs))))
            }
            NodeKind::Selector => {
                let cfg: SelectorConfig = node.config().map_err(|e| invalid_config(node, e))?;
                let port = SelectorConfig::port_for(evaluate_selector(&cfg, env));
                let output =
                    Map::from_iter([("selected".to_string(), Value::String(port.clone()))]);
                Ok(Dispatched::done(output, Some(port), None))
            }
            NodeKind::VariableAssigner => {
                let inputs = resolve_params(&node.data.inputs, env);
                Ok(Dispatched::done(
                    inputs.clone(),
                    None,
                    Some(Value::Object(inputs)),
                ))
            }
            NodeKind::Break => Ok(Dispatched::signal(LoopSignal::Break)),
            NodeKind::Continue => Ok(Dispatched::signal(LoopSignal::Continue)),
            NodeKind::Loop => self.run_loop(ctx, node, pending, env, frame).await,
            NodeKind::Batch => self.run_batch(ctx, node, pending, env, frame).await,
            NodeKind::SubWorkflow => self.run_sub_workflow(ctx, node, pending, env, frame).await,
            _ => self.run_capability(ctx, node, pending, env, frame).await,
        }
    }

    fn node_stream(&self, ctx: &RunCtx, node: &Node, frame: &Frame) -> NodeStream {
        NodeStream::new(
            ctx.sink.clone(),
            &frame.execute_id,
            &node.id,
            node.kind,
            node.title(),
        )
    }

    /// Coerce provider output against the node's declared outputs.
    fn shape_output(&self, node: &Node, output: Map<String, Value>) -> Map<String, Value> {
        if node.data.outputs.is_empty() {
            return output;
        }
        let opts = CoerceOptions {
            skip_required_check: true,
            ..Default::default()
        };
        match coerce_fields(&node.data.outputs, &output, opts) {
            Ok(coerced) => coerced.value,
            Err(_) => output,
        }
    }

    async fn run_capability(
        &self,
        ctx: &RunCtx,
        node: &Node,
        pending: Option<PendingNode>,
        env: &Arc<Env>,
        frame: &Frame,
    ) -> FlowResult<Dispatched> {
        let provider = self
            .registry
            .get(node.kind)
            .ok_or_else(|| FlowError::NodeRuntime {
                node_id: node.id.clone(),
                message: format!("no capability provider registered for '{}'", node.kind),
            })?;

        let inputs = resolve_params(&node.data.inputs, env);
        let (resume, first_attempt) = match pending {
            Some(PendingNode::Interrupt(s)) => (
                s.resume.map(|data| ResumeInfo {
                    data,
                    state: s.state,
                }),
                s.attempt,
            ),
            _ => (None, 0),
        };
        let input = NodeInput {
            execute_id: frame.execute_id.clone(),
            node_id: node.id.clone(),
            title: node.title().to_string(),
            inputs: inputs.clone(),
            config: node.data.config.clone(),
            outputs: node.data.outputs.clone(),
            resume,
            attempt: first_attempt,
            stream: self.node_stream(ctx, node, frame),
        };

        let attempted = {
            let _permit = self
                .semaphore
                .acquire()
                .await
                .map_err(|e| FlowError::Store(e.into()))?;
            policy::call_with_retry(
                provider.as_ref(),
                node,
                input,
                first_attempt,
                self.config.retry_backoff_ms,
            )
            .await
        };

        let input = Some(Value::Object(inputs));
        match attempted.outcome {
            Ok(NodeOutcome::Output(out)) => {
                let output = self.shape_output(node, out.output);
                let mut d = Dispatched::done(output, policy::success_port(node, out.port), input);
                d.usage = out.usage;
                d.attempt = attempted.attempt;
                Ok(d)
            }
            Ok(NodeOutcome::Interrupt(req)) => {
                if !ctx.allow_interrupts {
                    return Err(FlowError::InterruptNotSupported);
                }
                let event = ctx.new_event(node, frame, req.event_type, req.payload);
                info!(execute_id = %frame.execute_id, node_id = %node.id, event_id = %event.id, "Node interrupted");
                let pending = PendingNode::Interrupt(InterruptState {
                    event_id: event.id.clone(),
                    resume: None,
                    state: req.state,
                    attempt: attempted.attempt,
                });
                ctx.push_event(event);
                let mut d = Dispatched::suspended(pending, input);
                d.attempt = attempted.attempt;
                Ok(d)
            }
            Err(message) => Err(FlowError::NodeRuntime {
                node_id: node.id.clone(),
                message,
            }),
        }
    }

    async fn run_sub_workflow(
        &self,
        ctx: &RunCtx,
        node: &Node,
        pending: Option<PendingNode>,
        env: &Arc<Env>,
        frame: &Frame,
    ) -> FlowResult<Dispatched> {
        if frame.depth >= MAX_SUB_WORKFLOW_DEPTH {
            return Err(FlowError::NodeRuntime {
                node_id: node.id.clone(),
                message: format!("sub-workflow nesting exceeds {} levels", MAX_SUB_WORKFLOW_DEPTH),
            });
        }

        let mut sub = match pending {
            Some(PendingNode::SubWorkflow(s)) => s,
            _ => self.start_sub_execution(ctx, node, env, frame).await?,
        };
        let canvas = self.load_snapshot(&sub.commit_id).await?;
        let graph = Graph::new(&canvas.nodes, &canvas.edges);

        let mut lineage = frame.lineage.clone();
        lineage.push(sub.execute_id.clone());
        let mut segments = frame.segments.clone();
        segments.push(AddressSegment::SubExecution {
            node_id: node.id.clone(),
            execute_id: sub.execute_id.clone(),
        });
        let child = Frame {
            execute_id: sub.execute_id.clone(),
            workflow_id: sub.workflow_id.clone(),
            lineage,
            segments,
            env: Env::root(BTreeMap::new()),
            index: None,
            depth: frame.depth + 1,
            start_input: Arc::new(sub.input.clone()),
        };

        let input = Some(Value::Object(sub.input.clone()));
        let state = std::mem::take(&mut sub.scope);
        match self.run_scope(ctx, &graph, state, &child).await {
            Ok(ScopeOutcome::Completed { state, .. }) => {
                let output = match end_output(&graph, &state) {
                    Some(Value::Object(map)) => map,
                    Some(other) => Map::from_iter([("output".to_string(), other)]),
                    None => Map::new(),
                };
                self.repo
                    .transition_execution(
                        &sub.execute_id,
                        ExecutionStatus::Running,
                        ExecutionStatus::Success,
                        Transition {
                            output: Some(Value::Object(output.clone())),
                            ..Default::default()
                        },
                    )
                    .await?;
                let usage = self
                    .repo
                    .get_execution(&sub.execute_id)
                    .await?
                    .map(|e| e.usage)
                    .unwrap_or_default();
                info!(execute_id = %sub.execute_id, parent = %frame.execute_id, "Sub-execution complete");

                let output = self.shape_output(node, output);
                let mut d = Dispatched::done(output, policy::success_port(node, None), input);
                d.usage = usage;
                d.sub_execute_id = Some(sub.execute_id);
                Ok(d)
            }
            Ok(ScopeOutcome::Suspended(state)) => {
                sub.scope = state;
                let sub_execute_id = sub.execute_id.clone();
                let mut d = Dispatched::suspended(PendingNode::SubWorkflow(sub), input);
                d.sub_execute_id = Some(sub_execute_id);
                Ok(d)
            }
            Err(e) => {
                let reason = e.to_string();
                self.repo
                    .transition_execution(
                        &sub.execute_id,
                        ExecutionStatus::Running,
                        ExecutionStatus::Failed,
                        Transition {
                            reason: Some(reason.clone()),
                            error_code: Some(e.code()),
                            output: None,
                        },
                    )
                    .await?;
                if policy::is_recoverable(&e) {
                    Err(FlowError::ExecutionFailed(format!(
                        "sub-workflow '{}' failed: {}",
                        sub.workflow_id, reason
                    )))
                } else {
                    Err(e)
                }
            }
        }
    }

    async fn start_sub_execution(
        &self,
        ctx: &RunCtx,
        node: &Node,
        env: &Arc<Env>,
        frame: &Frame,
    ) -> FlowResult<SubWorkflowState> {
        let cfg: SubWorkflowConfig = node.config().map_err(|e| invalid_config(node, e))?;
        let record = self
            .repo
            .get_workflow(&cfg.workflow_id)
            .await?
            .ok_or_else(|| FlowError::NodeRuntime {
                node_id: node.id.clone(),
                message: format!("sub-workflow '{}' does not exist", cfg.workflow_id),
            })?;
        let published = record
            .version(cfg.workflow_version.as_deref())
            .cloned()
            .ok_or_else(|| FlowError::NodeRuntime {
                node_id: node.id.clone(),
                message: format!(
                    "sub-workflow '{}' has no published version {}",
                    cfg.workflow_id,
                    cfg.workflow_version.as_deref().unwrap_or("(latest)")
                ),
            })?;
        let canvas = self.load_snapshot(&published.commit_id).await?;

        let raw = resolve_params(&node.data.inputs, env);
        let fields = canvas
            .start_node()
            .map(|s| s.data.outputs.clone())
            .unwrap_or_default();
        let input = coerce_fields(&fields, &raw, CoerceOptions::default())?.value;

        let execute_id = Uuid::new_v4().to_string();
        let execution = Execution {
            id: execute_id.clone(),
            workflow_id: cfg.workflow_id.clone(),
            space_id: record.meta.space_id.clone(),
            version: Some(published.version.clone()),
            commit_id: published.commit_id.clone(),
            mode: ctx.mode,
            status: ExecutionStatus::Running,
            reason: None,
            error_code: None,
            root_execute_id: ctx.root_execute_id.clone(),
            parent_execute_id: Some(frame.execute_id.clone()),
            parent_node_id: Some(node.id.clone()),
            input: Value::Object(input.clone()),
            output: None,
            usage: TokenUsage::default(),
            created_at: Utc::now(),
            finished_at: None,
        };
        self.repo.create_execution(&execution).await?;
        info!(
            execute_id = %execute_id,
            parent = %frame.execute_id,
            workflow_id = %cfg.workflow_id,
            version = %published.version,
            "Started sub-execution"
        );

        Ok(SubWorkflowState {
            execute_id,
            workflow_id: cfg.workflow_id,
            version: Some(published.version),
            commit_id: published.commit_id,
            input,
            scope: ScopeState::default(),
        })
    }
}
