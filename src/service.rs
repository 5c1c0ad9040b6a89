//! Application service: workflow lifecycle, publishing, runs and history.
//!
//! Every entry point takes a [`Caller`] and checks that the target workflow
//! or execution lives in the caller's space before doing anything else.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::canvas::*;
use crate::checkpoint::{CheckpointState, CheckpointStore};
use crate::coercion::{CoerceOptions, coerce_fields};
use crate::engine::{EngineConfig, InterruptEvent, RunOptions, RunReport, WorkflowEngine};
use crate::engine::types::*;
use crate::error::{FlowError, FlowResult};
use crate::nodes::CapabilityRegistry;
use crate::storage::{Draft, PublishedVersion, Repository, WorkflowMeta, WorkflowRecord};
use crate::stream::{StreamEvent, spawn_emitter};
use crate::versioning::{self, CanvasDiff};

const DEFAULT_STREAM_BUFFER: usize = 64;
const DEBUG_START_ID: &str = "__debug_start__";
const DEBUG_END_ID: &str = "__debug_end__";
const MAX_REFERENCE_DEPTH: usize = 8;

/// Who is asking. Workflows and executions are only visible inside their space.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Caller {
    pub space_id: String,
    pub user_id: String,
}

impl Caller {
    pub fn new(space_id: &str, user_id: &str) -> Self {
        Self {
            space_id: space_id.to_string(),
            user_id: user_id.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceAction {
    Created,
    Updated,
    Published,
    Copied,
    Deleted,
}

/// Change notification for downstream indexes.
#[derive(Debug, Clone, Serialize)]
pub struct ResourceEvent {
    pub action: ResourceAction,
    pub workflow_id: String,
    pub space_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

#[async_trait]
pub trait ResourceNotifier: Send + Sync {
    async fn notify(&self, event: ResourceEvent) -> anyhow::Result<()>;
}

/// Writes resource events to the log.
pub struct LogNotifier;

#[async_trait]
impl ResourceNotifier for LogNotifier {
    async fn notify(&self, event: ResourceEvent) -> anyhow::Result<()> {
        info!(
            action = ?event.action,
            workflow_id = %event.workflow_id,
            space_id = %event.space_id,
            version = event.version.as_deref().unwrap_or(""),
            "Workflow resource changed"
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateWorkflow {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Initial canvas; a connected Start and End pair when absent.
    #[serde(default)]
    pub canvas: Option<Canvas>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PublishRequest {
    pub version: String,
    #[serde(default)]
    pub description: String,
    /// Skip validation and reference checks.
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CanvasStatus {
    /// Never published.
    Unpublished,
    /// The draft differs from the latest published version.
    Modified,
    Published,
}

#[derive(Debug, Clone, Serialize)]
pub struct CanvasInfo {
    pub meta: WorkflowMeta,
    pub canvas: Option<Canvas>,
    pub commit_id: Option<String>,
    pub latest_version: Option<String>,
    pub status: CanvasStatus,
    /// Draft against the latest published version.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diff: Option<CanvasDiff>,
    pub referrers: Vec<String>,
}

/// Values for a single-node debug run.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NodeDebugInput {
    #[serde(default)]
    pub input: Map<String, Value>,
    /// Batch inputs, merged over `input`.
    #[serde(default)]
    pub batch: Map<String, Value>,
    /// Merged over the node's own configuration.
    #[serde(default)]
    pub setting: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessInfo {
    pub execute_id: String,
    pub workflow_id: String,
    pub status: ExecutionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    pub node_results: Vec<NodeResult>,
    /// Open interrupts at or below this execution.
    pub node_events: Vec<InterruptEvent>,
    pub usage: TokenUsage,
    pub debug_url: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OpenApiRun {
    #[serde(default)]
    pub input: Map<String, Value>,
    /// Latest published version when absent.
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub is_async: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct OpenApiResult {
    pub execute_id: String,
    pub status: ExecutionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    pub usage: TokenUsage,
    pub debug_url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryScene {
    /// Results of the node inside one execution.
    Execution,
    /// The latest successful result of the node in any execution.
    LatestSuccess,
}

#[derive(Debug, Clone, Serialize)]
pub struct HistorySchema {
    pub workflow_id: String,
    pub execute_id: String,
    pub commit_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub canvas: Canvas,
}

/// Background runs by execution ID, tagged with a generation so a finished
/// task only removes its own entry.
#[derive(Default)]
struct RunTasks {
    next: AtomicU64,
    handles: Arc<Mutex<HashMap<String, (u64, JoinHandle<()>)>>>,
}

fn lock_handles(
    handles: &Mutex<HashMap<String, (u64, JoinHandle<()>)>>,
) -> std::sync::MutexGuard<'_, HashMap<String, (u64, JoinHandle<()>)>> {
    handles.lock().unwrap_or_else(|p| p.into_inner())
}

/// Wires the engine to workflow storage and versioning.
pub struct WorkflowService {
    engine: Arc<WorkflowEngine>,
    repo: Arc<dyn Repository>,
    checkpoints: Arc<dyn CheckpointStore>,
    notifier: Arc<dyn ResourceNotifier>,
    stream_buffer: usize,
    tasks: RunTasks,
}

impl WorkflowService {
    pub fn new(
        registry: Arc<CapabilityRegistry>,
        repo: Arc<dyn Repository>,
        checkpoints: Arc<dyn CheckpointStore>,
        config: EngineConfig,
    ) -> Self {
        let engine = Arc::new(WorkflowEngine::new(
            registry,
            repo.clone(),
            checkpoints.clone(),
            config,
        ));
        Self {
            engine,
            repo,
            checkpoints,
            notifier: Arc::new(LogNotifier),
            stream_buffer: DEFAULT_STREAM_BUFFER,
            tasks: RunTasks::default(),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn ResourceNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_stream_buffer(mut self, buffer: usize) -> Self {
        self.stream_buffer = buffer.max(1);
        self
    }

    pub fn engine(&self) -> &WorkflowEngine {
        &self.engine
    }

    // --- access control ---

    async fn load_workflow(&self, caller: &Caller, id: &str) -> FlowResult<WorkflowRecord> {
        let record = self
            .repo
            .get_workflow(id)
            .await?
            .ok_or_else(|| FlowError::not_found("workflow", id))?;
        if record.meta.space_id != caller.space_id {
            return Err(FlowError::PermissionDenied(format!(
                "workflow '{}' is not in space '{}'",
                id, caller.space_id
            )));
        }
        Ok(record)
    }

    async fn load_execution(&self, caller: &Caller, execute_id: &str) -> FlowResult<Execution> {
        let execution = self
            .repo
            .get_execution(execute_id)
            .await?
            .ok_or_else(|| FlowError::not_found("execution", execute_id))?;
        if execution.space_id != caller.space_id {
            return Err(FlowError::PermissionDenied(format!(
                "execution '{}' is not in space '{}'",
                execute_id, caller.space_id
            )));
        }
        Ok(execution)
    }

    async fn notify(&self, action: ResourceAction, meta: &WorkflowMeta, version: Option<String>) {
        let event = ResourceEvent {
            action,
            workflow_id: meta.id.clone(),
            space_id: meta.space_id.clone(),
            version,
        };
        if let Err(e) = self.notifier.notify(event).await {
            warn!(workflow_id = %meta.id, error = %e, "Resource notification failed");
        }
    }

    // --- lifecycle ---

    pub async fn list_workflows(&self, caller: &Caller) -> FlowResult<Vec<WorkflowMeta>> {
        Ok(self.repo.list_workflows(&caller.space_id).await?)
    }

    pub async fn create_workflow(&self, caller: &Caller, req: CreateWorkflow) -> FlowResult<WorkflowMeta> {
        let name = req.name.trim();
        if name.is_empty() {
            return Err(FlowError::InvalidParam("workflow name is required".to_string()));
        }
        let canvas = req.canvas.unwrap_or_else(default_canvas);
        let now = Utc::now();
        let meta = WorkflowMeta {
            id: Uuid::new_v4().to_string(),
            space_id: caller.space_id.clone(),
            name: name.to_string(),
            description: req.description,
            creator_id: caller.user_id.clone(),
            created_at: now,
            updated_at: now,
        };
        let record = WorkflowRecord {
            meta: meta.clone(),
            draft: Some(Draft {
                commit_id: versioning::commit_id(&canvas),
                canvas,
                updated_at: now,
            }),
            versions: Vec::new(),
            references: Vec::new(),
        };
        self.repo.put_workflow(&record).await?;
        info!(workflow_id = %meta.id, name = %meta.name, "Workflow created");
        self.notify(ResourceAction::Created, &meta, None).await;
        Ok(meta)
    }

    /// Store a draft canvas without validating it. Returns the new commit ID.
    pub async fn save_workflow(&self, caller: &Caller, id: &str, canvas_json: &[u8]) -> FlowResult<String> {
        let mut record = self.load_workflow(caller, id).await?;
        let canvas = parse_unchecked(canvas_json)?;
        let commit_id = versioning::commit_id(&canvas);
        let now = Utc::now();
        record.draft = Some(Draft {
            canvas,
            commit_id: commit_id.clone(),
            updated_at: now,
        });
        record.meta.updated_at = now;
        self.repo.put_workflow(&record).await?;
        info!(workflow_id = %id, commit_id = %commit_id, "Draft saved");
        self.notify(ResourceAction::Updated, &record.meta, None).await;
        Ok(commit_id)
    }

    /// Delete a workflow no other published workflow calls.
    pub async fn delete_workflow(&self, caller: &Caller, id: &str) -> FlowResult<()> {
        let record = self.load_workflow(caller, id).await?;
        let referrers: Vec<String> = self
            .repo
            .get_referrers(id)
            .await?
            .into_iter()
            .filter(|r| r != id)
            .collect();
        if !referrers.is_empty() {
            return Err(FlowError::InvalidParam(format!(
                "workflow '{}' is referenced by {}",
                id,
                referrers.join(", ")
            )));
        }
        self.repo.delete_workflow(id).await?;
        info!(workflow_id = %id, "Workflow deleted");
        self.notify(ResourceAction::Deleted, &record.meta, None).await;
        Ok(())
    }

    /// Copy the draft into a new, unpublished workflow in the same space.
    pub async fn copy_workflow(&self, caller: &Caller, id: &str) -> FlowResult<WorkflowMeta> {
        let source = self.load_workflow(caller, id).await?;
        let now = Utc::now();
        let meta = WorkflowMeta {
            id: Uuid::new_v4().to_string(),
            name: format!("{}_copy", source.meta.name),
            creator_id: caller.user_id.clone(),
            created_at: now,
            updated_at: now,
            ..source.meta.clone()
        };
        let record = WorkflowRecord {
            meta: meta.clone(),
            draft: source.draft.clone(),
            versions: Vec::new(),
            references: Vec::new(),
        };
        self.repo.put_workflow(&record).await?;
        info!(workflow_id = %meta.id, source = %id, "Workflow copied");
        self.notify(ResourceAction::Copied, &meta, None).await;
        Ok(meta)
    }

    /// Freeze the current draft as a new version.
    pub async fn publish_workflow(
        &self,
        caller: &Caller,
        id: &str,
        req: PublishRequest,
    ) -> FlowResult<PublishedVersion> {
        let mut record = self.load_workflow(caller, id).await?;
        let draft = record
            .draft
            .clone()
            .ok_or_else(|| FlowError::not_found("draft of workflow", id))?;
        let latest = record.versions.last().map(|v| v.version.clone());
        versioning::check_next_version(latest.as_deref(), &req.version)?;

        if !req.force {
            let mut issues = validate_tree(&draft.canvas);
            issues.extend(self.check_references(id, &draft.canvas).await?);
            if !issues.is_empty() {
                return Err(FlowError::Validation(issues));
            }
        }

        self.repo.save_snapshot(&draft.commit_id, &draft.canvas).await?;
        let published = PublishedVersion {
            version: req.version.clone(),
            commit_id: draft.commit_id.clone(),
            description: req.description,
            published_at: Utc::now(),
        };
        record.versions.push(published.clone());
        record.references = draft
            .canvas
            .sub_workflow_identities()
            .into_iter()
            .map(|i| i.id)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        record.meta.updated_at = published.published_at;
        self.repo.put_workflow(&record).await?;

        info!(workflow_id = %id, version = %published.version, commit_id = %published.commit_id, "Workflow published");
        self.notify(ResourceAction::Published, &record.meta, Some(published.version.clone()))
            .await;
        Ok(published)
    }

    /// Every SubWorkflow node must name an existing workflow other than
    /// `self_id` with the requested (or any) published version.
    async fn check_references(&self, self_id: &str, canvas: &Canvas) -> FlowResult<Vec<Issue>> {
        let mut issues = Vec::new();
        for node in canvas.all_nodes() {
            if node.kind != NodeKind::SubWorkflow {
                continue;
            }
            let Ok(cfg) = node.config::<SubWorkflowConfig>() else {
                continue;
            };
            if cfg.workflow_id == self_id {
                issues.push(Issue::node(node, "a workflow cannot call itself"));
                continue;
            }
            let Some(target) = self.repo.get_workflow(&cfg.workflow_id).await? else {
                issues.push(Issue::node(
                    node,
                    format!("sub-workflow '{}' does not exist", cfg.workflow_id),
                ));
                continue;
            };
            if target.version(cfg.workflow_version.as_deref()).is_none() {
                issues.push(Issue::node(
                    node,
                    format!(
                        "sub-workflow '{}' has no published version {}",
                        cfg.workflow_id,
                        cfg.workflow_version.as_deref().unwrap_or("(latest)")
                    ),
                ));
            }
        }
        Ok(issues)
    }

    pub async fn get_canvas_info(&self, caller: &Caller, id: &str) -> FlowResult<CanvasInfo> {
        let record = self.load_workflow(caller, id).await?;
        let referrers = self.repo.get_referrers(id).await?;
        let latest = record.versions.last().cloned();

        let (status, diff) = match (&record.draft, &latest) {
            (_, None) => (CanvasStatus::Unpublished, None),
            (None, Some(_)) => (CanvasStatus::Published, None),
            (Some(draft), Some(published)) => {
                let base = self
                    .repo
                    .get_snapshot(&published.commit_id)
                    .await?
                    .ok_or_else(|| FlowError::not_found("canvas snapshot", &published.commit_id))?;
                let diff = versioning::diff(&base, &draft.canvas);
                let status = if diff.is_empty() {
                    CanvasStatus::Published
                } else {
                    CanvasStatus::Modified
                };
                (status, Some(diff))
            }
        };

        Ok(CanvasInfo {
            canvas: record.draft.as_ref().map(|d| d.canvas.clone()),
            commit_id: record.draft.as_ref().map(|d| d.commit_id.clone()),
            latest_version: latest.map(|v| v.version),
            meta: record.meta,
            status,
            diff,
            referrers,
        })
    }

    // --- runs ---

    /// Create a root execution with its checkpoint. The caller drives it.
    async fn start_execution(
        &self,
        meta: &WorkflowMeta,
        canvas: &Canvas,
        version: Option<String>,
        mode: ExecuteMode,
        input: Map<String, Value>,
    ) -> FlowResult<Execution> {
        let commit_id = versioning::commit_id(canvas);
        self.repo.save_snapshot(&commit_id, canvas).await?;

        let fields = canvas
            .start_node()
            .map(|s| s.data.outputs.clone())
            .unwrap_or_default();
        let coerced = coerce_fields(&fields, &input, CoerceOptions::default())?;
        for w in &coerced.warnings {
            warn!(workflow_id = %meta.id, path = %w.path, "{}", w.message);
        }
        let input = coerced.value;

        let id = Uuid::new_v4().to_string();
        let execution = Execution {
            id: id.clone(),
            workflow_id: meta.id.clone(),
            space_id: meta.space_id.clone(),
            version,
            commit_id: commit_id.clone(),
            mode,
            status: ExecutionStatus::Running,
            reason: None,
            error_code: None,
            root_execute_id: id.clone(),
            parent_execute_id: None,
            parent_node_id: None,
            input: Value::Object(input.clone()),
            output: None,
            usage: TokenUsage::default(),
            created_at: Utc::now(),
            finished_at: None,
        };
        self.repo.create_execution(&execution).await?;
        self.checkpoints
            .save(&id, &CheckpointState::new(&id, &meta.id, &commit_id, input))
            .await?;
        info!(execute_id = %id, workflow_id = %meta.id, mode = ?mode, "Execution created");
        Ok(execution)
    }

    /// Drive an execution on a background task. The task drops its handle
    /// when the run stops, so `serve` does not accumulate finished runs.
    fn spawn_run(&self, execute_id: &str, options: RunOptions) {
        let engine = self.engine.clone();
        let handles = self.tasks.handles.clone();
        let generation = self.tasks.next.fetch_add(1, Ordering::Relaxed);
        let id = execute_id.to_string();

        // Held across spawn so the task cannot finish before its entry exists.
        let mut guard = lock_handles(&self.tasks.handles);
        let handle = tokio::spawn(async move {
            if let Err(e) = engine.run(&id, options).await {
                error!(execute_id = %id, error = %e, "Background run failed");
            }
            let mut handles = lock_handles(&handles);
            if handles.get(&id).is_some_and(|(g, _)| *g == generation) {
                handles.remove(&id);
            }
        });
        guard.insert(execute_id.to_string(), (generation, handle));
    }

    /// Number of background runs still being driven.
    pub fn active_runs(&self) -> usize {
        lock_handles(&self.tasks.handles).len()
    }

    /// Wait for the background task driving `execute_id`, then report.
    pub async fn wait(&self, execute_id: &str) -> FlowResult<RunReport> {
        let handle = lock_handles(&self.tasks.handles).remove(execute_id);
        if let Some((_, handle)) = handle
            && let Err(e) = handle.await
        {
            error!(execute_id = %execute_id, error = %e, "Run task panicked");
        }
        self.engine.report(execute_id).await
    }

    fn draft_canvas(record: &WorkflowRecord) -> FlowResult<Canvas> {
        let draft = record
            .draft
            .as_ref()
            .ok_or_else(|| FlowError::not_found("draft of workflow", &record.meta.id))?;
        let issues = validate_tree(&draft.canvas);
        if !issues.is_empty() {
            return Err(FlowError::Validation(issues));
        }
        Ok(draft.canvas.clone())
    }

    /// Run the current draft in the background. Returns the execution ID.
    pub async fn test_run(&self, caller: &Caller, id: &str, input: Map<String, Value>) -> FlowResult<String> {
        let record = self.load_workflow(caller, id).await?;
        let canvas = Self::draft_canvas(&record)?;
        let execution = self
            .start_execution(&record.meta, &canvas, None, ExecuteMode::TestRun, input)
            .await?;
        self.spawn_run(&execution.id, RunOptions::default());
        Ok(execution.id)
    }

    /// Run one node of the draft in isolation. Its inputs come from `input`,
    /// its outputs are collected by a synthetic End node.
    pub async fn node_debug_run(
        &self,
        caller: &Caller,
        id: &str,
        node_id: &str,
        debug: NodeDebugInput,
    ) -> FlowResult<String> {
        let record = self.load_workflow(caller, id).await?;
        let draft = record
            .draft
            .as_ref()
            .ok_or_else(|| FlowError::not_found("draft of workflow", id))?;
        let node = draft
            .canvas
            .find_node(node_id)
            .ok_or_else(|| FlowError::not_found("node", node_id))?;
        let canvas = debug_canvas(node, &debug.setting)?;

        let mut input = debug.input;
        input.extend(debug.batch);
        let execution = self
            .start_execution(&record.meta, &canvas, None, ExecuteMode::NodeDebug, input)
            .await?;
        self.spawn_run(&execution.id, RunOptions::default());
        Ok(execution.id)
    }

    pub async fn get_process(&self, caller: &Caller, execute_id: &str) -> FlowResult<ProcessInfo> {
        let execution = self.load_execution(caller, execute_id).await?;
        let report = self.engine.report(execute_id).await?;
        let node_results = self.repo.list_node_results(execute_id).await?;
        Ok(ProcessInfo {
            debug_url: self
                .engine
                .config()
                .debug_url(&execution.workflow_id, execute_id),
            execute_id: execution.id,
            workflow_id: execution.workflow_id,
            status: report.status,
            reason: report.reason,
            error_code: report.error_code,
            output: report.output,
            node_results,
            node_events: report.interrupts,
            usage: execution.usage,
        })
    }

    /// Answer an interrupt and continue the execution tree in the background.
    pub async fn resume(&self, caller: &Caller, execute_id: &str, event_id: &str, data: Value) -> FlowResult<String> {
        self.load_execution(caller, execute_id).await?;
        let root_id = self.engine.resume(execute_id, event_id, data).await?;
        self.spawn_run(&root_id, RunOptions::default());
        Ok(root_id)
    }

    pub async fn cancel(&self, caller: &Caller, execute_id: &str) -> FlowResult<ExecutionStatus> {
        self.load_execution(caller, execute_id).await?;
        self.engine.cancel(execute_id).await
    }

    async fn published_canvas(
        &self,
        record: &WorkflowRecord,
        version: Option<&str>,
    ) -> FlowResult<(PublishedVersion, Canvas)> {
        let published = record.version(version).cloned().ok_or_else(|| {
            FlowError::not_found(
                "published version",
                &format!("{}@{}", record.meta.id, version.unwrap_or("latest")),
            )
        })?;
        let canvas = self
            .repo
            .get_snapshot(&published.commit_id)
            .await?
            .ok_or_else(|| FlowError::not_found("canvas snapshot", &published.commit_id))?;
        Ok((published, canvas))
    }

    /// Whether this canvas or any workflow it calls may suspend for input.
    async fn may_interrupt(&self, canvas: &Canvas) -> FlowResult<bool> {
        let mut pending = vec![(canvas.clone(), 0usize)];
        let mut seen = BTreeSet::new();
        while let Some((canvas, depth)) = pending.pop() {
            if canvas_may_interrupt(&canvas) {
                return Ok(true);
            }
            if depth >= MAX_REFERENCE_DEPTH {
                continue;
            }
            for identity in canvas.sub_workflow_identities() {
                if !seen.insert(identity.clone()) {
                    continue;
                }
                let Some(record) = self.repo.get_workflow(&identity.id).await? else {
                    continue;
                };
                let Some(published) = record.version(identity.version.as_deref()) else {
                    continue;
                };
                if let Some(child) = self.repo.get_snapshot(&published.commit_id).await? {
                    pending.push((child, depth + 1));
                }
            }
        }
        Ok(false)
    }

    /// Run a published version. Synchronous runs reject workflows that may
    /// interrupt before creating anything.
    pub async fn openapi_run(&self, caller: &Caller, id: &str, req: OpenApiRun) -> FlowResult<OpenApiResult> {
        let record = self.load_workflow(caller, id).await?;
        let (published, canvas) = self.published_canvas(&record, req.version.as_deref()).await?;
        if !req.is_async && self.may_interrupt(&canvas).await? {
            return Err(FlowError::InterruptNotSupported);
        }

        let execution = self
            .start_execution(
                &record.meta,
                &canvas,
                Some(published.version),
                ExecuteMode::Release,
                req.input,
            )
            .await?;
        let debug_url = self.engine.config().debug_url(id, &execution.id);

        if req.is_async {
            self.spawn_run(&execution.id, RunOptions::default());
            return Ok(OpenApiResult {
                execute_id: execution.id,
                status: ExecutionStatus::Running,
                output: None,
                usage: TokenUsage::default(),
                debug_url,
            });
        }

        let options = RunOptions {
            allow_interrupts: false,
            ..Default::default()
        };
        let report = self.engine.run(&execution.id, options).await?;
        if report.status == ExecutionStatus::Failed {
            return Err(FlowError::ExecutionFailed(
                report.reason.unwrap_or_else(|| "unknown error".to_string()),
            ));
        }
        let usage = self
            .repo
            .get_execution(&execution.id)
            .await?
            .map(|e| e.usage)
            .unwrap_or_default();
        Ok(OpenApiResult {
            execute_id: report.execute_id,
            status: report.status,
            output: report.output,
            usage,
            debug_url,
        })
    }

    /// Run a published version, streaming progress until it finishes or suspends.
    pub async fn stream_run(
        &self,
        caller: &Caller,
        id: &str,
        input: Map<String, Value>,
        version: Option<&str>,
    ) -> FlowResult<(String, mpsc::Receiver<StreamEvent>)> {
        let record = self.load_workflow(caller, id).await?;
        let (published, canvas) = self.published_canvas(&record, version).await?;
        let execution = self
            .start_execution(
                &record.meta,
                &canvas,
                Some(published.version),
                ExecuteMode::Release,
                input,
            )
            .await?;
        let rx = self.stream_execution(&execution.id);
        Ok((execution.id, rx))
    }

    /// Answer an interrupt and stream the continuation.
    pub async fn stream_resume(
        &self,
        caller: &Caller,
        execute_id: &str,
        event_id: &str,
        data: Value,
    ) -> FlowResult<mpsc::Receiver<StreamEvent>> {
        self.load_execution(caller, execute_id).await?;
        let root_id = self.engine.resume(execute_id, event_id, data).await?;
        Ok(self.stream_execution(&root_id))
    }

    fn stream_execution(&self, execute_id: &str) -> mpsc::Receiver<StreamEvent> {
        let (sink, rx, _emitter) = spawn_emitter(self.stream_buffer);
        self.spawn_run(
            execute_id,
            RunOptions {
                sink,
                allow_interrupts: true,
            },
        );
        rx
    }

    // --- history ---

    /// Node results of `node_id`, either inside one execution (all
    /// iterations, oldest first) or the latest success of the workflow.
    pub async fn get_node_execute_history(
        &self,
        caller: &Caller,
        workflow_id: &str,
        execute_id: Option<&str>,
        node_id: &str,
        scene: HistoryScene,
    ) -> FlowResult<Vec<NodeResult>> {
        self.load_workflow(caller, workflow_id).await?;
        match scene {
            HistoryScene::Execution => {
                let execute_id = execute_id.ok_or_else(|| {
                    FlowError::InvalidParam("execute_id is required for the execution scene".to_string())
                })?;
                let execution = self.load_execution(caller, execute_id).await?;
                if execution.workflow_id != workflow_id {
                    return Err(FlowError::not_found("execution", execute_id));
                }
                let results: Vec<NodeResult> = self
                    .repo
                    .list_node_results(execute_id)
                    .await?
                    .into_iter()
                    .filter(|r| r.node_id == node_id)
                    .collect();
                if results.is_empty() {
                    return Err(FlowError::not_found("node history", node_id));
                }
                Ok(results)
            }
            HistoryScene::LatestSuccess => self
                .repo
                .latest_successful_node_result(workflow_id, node_id)
                .await?
                .map(|r| vec![r])
                .ok_or_else(|| FlowError::not_found("node history", node_id)),
        }
    }

    /// The canvas an execution (or one of its sub-executions) ran against.
    pub async fn get_history_schema(
        &self,
        caller: &Caller,
        execute_id: &str,
        sub_execute_id: Option<&str>,
    ) -> FlowResult<HistorySchema> {
        let execution = self.load_execution(caller, execute_id).await?;
        let target = match sub_execute_id {
            Some(sub_id) => {
                let sub = self.load_execution(caller, sub_id).await?;
                if sub.root_execute_id != execution.root_execute_id {
                    return Err(FlowError::not_found("sub-execution", sub_id));
                }
                sub
            }
            None => execution,
        };
        let canvas = self
            .repo
            .get_snapshot(&target.commit_id)
            .await?
            .ok_or_else(|| FlowError::not_found("canvas snapshot", &target.commit_id))?;
        Ok(HistorySchema {
            workflow_id: target.workflow_id,
            execute_id: target.id,
            commit_id: target.commit_id,
            version: target.version,
            canvas,
        })
    }
}

fn default_canvas() -> Canvas {
    let start = Node {
        id: "100001".to_string(),
        kind: NodeKind::Start,
        meta: NodeMeta {
            title: "Start".to_string(),
            position: None,
        },
        data: NodeData::default(),
        blocks: Vec::new(),
        edges: Vec::new(),
    };
    let end = Node {
        id: "900001".to_string(),
        kind: NodeKind::End,
        meta: NodeMeta {
            title: "End".to_string(),
            position: None,
        },
        ..start.clone()
    };
    Canvas {
        edges: vec![Edge::new(&start.id, &end.id)],
        nodes: vec![start, end],
        ..Default::default()
    }
}

/// Kinds that always ask a human, plus tool calls that require confirmation.
fn canvas_may_interrupt(canvas: &Canvas) -> bool {
    canvas.has_interrupting_nodes()
        || canvas.all_nodes().into_iter().any(|n| {
            n.kind == NodeKind::PluginCall
                && n.data
                    .config
                    .get("requireConfirmation")
                    .and_then(Value::as_bool)
                    .unwrap_or(false)
        })
}

/// Start -> node -> End, with every input of the node fed from Start and
/// every declared output collected by End.
fn debug_canvas(node: &Node, setting: &Map<String, Value>) -> FlowResult<Canvas> {
    if matches!(
        node.kind,
        NodeKind::Start | NodeKind::End | NodeKind::Break | NodeKind::Continue
    ) {
        return Err(FlowError::InvalidParam(format!(
            "{} nodes cannot be debugged on their own",
            node.kind
        )));
    }

    let mut target = node.clone();
    if !setting.is_empty() {
        let mut config = match target.data.config.take() {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        config.extend(setting.clone());
        target.data.config = Value::Object(config);
    }

    let mut start_fields = Vec::new();
    for param in &mut target.data.inputs {
        let mut field = Variable::new(&param.name, param.input.data_type);
        field.schema = param.input.schema.clone();
        if let Some(BlockValue::Literal(v)) = &param.input.value {
            field.default_value = Some(v.clone());
        }
        start_fields.push(field);
        param.input.value = Some(BlockValue::Ref(Reference {
            block_id: DEBUG_START_ID.to_string(),
            name: param.name.clone(),
            path: Vec::new(),
        }));
    }

    let start = Node {
        id: DEBUG_START_ID.to_string(),
        kind: NodeKind::Start,
        meta: NodeMeta {
            title: "Start".to_string(),
            position: None,
        },
        data: NodeData {
            outputs: start_fields,
            ..Default::default()
        },
        blocks: Vec::new(),
        edges: Vec::new(),
    };
    let end_inputs = target
        .data
        .outputs
        .iter()
        .map(|o| Param::reference(&o.name, o.data_type, &target.id, &o.name))
        .collect();
    let end = Node {
        id: DEBUG_END_ID.to_string(),
        kind: NodeKind::End,
        meta: NodeMeta {
            title: "End".to_string(),
            position: None,
        },
        data: NodeData {
            inputs: end_inputs,
            ..Default::default()
        },
        blocks: Vec::new(),
        edges: Vec::new(),
    };

    let mut edges = vec![Edge::new(DEBUG_START_ID, &target.id)];
    let ports = target.output_ports();
    if ports.is_empty() {
        edges.push(Edge::new(&target.id, DEBUG_END_ID));
    } else {
        edges.extend(ports.iter().map(|p| Edge::from_port(&target.id, p, DEBUG_END_ID)));
    }

    Ok(Canvas {
        nodes: vec![start, target, end],
        edges,
        ..Default::default()
    })
}
