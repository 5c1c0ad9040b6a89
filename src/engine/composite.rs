//! Loop and batch nodes. Both run their inner canvas once per iteration in
//! a child scope; a suspended iteration is kept in the composite's pending
//! state and continued on the next dispatch.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures_util::StreamExt;
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::canvas::{BatchConfig, BlockValue, LoopConfig, LoopType, Node};
use crate::engine::executor::{
    Dispatched, Frame, LoopSignal, RunCtx, ScopeOutcome, WorkflowEngine,
};
use crate::engine::policy;
use crate::engine::resolve::{Env, resolve_params, resolve_source};
use crate::engine::scope::{CompositeState, Graph, PendingNode, ScopeState};
use crate::error::{FlowError, FlowResult};

/// Upper bound on iterations of any loop, including infinite ones.
pub const MAX_LOOP_ITERATIONS: usize = 1000;

/// Iterations an array-driven composite runs: the shortest list input.
fn iteration_count(input: &Map<String, Value>) -> usize {
    input
        .values()
        .filter_map(Value::as_array)
        .map(Vec::len)
        .min()
        .unwrap_or(0)
}

/// Variables bound under the composite's ID for iteration `index`.
fn iteration_vars(
    input: &Map<String, Value>,
    index: usize,
    variables: &Map<String, Value>,
) -> Map<String, Value> {
    let mut vars = Map::new();
    let mut first_item = None;
    for (name, value) in input {
        let bound = match value {
            Value::Array(items) => {
                let item = items.get(index).cloned().unwrap_or(Value::Null);
                first_item.get_or_insert_with(|| item.clone());
                item
            }
            other => other.clone(),
        };
        vars.insert(name.clone(), bound);
    }
    if let Some(item) = first_item {
        vars.entry("item").or_insert(item);
    }
    for (k, v) in variables {
        vars.insert(k.clone(), v.clone());
    }
    vars
}

/// Values of an iteration's output params that point at inner blocks.
fn collect_iteration(node: &Node, state: &ScopeState, frame: &Frame) -> Value {
    let env = Env::child(&frame.env, state.outputs.clone());
    let mut out = Map::new();
    for param in &node.data.output_params {
        if let Some(BlockValue::Ref(r)) = &param.input.value
            && r.block_id != node.id
        {
            out.insert(param.name.clone(), resolve_source(&param.input, &env));
        }
    }
    Value::Object(out)
}

/// Composite output: one list per inner-block param in `order`, and the
/// final value for params that reference the composite's own variables.
fn aggregate(
    node: &Node,
    state: &CompositeState,
    order: &[usize],
    env: &Arc<Env>,
) -> Map<String, Value> {
    let own = Env::child(
        env,
        BTreeMap::from([(node.id.clone(), Value::Object(state.variables.clone()))]),
    );
    let mut output = Map::new();
    for param in &node.data.output_params {
        let value = match &param.input.value {
            Some(BlockValue::Ref(r)) if r.block_id == node.id => {
                resolve_source(&param.input, &own)
            }
            _ => Value::Array(
                order
                    .iter()
                    .filter_map(|i| state.results.get(i))
                    .map(|r| r.get(&param.name).cloned().unwrap_or(Value::Null))
                    .collect(),
            ),
        };
        output.insert(param.name.clone(), value);
    }
    output
}

fn invalid_config(node: &Node, err: serde_json::Error) -> FlowError {
    FlowError::NodeRuntime {
        node_id: node.id.clone(),
        message: format!("invalid config: {}", err),
    }
}

impl WorkflowEngine {
    /// Run loop iterations one after another until the count is reached,
    /// a Break fires, or an iteration suspends.
    pub(crate) async fn run_loop(
        &self,
        ctx: &RunCtx,
        node: &Node,
        pending: Option<PendingNode>,
        env: &Arc<Env>,
        frame: &Frame,
    ) -> FlowResult<Dispatched> {
        let cfg: LoopConfig = node.config().map_err(|e| invalid_config(node, e))?;
        let mut cs = match pending {
            Some(PendingNode::Composite(c)) => c,
            _ => CompositeState {
                input: resolve_params(&node.data.inputs, env),
                variables: resolve_params(&node.data.loop_variables, env),
                ..Default::default()
            },
        };
        let total = match cfg.loop_type {
            LoopType::Array => Some(iteration_count(&cs.input)),
            LoopType::Count => Some(
                cfg.loop_count
                    .or_else(|| cs.input.get("loopCount").and_then(Value::as_u64))
                    .unwrap_or(0) as usize,
            ),
            LoopType::Infinite => None,
        };
        let graph = Graph::new(&node.blocks, &node.edges);
        let input = Some(Value::Object(cs.input.clone()));

        while !cs.broken {
            let index = cs.next_index;
            if total.is_some_and(|t| index >= t) {
                break;
            }
            if index >= MAX_LOOP_ITERATIONS {
                return Err(FlowError::NodeRuntime {
                    node_id: node.id.clone(),
                    message: format!("loop exceeded {} iterations", MAX_LOOP_ITERATIONS),
                });
            }

            let scope = cs.iterations.remove(&index).unwrap_or_default();
            let vars = iteration_vars(&cs.input, index, &cs.variables);
            let iter_frame = frame.iteration(env, node, index, vars);
            match self.run_scope(ctx, &graph, scope, &iter_frame).await? {
                ScopeOutcome::Completed { state, signal } => {
                    if signal == Some(LoopSignal::Break) {
                        debug!(node_id = %node.id, index, "Loop break");
                        cs.broken = true;
                    } else {
                        cs.results
                            .insert(index, collect_iteration(node, &state, &iter_frame));
                        cs.completion_order.push(index);
                    }
                    for (k, v) in state.assignments {
                        cs.variables.insert(k, v);
                    }
                    cs.next_index += 1;
                }
                ScopeOutcome::Suspended(state) => {
                    self.announce_interrupts(ctx).await?;
                    cs.iterations.insert(index, state);
                    return Ok(Dispatched::suspended(PendingNode::Composite(cs), input));
                }
            }
        }

        info!(node_id = %node.id, iterations = cs.results.len(), "Loop complete");
        let order: Vec<usize> = cs.results.keys().copied().collect();
        let output = aggregate(node, &cs, &order, env);
        Ok(Dispatched::done(output, policy::success_port(node, None), input))
    }

    /// Run batch iterations with bounded concurrency. Output lists follow
    /// completion order.
    pub(crate) async fn run_batch(
        &self,
        ctx: &RunCtx,
        node: &Node,
        pending: Option<PendingNode>,
        env: &Arc<Env>,
        frame: &Frame,
    ) -> FlowResult<Dispatched> {
        let cfg: BatchConfig = node.config().map_err(|e| invalid_config(node, e))?;
        let mut cs = match pending {
            Some(PendingNode::Composite(c)) => c,
            _ => CompositeState {
                input: resolve_params(&node.data.inputs, env),
                ..Default::default()
            },
        };
        let mut total = iteration_count(&cs.input);
        if let Some(max) = cfg.batch_size {
            total = total.min(max);
        }
        let concurrency = cfg
            .concurrent_size
            .unwrap_or(self.config().default_batch_concurrency)
            .max(1);
        let graph = Graph::new(&node.blocks, &node.edges);

        let mut suspended = std::mem::take(&mut cs.iterations);
        let todo: Vec<(usize, ScopeState)> = (0..total)
            .filter(|i| !cs.results.contains_key(i))
            .map(|i| (i, suspended.remove(&i).unwrap_or_default()))
            .collect();
        debug!(node_id = %node.id, total, remaining = todo.len(), concurrency, "Running batch");

        let no_vars = Map::new();
        let graph = &graph;
        let items = &cs.input;
        let finished: Vec<(usize, Frame, FlowResult<ScopeOutcome>)> =
            futures_util::stream::iter(todo.into_iter().map(|(index, scope)| {
                let iter_frame = frame.iteration(env, node, index, iteration_vars(items, index, &no_vars));
                async move {
                    let outcome = match self.run_scope(ctx, graph, scope, &iter_frame).await {
                        Ok(ScopeOutcome::Suspended(state)) => self
                            .announce_interrupts(ctx)
                            .await
                            .map(|()| ScopeOutcome::Suspended(state)),
                        other => other,
                    };
                    (index, iter_frame, outcome)
                }
            }))
            .buffer_unordered(concurrency)
            .collect()
            .await;

        let mut failure = None;
        for (index, iter_frame, outcome) in finished {
            match outcome {
                Ok(ScopeOutcome::Completed { state, .. }) => {
                    cs.results
                        .insert(index, collect_iteration(node, &state, &iter_frame));
                    cs.completion_order.push(index);
                }
                Ok(ScopeOutcome::Suspended(state)) => {
                    cs.iterations.insert(index, state);
                }
                Err(e) => {
                    failure.get_or_insert(e);
                }
            }
        }
        if let Some(e) = failure {
            return Err(e);
        }

        let input = Some(Value::Object(cs.input.clone()));
        if !cs.iterations.is_empty() {
            return Ok(Dispatched::suspended(PendingNode::Composite(cs), input));
        }

        info!(node_id = %node.id, iterations = cs.results.len(), "Batch complete");
        let output = aggregate(node, &cs, &cs.completion_order, env);
        Ok(Dispatched::done(output, policy::success_port(node, None), input))
    }
}
