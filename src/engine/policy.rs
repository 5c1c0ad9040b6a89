use std::time::Duration;

use serde_json::{Map, Value, json};
use tracing::{info, warn};

use crate::canvas::{ErrorProcessType, Node, PORT_DEFAULT, PORT_ERROR};
use crate::error::{FlowError, FlowResult, codes};
use crate::nodes::{CapabilityProvider, NodeInput, NodeOutcome};

/// Shallow-merge `backup` over `config` (fallback model/provider on retry).
pub fn merge_backup(config: &Value, backup: &Value) -> Value {
    match (config, backup) {
        (Value::Object(base), Value::Object(over)) => {
            let mut merged = base.clone();
            for (k, v) in over {
                merged.insert(k.clone(), v.clone());
            }
            Value::Object(merged)
        }
        (_, over) if !over.is_null() => over.clone(),
        (base, _) => base.clone(),
    }
}

/// Outcome of running a provider under a node's timeout and retry policy.
pub struct Attempted {
    pub outcome: Result<NodeOutcome, String>,
    /// Zero-based attempt that produced the outcome.
    pub attempt: u32,
}

/// Call a provider with per-attempt timeout and bounded retries.
/// `first_attempt` is non-zero when continuing a node that suspended mid-retry.
pub async fn call_with_retry(
    provider: &dyn CapabilityProvider,
    node: &Node,
    input: NodeInput,
    first_attempt: u32,
    backoff_ms: u64,
) -> Attempted {
    let policy = node.error_policy();
    let max_attempts = policy.retry_times + 1;
    let base_config = input.config.clone();
    let mut last_error = String::new();
    let mut attempt = first_attempt;

    while attempt < max_attempts {
        let mut this_input = input.clone();
        this_input.attempt = attempt;
        if attempt > 0
            && let Some(backup) = &policy.backup
        {
            this_input.config = merge_backup(&base_config, backup);
        }
        // Resume data is only meant for the attempt that suspended.
        if attempt != first_attempt {
            this_input.resume = None;
        }

        let result = match policy.timeout_ms {
            Some(ms) => match tokio::time::timeout(
                Duration::from_millis(ms),
                provider.execute(this_input),
            )
            .await
            {
                Ok(r) => r,
                Err(_) => Err(anyhow::anyhow!("node timed out after {}ms", ms)),
            },
            None => provider.execute(this_input).await,
        };

        match result {
            Ok(outcome) => {
                return Attempted {
                    outcome: Ok(outcome),
                    attempt,
                };
            }
            Err(e) => {
                last_error = format!("{:#}", e);
                warn!(node_id = %node.id, attempt = attempt + 1, max = max_attempts, error = %last_error, "Node attempt failed");
                attempt += 1;
                if attempt < max_attempts && backoff_ms > 0 {
                    let delay = backoff_ms.saturating_mul(1u64 << (attempt - 1).min(16));
                    info!(node_id = %node.id, delay_ms = delay, "Retrying after backoff");
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
            }
        }
    }

    Attempted {
        outcome: Err(last_error),
        attempt: max_attempts.saturating_sub(1),
    }
}

/// What a node produces once its retries are exhausted.
#[derive(Debug)]
pub struct Recovered {
    pub output: Map<String, Value>,
    pub port: Option<String>,
    /// Error body recorded on the soft-failed node result.
    pub error: String,
}

/// Apply the node's on-exhaustion policy to a failure.
pub fn on_exhausted(node: &Node, message: String) -> FlowResult<Recovered> {
    let policy = node.error_policy();
    let port = match policy.process_type {
        ErrorProcessType::Throw => {
            return Err(FlowError::NodeRuntime {
                node_id: node.id.clone(),
                message,
            });
        }
        ErrorProcessType::Default => None,
        ErrorProcessType::ExceptionBranch => Some(PORT_ERROR.to_string()),
    };

    let mut output = match policy.data_on_err.as_deref().map(serde_json::from_str::<Value>) {
        Some(Ok(Value::Object(map))) => map,
        Some(Ok(_)) | None => Map::new(),
        Some(Err(e)) => {
            warn!(node_id = %node.id, error = %e, "dataOnErr is not a JSON object");
            Map::new()
        }
    };
    output.insert(
        "errorBody".to_string(),
        json!({ "errorMessage": message, "errorCode": codes::ERR_NODE_RUNTIME }),
    );

    Ok(Recovered {
        output,
        port,
        error: message,
    })
}

/// Port a successful node takes, given the provider's own choice.
pub fn success_port(node: &Node, chosen: Option<String>) -> Option<String> {
    if chosen.is_some() {
        return chosen;
    }
    (node.error_policy().process_type == ErrorProcessType::ExceptionBranch)
        .then(|| PORT_DEFAULT.to_string())
}

/// Errors a node's exhaustion policy may absorb. Infrastructure failures,
/// cancellation and unsupported interrupts always propagate.
pub fn is_recoverable(err: &FlowError) -> bool {
    matches!(
        err,
        FlowError::NodeRuntime { .. } | FlowError::ExecutionFailed(_) | FlowError::InvalidParam(_)
    )
}
