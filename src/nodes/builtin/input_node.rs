use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Map, Value, json};
use tracing::debug;

use crate::canvas::NodeKind;
use crate::coercion::{CoerceOptions, coerce_fields};
use crate::engine::interrupt::InterruptType;
use crate::nodes::{CapabilityProvider, InterruptRequest, NodeInput, NodeOutcome, NodeOutput};

/// Suspends until the user submits a form matching the node's outputs.
pub struct InputProvider;

/// Resume data arrives either as an object or as its JSON text.
fn parse_submission(data: &Value) -> Option<Map<String, Value>> {
    match data {
        Value::Object(map) => Some(map.clone()),
        Value::String(s) => match serde_json::from_str(s) {
            Ok(Value::Object(map)) => Some(map),
            _ => None,
        },
        _ => None,
    }
}

fn ask(input: &NodeInput, error: Option<String>) -> NodeOutcome {
    let mut payload = json!({
        "title": input.title,
        "fields": input.outputs,
    });
    if let Some(prompt) = input.config.get("prompt") {
        payload["prompt"] = prompt.clone();
    }
    if let Some(error) = error {
        payload["error"] = Value::String(error);
    }
    NodeOutcome::Interrupt(InterruptRequest {
        event_type: InterruptType::Input,
        payload,
        state: None,
    })
}

#[async_trait]
impl CapabilityProvider for InputProvider {
    fn node_type(&self) -> NodeKind {
        NodeKind::Input
    }

    fn description(&self) -> &str {
        "Pause the workflow until the user submits form input"
    }

    async fn execute(&self, input: NodeInput) -> Result<NodeOutcome> {
        let Some(resume) = &input.resume else {
            return Ok(ask(&input, None));
        };

        let Some(submitted) = parse_submission(&resume.data) else {
            return Ok(ask(&input, Some("input must be a JSON object".to_string())));
        };
        if input.outputs.is_empty() {
            return Ok(NodeOutcome::Output(NodeOutput::new(submitted)));
        }
        match coerce_fields(&input.outputs, &submitted, CoerceOptions::default()) {
            Ok(coerced) => {
                for w in &coerced.warnings {
                    debug!(node_id = %input.node_id, path = %w.path, "Input coercion warning: {}", w.message);
                }
                Ok(NodeOutcome::Output(NodeOutput::new(coerced.value)))
            }
            // Ask again rather than failing the run on a bad submission.
            Err(e) => Ok(ask(&input, Some(e.to_string()))),
        }
    }
}
