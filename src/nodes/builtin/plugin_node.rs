use std::time::Duration;

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use tracing::info;

use crate::canvas::NodeKind;
use crate::engine::interrupt::InterruptType;
use crate::engine::template::render;
use crate::nodes::{CapabilityProvider, InterruptRequest, NodeInput, NodeOutcome, NodeOutput};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PluginConfig {
    #[serde(default = "default_method")]
    method: String,
    url: String,
    #[serde(default)]
    headers: Map<String, Value>,
    #[serde(default)]
    auth: Option<Auth>,
    #[serde(default = "default_timeout")]
    timeout_secs: f64,
    /// Ask the user before calling the tool.
    #[serde(default)]
    require_confirmation: bool,
}

fn default_method() -> String {
    "POST".to_string()
}

fn default_timeout() -> f64 {
    30.0
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Auth {
    Bearer { token: String },
    Basic { username: String, password: Option<String> },
    ApiKey {
        key: String,
        #[serde(default = "default_api_key_header")]
        header: String,
    },
}

fn default_api_key_header() -> String {
    "X-API-Key".to_string()
}

/// HTTP tool call. Inputs become the JSON body, or query parameters for GET.
pub struct PluginProvider;

fn confirmed(data: &Value) -> bool {
    match data {
        Value::Bool(b) => *b,
        Value::Object(map) => map.get("confirmed").and_then(Value::as_bool).unwrap_or(false),
        Value::String(s) => matches!(s.trim(), "true" | "yes" | "confirmed"),
        _ => false,
    }
}

fn query_pairs(inputs: &Map<String, Value>) -> Vec<(String, String)> {
    inputs
        .iter()
        .map(|(k, v)| {
            let text = match v {
                Value::String(s) => s.clone(),
                Value::Null => String::new(),
                other => other.to_string(),
            };
            (k.clone(), text)
        })
        .collect()
}

async fn call(config: &PluginConfig, inputs: &Map<String, Value>) -> Result<Map<String, Value>> {
    let url = render(&config.url, inputs);
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs_f64(config.timeout_secs))
        .build()?;

    let method = config.method.to_uppercase();
    let mut request = match method.as_str() {
        "GET" => client.get(&url).query(&query_pairs(inputs)),
        "POST" => client.post(&url).json(inputs),
        "PUT" => client.put(&url).json(inputs),
        "PATCH" => client.patch(&url).json(inputs),
        "DELETE" => client.delete(&url).json(inputs),
        other => anyhow::bail!("Unsupported HTTP method: {}", other),
    };

    let mut header_map = HeaderMap::new();
    for (k, v) in &config.headers {
        if let Some(val) = v.as_str() {
            header_map.insert(
                HeaderName::from_bytes(k.as_bytes())?,
                HeaderValue::from_str(&render(val, inputs))?,
            );
        }
    }
    request = request.headers(header_map);

    request = match &config.auth {
        Some(Auth::Bearer { token }) => request.bearer_auth(render(token, inputs)),
        Some(Auth::Basic { username, password }) => request.basic_auth(username, password.as_ref()),
        Some(Auth::ApiKey { key, header }) => request.header(header.as_str(), render(key, inputs)),
        None => request,
    };

    let response = request
        .send()
        .await
        .with_context(|| format!("plugin: {} {} failed", method, url))?;
    let status = response.status();
    let headers: Map<String, Value> = response
        .headers()
        .iter()
        .map(|(k, v)| (k.to_string(), Value::String(v.to_str().unwrap_or("").to_string())))
        .collect();
    let text = response.text().await?;
    if !status.is_success() {
        anyhow::bail!("plugin: {} {} returned {}: {}", method, url, status.as_u16(), text);
    }
    let body = serde_json::from_str(&text).unwrap_or(Value::String(text));

    let mut output = Map::new();
    output.insert("statusCode".to_string(), json!(status.as_u16()));
    output.insert("headers".to_string(), Value::Object(headers));
    output.insert("body".to_string(), body);
    Ok(output)
}

#[async_trait]
impl CapabilityProvider for PluginProvider {
    fn node_type(&self) -> NodeKind {
        NodeKind::PluginCall
    }

    fn description(&self) -> &str {
        "Invoke an HTTP tool, optionally after user confirmation"
    }

    async fn execute(&self, input: NodeInput) -> Result<NodeOutcome> {
        let config: PluginConfig =
            serde_json::from_value(input.config.clone()).context("invalid plugin config")?;

        if config.require_confirmation {
            match &input.resume {
                None => {
                    return Ok(NodeOutcome::Interrupt(InterruptRequest {
                        event_type: InterruptType::ToolConfirmation,
                        payload: json!({
                            "method": config.method.to_uppercase(),
                            "url": render(&config.url, &input.inputs),
                            "arguments": input.inputs,
                        }),
                        state: None,
                    }));
                }
                Some(resume) if !confirmed(&resume.data) => {
                    info!(node_id = %input.node_id, "Tool call rejected by user");
                    let output = Map::from_iter([
                        ("confirmed".to_string(), Value::Bool(false)),
                        ("body".to_string(), Value::Null),
                    ]);
                    return Ok(NodeOutcome::Output(NodeOutput::new(output)));
                }
                Some(_) => {}
            }
        }

        let mut output = call(&config, &input.inputs).await?;
        output.insert("confirmed".to_string(), Value::Bool(true));
        Ok(NodeOutcome::Output(NodeOutput::new(output)))
    }
}
