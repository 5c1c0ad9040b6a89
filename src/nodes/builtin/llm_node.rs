use std::time::Duration;

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use tracing::debug;

use crate::canvas::NodeKind;
use crate::engine::template::render;
use crate::engine::types::TokenUsage;
use crate::nodes::{CapabilityProvider, NodeInput, NodeOutcome, NodeOutput};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LlmConfig {
    #[serde(default = "default_model")]
    model: String,
    /// Falls back to `OPENAI_BASE_URL`, then the public OpenAI endpoint.
    #[serde(default)]
    base_url: Option<String>,
    /// Falls back to `OPENAI_API_KEY`.
    #[serde(default)]
    api_key: Option<String>,
    #[serde(default)]
    system_prompt: Option<String>,
    #[serde(default)]
    prompt: String,
    #[serde(default)]
    temperature: Option<f64>,
    #[serde(default)]
    max_tokens: Option<u64>,
    #[serde(default)]
    stream: bool,
    #[serde(default = "default_timeout")]
    timeout_secs: f64,
    /// Parse the reply as JSON and expose its fields as outputs.
    #[serde(default)]
    json_output: bool,
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_timeout() -> f64 {
    120.0
}

/// Chat completion against an OpenAI-compatible endpoint.
pub struct LlmProvider;

fn endpoint(config: &LlmConfig) -> String {
    let base = config
        .base_url
        .clone()
        .or_else(|| std::env::var("OPENAI_BASE_URL").ok())
        .unwrap_or_else(|| "https://api.openai.com/v1".to_string());
    format!("{}/chat/completions", base.trim_end_matches('/'))
}

fn headers(config: &LlmConfig) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    if let Some(key) = config
        .api_key
        .clone()
        .or_else(|| std::env::var("OPENAI_API_KEY").ok())
    {
        headers.insert(
            HeaderName::from_static("authorization"),
            HeaderValue::from_str(&format!("Bearer {}", key))?,
        );
    }
    Ok(headers)
}

fn build_body(config: &LlmConfig, inputs: &Map<String, Value>) -> Value {
    let mut messages = Vec::new();
    if let Some(system) = &config.system_prompt {
        messages.push(json!({"role": "system", "content": render(system, inputs)}));
    }
    messages.push(json!({"role": "user", "content": render(&config.prompt, inputs)}));

    let mut body = json!({
        "model": config.model,
        "messages": messages,
        "stream": config.stream,
    });
    if config.stream {
        body["stream_options"] = json!({"include_usage": true});
    }
    if let Some(t) = config.temperature {
        body["temperature"] = json!(t);
    }
    if let Some(m) = config.max_tokens {
        body["max_tokens"] = json!(m);
    }
    body
}

fn usage_of(value: &Value) -> TokenUsage {
    let usage = &value["usage"];
    TokenUsage {
        input_tokens: usage["prompt_tokens"].as_u64().unwrap_or(0),
        output_tokens: usage["completion_tokens"].as_u64().unwrap_or(0),
        cost: 0.0,
    }
}

/// One parsed `data:` line of a streamed completion.
#[derive(Debug, PartialEq)]
enum SseLine {
    Delta(String),
    Usage(TokenUsage),
    Done,
}

fn parse_sse_line(line: &str) -> Option<SseLine> {
    let data = line.trim().strip_prefix("data:")?.trim();
    if data == "[DONE]" {
        return Some(SseLine::Done);
    }
    let value: Value = serde_json::from_str(data).ok()?;
    if let Some(delta) = value["choices"][0]["delta"]["content"].as_str() {
        return Some(SseLine::Delta(delta.to_string()));
    }
    value
        .get("usage")
        .filter(|u| !u.is_null())
        .map(|_| SseLine::Usage(usage_of(&value)))
}

async fn complete(input: &NodeInput, config: &LlmConfig) -> Result<(String, TokenUsage)> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs_f64(config.timeout_secs))
        .build()?;
    let url = endpoint(config);
    let response = client
        .post(&url)
        .headers(headers(config)?)
        .json(&build_body(config, &input.inputs))
        .send()
        .await
        .with_context(|| format!("llm: request to {} failed", url))?;

    let status = response.status();
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        anyhow::bail!("llm: {} returned {}: {}", url, status.as_u16(), text);
    }

    if !config.stream {
        let value: Value = response.json().await.context("llm: invalid response body")?;
        let text = value["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        input.stream.finish(&text);
        return Ok((text, usage_of(&value)));
    }

    let mut text = String::new();
    let mut usage = TokenUsage::default();
    let mut pending = String::new();
    let mut body = response.bytes_stream();
    while let Some(chunk) = body.next().await {
        pending.push_str(&String::from_utf8_lossy(&chunk.context("llm: stream interrupted")?));
        while let Some(newline) = pending.find('\n') {
            let line: String = pending.drain(..=newline).collect();
            match parse_sse_line(&line) {
                Some(SseLine::Delta(delta)) => {
                    input.stream.chunk(&delta);
                    text.push_str(&delta);
                }
                Some(SseLine::Usage(u)) => usage = u,
                Some(SseLine::Done) | None => {}
            }
        }
    }
    input.stream.finish("");
    debug!(node_id = %input.node_id, chars = text.len(), "LLM stream complete");
    Ok((text, usage))
}

#[async_trait]
impl CapabilityProvider for LlmProvider {
    fn node_type(&self) -> NodeKind {
        NodeKind::Llm
    }

    fn description(&self) -> &str {
        "Chat completion against an OpenAI-compatible provider"
    }

    async fn execute(&self, input: NodeInput) -> Result<NodeOutcome> {
        let config: LlmConfig =
            serde_json::from_value(input.config.clone()).context("invalid llm config")?;
        let (text, usage) = complete(&input, &config).await?;

        let mut output = match serde_json::from_str::<Value>(&text) {
            Ok(Value::Object(fields)) if config.json_output => fields,
            _ => Map::new(),
        };
        output.insert("output".to_string(), Value::String(text));

        Ok(NodeOutcome::Output(NodeOutput {
            output,
            usage,
            port: None,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sse_lines_parse_into_deltas_and_usage() {
        assert_eq!(
            parse_sse_line(r#"data: {"choices":[{"delta":{"content":"Hel"}}]}"#),
            Some(SseLine::Delta("Hel".into()))
        );
        assert_eq!(
            parse_sse_line(r#"data: {"choices":[],"usage":{"prompt_tokens":3,"completion_tokens":5}}"#),
            Some(SseLine::Usage(TokenUsage {
                input_tokens: 3,
                output_tokens: 5,
                cost: 0.0
            }))
        );
        assert_eq!(parse_sse_line("data: [DONE]"), Some(SseLine::Done));
        assert_eq!(parse_sse_line(": keep-alive"), None);
    }

    #[test]
    fn prompt_templates_render_inputs() {
        let config: LlmConfig = serde_json::from_value(json!({
            "prompt": "Summarize {{doc}}",
            "systemPrompt": "Be brief",
            "temperature": 0.2
        }))
        .unwrap();
        let inputs = json!({"doc": "the text"}).as_object().cloned().unwrap();
        let body = build_body(&config, &inputs);
        assert_eq!(body["messages"][0]["content"], json!("Be brief"));
        assert_eq!(body["messages"][1]["content"], json!("Summarize the text"));
        assert_eq!(body["temperature"], json!(0.2));
        assert!(body.get("stream_options").is_none());
    }
}
