use anyhow::{Context as _, Result};
use async_trait::async_trait;
use mlua::prelude::*;
use serde::Deserialize;
use serde_json::{Map, Value};

use super::lua_sandbox::{lua_to_json, setup_sandbox};
use crate::canvas::NodeKind;
use crate::nodes::{CapabilityProvider, NodeInput, NodeOutcome, NodeOutput};

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CodeConfig {
    #[serde(default)]
    source: Option<String>,
}

/// Runs Lua in a sandbox. The returned table becomes the node output; any
/// other return value lands under `result`.
pub struct CodeProvider;

fn run_lua(config: CodeConfig, input: Map<String, Value>) -> Result<Map<String, Value>> {
    let lua = Lua::new();
    setup_sandbox(&lua, &input)?;

    let source = config.source.context("code node requires 'source'")?;
    let result: LuaValue = lua
        .load(&source)
        .set_name("<code>")
        .eval()
        .map_err(|e| anyhow::anyhow!("Code execution failed: {}", e))?;

    let mut output = Map::new();
    match result {
        LuaValue::Table(tbl) => {
            for pair in tbl.pairs::<String, LuaValue>() {
                let (key, val) = pair?;
                output.insert(key, lua_to_json(&val)?);
            }
        }
        LuaValue::Nil => {}
        other => {
            output.insert("result".to_string(), lua_to_json(&other)?);
        }
    }
    Ok(output)
}

#[async_trait]
impl CapabilityProvider for CodeProvider {
    fn node_type(&self) -> NodeKind {
        NodeKind::Code
    }

    fn description(&self) -> &str {
        "Execute sandboxed Lua code over the node's inputs"
    }

    async fn execute(&self, input: NodeInput) -> Result<NodeOutcome> {
        let config: CodeConfig = if input.config.is_null() {
            CodeConfig::default()
        } else {
            serde_json::from_value(input.config.clone()).context("invalid code config")?
        };
        let inputs = input.inputs;
        let output = tokio::task::spawn_blocking(move || run_lua(config, inputs))
            .await
            .context("code task panicked")??;
        Ok(NodeOutcome::Output(NodeOutput::new(output)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn table_return_becomes_output() {
        let out = run_lua(
            CodeConfig {
                source: Some("return { sum = input.a + input.b }".into()),
            },
            json!({"a": 1, "b": 2}).as_object().cloned().unwrap(),
        )
        .unwrap();
        assert_eq!(out["sum"], json!(3));
    }

    #[test]
    fn scalar_return_lands_under_result() {
        let out = run_lua(
            CodeConfig {
                source: Some("return 'hi'".into()),
            },
            Map::new(),
        )
        .unwrap();
        assert_eq!(out["result"], json!("hi"));
    }

    #[test]
    fn missing_source_is_an_error() {
        let err = run_lua(CodeConfig::default(), Map::new()).unwrap_err();
        assert!(err.to_string().contains("requires 'source'"));
    }

    #[test]
    fn runtime_errors_surface() {
        let err = run_lua(
            CodeConfig {
                source: Some("error('bad')".into()),
            },
            Map::new(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("Code execution failed"));
    }
}
