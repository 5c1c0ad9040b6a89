use anyhow::{Context as _, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use sqlx::any::{AnyArguments, AnyRow};
use sqlx::{AnyPool, Arguments, Column, Row, TypeInfo};

use crate::canvas::NodeKind;
use crate::engine::template::render;
use crate::nodes::{CapabilityProvider, NodeInput, NodeOutcome, NodeOutput};

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
enum Operation {
    #[default]
    Query,
    Exec,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DbConfig {
    /// Database URL; `{{input}}` placeholders are rendered.
    connection: String,
    #[serde(default)]
    operation: Operation,
    sql: String,
    /// Input names bound positionally to `?`/`$n` placeholders.
    #[serde(default)]
    params: Vec<String>,
}

/// SQL through the sqlx `Any` driver: `query` returns rows, `exec` rows affected.
pub struct DatabaseProvider;

fn bind_params(params: &[Value]) -> Result<AnyArguments<'_>> {
    let mut args = AnyArguments::default();
    for (i, param) in params.iter().enumerate() {
        let bound = match param {
            Value::String(s) => args.add(s.as_str()),
            Value::Number(n) => match n.as_i64() {
                Some(v) => args.add(v),
                None => args.add(n.as_f64().unwrap_or_default()),
            },
            Value::Bool(b) => args.add(*b),
            Value::Null => args.add(None::<String>),
            _ => anyhow::bail!(
                "param {} is an array or object and cannot be bound as SQL",
                i
            ),
        };
        bound.map_err(|e| anyhow::anyhow!("Failed to bind param {}: {}", i, e))?;
    }
    Ok(args)
}

/// Convert a row to a JSON object by inspecting column types at runtime.
fn row_to_json(row: &AnyRow) -> Value {
    let mut map = Map::new();
    for col in row.columns() {
        let ordinal = col.ordinal();
        let value = match col.type_info().name() {
            "INTEGER" | "INT" | "INT4" | "INT8" | "BIGINT" | "SMALLINT" => {
                row.try_get::<i64, _>(ordinal).map(Value::from).ok()
            }
            "REAL" | "FLOAT" | "FLOAT4" | "FLOAT8" | "DOUBLE" | "NUMERIC" => {
                row.try_get::<f64, _>(ordinal).map(Value::from).ok()
            }
            "BOOLEAN" | "BOOL" => row.try_get::<bool, _>(ordinal).map(Value::from).ok(),
            _ => row.try_get::<String, _>(ordinal).map(Value::String).ok(),
        };
        map.insert(col.name().to_string(), value.unwrap_or(Value::Null));
    }
    Value::Object(map)
}

#[async_trait]
impl CapabilityProvider for DatabaseProvider {
    fn node_type(&self) -> NodeKind {
        NodeKind::DatabaseOp
    }

    fn description(&self) -> &str {
        "Run a SQL query or statement against a database"
    }

    async fn execute(&self, input: NodeInput) -> Result<NodeOutcome> {
        let config: DbConfig =
            serde_json::from_value(input.config.clone()).context("invalid database config")?;
        let params: Vec<Value> = config
            .params
            .iter()
            .map(|name| input.inputs.get(name).cloned().unwrap_or(Value::Null))
            .collect();

        sqlx::any::install_default_drivers();
        let url = render(&config.connection, &input.inputs);
        let pool = AnyPool::connect(&url)
            .await
            .with_context(|| format!("Failed to connect to database '{}'", url))?;
        let args = bind_params(&params)?;

        let output = match config.operation {
            Operation::Query => {
                let rows: Vec<AnyRow> = sqlx::query_with(&config.sql, args)
                    .fetch_all(&pool)
                    .await
                    .context("database query failed")?;
                let rows: Vec<Value> = rows.iter().map(row_to_json).collect();
                Map::from_iter([
                    ("rowNum".to_string(), json!(rows.len())),
                    ("outputList".to_string(), Value::Array(rows)),
                ])
            }
            Operation::Exec => {
                let result = sqlx::query_with(&config.sql, args)
                    .execute(&pool)
                    .await
                    .context("database statement failed")?;
                Map::from_iter([("rowNum".to_string(), json!(result.rows_affected()))])
            }
        };
        pool.close().await;

        Ok(NodeOutcome::Output(NodeOutput::new(output)))
    }
}
