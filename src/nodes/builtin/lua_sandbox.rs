use anyhow::Result;
use base64::Engine;
use mlua::prelude::*;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Set up a sandboxed Lua state for a code node.
///
/// - Removes `os`, `io`, `debug`, `loadfile`, `dofile`, `require`
/// - Exposes `base64_encode`, `base64_decode`, `json_parse`, `json_stringify`
/// - Exposes `log([level], ...)` routed to tracing
/// - Exposes the node's resolved inputs as the `input` table
pub fn setup_sandbox(lua: &Lua, input: &Map<String, Value>) -> Result<()> {
    let globals = lua.globals();

    for name in ["os", "io", "debug", "loadfile", "dofile", "require"] {
        globals.set(name, LuaValue::Nil)?;
    }

    let encode_fn = lua.create_function(|lua_ctx, data: LuaString| {
        let encoded = base64::engine::general_purpose::STANDARD.encode(data.as_bytes());
        Ok(LuaValue::String(lua_ctx.create_string(&encoded)?))
    })?;
    globals.set("base64_encode", encode_fn)?;

    let decode_fn = lua.create_function(|lua_ctx, data: String| {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(&data)
            .map_err(|e| LuaError::RuntimeError(format!("base64_decode failed: {}", e)))?;
        Ok(LuaValue::String(lua_ctx.create_string(&bytes)?))
    })?;
    globals.set("base64_decode", decode_fn)?;

    let parse_fn = lua.create_function(|lua_ctx, data: String| {
        let json: Value = serde_json::from_str(&data)
            .map_err(|e| LuaError::RuntimeError(format!("json_parse failed: {}", e)))?;
        json_to_lua(lua_ctx, &json).map_err(LuaError::external)
    })?;
    globals.set("json_parse", parse_fn)?;

    let stringify_fn = lua.create_function(|_, value: LuaValue| {
        let json = lua_to_json(&value).map_err(LuaError::external)?;
        serde_json::to_string(&json).map_err(|e| LuaError::RuntimeError(e.to_string()))
    })?;
    globals.set("json_stringify", stringify_fn)?;

    let log_fn = lua.create_function(|_, args: LuaMultiValue| {
        let values: Vec<LuaValue> = args.into_iter().collect();
        let (level, skip) = match values.first().and_then(|v| v.as_string()) {
            Some(s) => match s.to_str()?.to_lowercase().as_str() {
                l @ ("debug" | "info" | "warn") => (l.to_string(), 1),
                _ => ("info".to_string(), 0),
            },
            None => ("info".to_string(), 0),
        };
        let message = values
            .iter()
            .skip(skip)
            .map(|v| stringify(v).map_err(LuaError::external))
            .collect::<Result<Vec<_>, _>>()?
            .join(" ");
        match level.as_str() {
            "debug" => debug!("<lua> {}", message),
            "warn" => warn!("<lua> {}", message),
            _ => info!("<lua> {}", message),
        }
        Ok(())
    })?;
    globals.set("log", log_fn)?;

    let uuid_fn = lua.create_function(|_, ()| Ok(Uuid::new_v4().to_string()))?;
    globals.set("uuid4", uuid_fn)?;

    let input_value = json_to_lua(lua, &Value::Object(input.clone()))?;
    globals.set("input", input_value)?;

    Ok(())
}

pub fn json_to_lua(lua: &Lua, value: &Value) -> Result<LuaValue> {
    match value {
        Value::Null => Ok(LuaValue::Nil),
        Value::Bool(b) => Ok(LuaValue::Boolean(*b)),
        Value::Number(n) => Ok(match n.as_i64() {
            Some(i) => LuaValue::Integer(i),
            None => n.as_f64().map(LuaValue::Number).unwrap_or(LuaValue::Nil),
        }),
        Value::String(s) => Ok(LuaValue::String(lua.create_string(s)?)),
        Value::Array(items) => {
            let tbl = lua.create_table()?;
            for (i, v) in items.iter().enumerate() {
                tbl.set(i + 1, json_to_lua(lua, v)?)?;
            }
            Ok(LuaValue::Table(tbl))
        }
        Value::Object(map) => {
            let tbl = lua.create_table()?;
            for (k, v) in map {
                tbl.set(k.as_str(), json_to_lua(lua, v)?)?;
            }
            Ok(LuaValue::Table(tbl))
        }
    }
}

/// Tables with a non-empty sequence part become arrays, others objects.
pub fn lua_to_json(value: &LuaValue) -> Result<Value> {
    match value {
        LuaValue::Nil => Ok(Value::Null),
        LuaValue::Boolean(b) => Ok(Value::Bool(*b)),
        LuaValue::Integer(n) => Ok(Value::from(*n)),
        LuaValue::Number(n) => Ok(serde_json::Number::from_f64(*n)
            .map(Value::Number)
            .unwrap_or(Value::Null)),
        LuaValue::String(s) => Ok(Value::String(s.to_str()?.to_string())),
        LuaValue::Table(t) => {
            let len = t.raw_len();
            if len > 0 {
                let mut items = Vec::with_capacity(len);
                for i in 1..=len {
                    let v: LuaValue = t.get(i)?;
                    items.push(lua_to_json(&v)?);
                }
                Ok(Value::Array(items))
            } else {
                let mut map = Map::new();
                for pair in t.pairs::<String, LuaValue>() {
                    let (k, v) = pair?;
                    map.insert(k, lua_to_json(&v)?);
                }
                Ok(Value::Object(map))
            }
        }
        _ => Ok(Value::Null),
    }
}

fn stringify(value: &LuaValue) -> Result<String> {
    match value {
        LuaValue::String(s) => Ok(s.to_str()?.to_string()),
        LuaValue::Boolean(b) => Ok(b.to_string()),
        LuaValue::Integer(i) => Ok(i.to_string()),
        LuaValue::Number(n) => Ok(n.to_string()),
        LuaValue::Nil => Ok("nil".to_string()),
        other => Ok(lua_to_json(other)?.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn input_is_visible_and_dangerous_globals_are_gone() {
        let lua = Lua::new();
        let input = json!({"n": 2, "tags": ["a", "b"]});
        setup_sandbox(&lua, input.as_object().unwrap()).unwrap();

        let out: LuaValue = lua
            .load("return { double = input.n * 2, first = input.tags[1], has_os = os ~= nil }")
            .eval()
            .unwrap();
        assert_eq!(
            lua_to_json(&out).unwrap(),
            json!({"double": 4, "first": "a", "has_os": false})
        );
    }
}
