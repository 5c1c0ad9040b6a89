//! Converts untyped caller input into the value tree a node declares.
//!
//! The same entry points serve workflow-run input binding (Start node fields)
//! and single-node debug input binding.

use serde::Serialize;
use serde_json::{Map, Number, Value};

use crate::canvas::{DataType, Variable, VariableSchema};
use crate::error::{FlowError, FlowResult};

#[derive(Debug, Clone, Copy, Default)]
pub struct CoerceOptions {
    /// Turn the first type mismatch into an error instead of a warning.
    pub fail_fast: bool,
    pub skip_required_check: bool,
    /// Drop input fields the schema does not declare.
    pub skip_unknown_fields: bool,
}

/// A non-fatal per-field type mismatch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Warning {
    pub path: String,
    pub expected: DataType,
    pub message: String,
}

#[derive(Debug, Clone, Default)]
pub struct Coerced {
    pub value: Map<String, Value>,
    pub warnings: Vec<Warning>,
}

/// Coerce an object of named fields against declarations.
pub fn coerce_fields(
    fields: &[Variable],
    input: &Map<String, Value>,
    opts: CoerceOptions,
) -> FlowResult<Coerced> {
    let mut warnings = Vec::new();
    let value = coerce_object(fields, input, "", opts, &mut warnings)?;
    Ok(Coerced { value, warnings })
}

/// Coerce a single value against one declaration.
pub fn coerce_value(
    var: &Variable,
    value: &Value,
    opts: CoerceOptions,
) -> FlowResult<(Value, Vec<Warning>)> {
    let mut warnings = Vec::new();
    let out = convert(var, value, &var.name, opts, &mut warnings)?.unwrap_or(Value::Null);
    Ok((out, warnings))
}

/// Best-effort conversion to a bare data type, used for literal parameters.
/// Mismatches are returned unchanged.
pub fn coerce_literal(data_type: DataType, value: &Value) -> Value {
    let var = Variable::new("", data_type);
    let mut sink = Vec::new();
    match convert(&var, value, "", CoerceOptions::default(), &mut sink) {
        Ok(Some(v)) if sink.is_empty() => v,
        _ => value.clone(),
    }
}

fn join(prefix: &str, segment: &str) -> String {
    if prefix.is_empty() {
        segment.to_string()
    } else {
        format!("{}.{}", prefix, segment)
    }
}

fn coerce_object(
    fields: &[Variable],
    input: &Map<String, Value>,
    prefix: &str,
    opts: CoerceOptions,
    warnings: &mut Vec<Warning>,
) -> FlowResult<Map<String, Value>> {
    let mut out = Map::new();

    for field in fields {
        let path = join(prefix, &field.name);
        let raw = input.get(&field.name);
        let empty = match raw {
            None | Some(Value::Null) => true,
            Some(Value::String(s)) => s.is_empty() && field.data_type != DataType::String,
            _ => false,
        };
        let blank_string = matches!(raw, Some(Value::String(s)) if s.is_empty());

        if empty || (blank_string && field.default_value.is_some()) {
            if let Some(default) = &field.default_value {
                let resolved = convert(field, default, &path, opts, warnings)?;
                out.insert(field.name.clone(), resolved.unwrap_or(Value::Null));
                continue;
            }
            if field.required && !opts.skip_required_check {
                return Err(FlowError::InvalidParam(format!(
                    "missing required field '{}'",
                    path
                )));
            }
            if let Some(v) = raw {
                if blank_string {
                    out.insert(field.name.clone(), Value::String(String::new()));
                } else if v.is_null() {
                    out.insert(field.name.clone(), Value::Null);
                }
            }
            continue;
        }

        let raw = raw.cloned().unwrap_or(Value::Null);
        let resolved = convert(field, &raw, &path, opts, warnings)?;
        out.insert(field.name.clone(), resolved.unwrap_or(Value::Null));
    }

    if !opts.skip_unknown_fields {
        for (k, v) in input {
            if !fields.iter().any(|f| &f.name == k) {
                out.insert(k.clone(), v.clone());
            }
        }
    }

    Ok(out)
}

/// `Ok(None)` means the value did not fit the declared type; a warning has
/// been recorded (or the zero value substituted for `ignoreTypeError` fields).
fn convert(
    var: &Variable,
    value: &Value,
    path: &str,
    opts: CoerceOptions,
    warnings: &mut Vec<Warning>,
) -> FlowResult<Option<Value>> {
    if value.is_null() {
        return Ok(Some(Value::Null));
    }

    let converted = match var.data_type {
        DataType::String | DataType::Image => to_string(value),
        DataType::Integer => to_integer(value),
        DataType::Number => to_number(value),
        DataType::Boolean => to_boolean(value),
        DataType::Object => match as_object(value) {
            Some(map) => {
                let fields = match &var.schema {
                    Some(VariableSchema::Object(fields)) => fields.as_slice(),
                    _ => &[],
                };
                return Ok(Some(Value::Object(coerce_object(
                    fields, &map, path, opts, warnings,
                )?)));
            }
            None => None,
        },
        DataType::List => match as_array(value) {
            Some(items) => {
                let item_var = match &var.schema {
                    Some(VariableSchema::List(item)) => Some(item.as_ref()),
                    _ => None,
                };
                let Some(item_var) = item_var else {
                    return Ok(Some(Value::Array(items)));
                };
                let mut out = Vec::with_capacity(items.len());
                for (i, item) in items.iter().enumerate() {
                    let item_path = join(path, &i.to_string());
                    if let Some(v) = convert(item_var, item, &item_path, opts, warnings)? {
                        out.push(v);
                    }
                }
                return Ok(Some(Value::Array(out)));
            }
            None => None,
        },
    };

    if converted.is_some() {
        return Ok(converted);
    }

    if var.ignore_type_error {
        return Ok(Some(zero_value(var.data_type)));
    }

    let message = format!("expected {}, got {}", var.data_type, type_name(value));
    if opts.fail_fast {
        return Err(FlowError::InvalidParam(format!("field '{}': {}", path, message)));
    }
    warnings.push(Warning {
        path: path.to_string(),
        expected: var.data_type,
        message,
    });
    Ok(None)
}

fn to_string(value: &Value) -> Option<Value> {
    let s = match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Object(_) | Value::Array(_) => serde_json::to_string(value).ok()?,
        Value::Null => return Some(Value::Null),
    };
    Some(Value::String(s))
}

fn to_integer(value: &Value) -> Option<Value> {
    match value {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(Value::from(i))
            } else {
                let f = n.as_f64()?;
                f.is_finite().then(|| Value::from(f.trunc() as i64))
            }
        }
        Value::String(s) => s.trim().parse::<i64>().ok().map(Value::from),
        _ => None,
    }
}

fn to_number(value: &Value) -> Option<Value> {
    match value {
        Value::Number(_) => Some(value.clone()),
        Value::String(s) => {
            let f = s.trim().parse::<f64>().ok()?;
            Number::from_f64(f).map(Value::Number)
        }
        _ => None,
    }
}

fn to_boolean(value: &Value) -> Option<Value> {
    match value {
        Value::Bool(_) => Some(value.clone()),
        Value::String(s) => match s.as_str() {
            "1" | "t" | "T" | "true" | "TRUE" | "True" => Some(Value::Bool(true)),
            "0" | "f" | "F" | "false" | "FALSE" | "False" => Some(Value::Bool(false)),
            _ => None,
        },
        _ => None,
    }
}

fn as_object(value: &Value) -> Option<Map<String, Value>> {
    match value {
        Value::Object(m) => Some(m.clone()),
        Value::String(s) => match serde_json::from_str::<Value>(s) {
            Ok(Value::Object(m)) => Some(m),
            _ => None,
        },
        _ => None,
    }
}

fn as_array(value: &Value) -> Option<Vec<Value>> {
    match value {
        Value::Array(items) => Some(items.clone()),
        Value::String(s) => match serde_json::from_str::<Value>(s) {
            Ok(Value::Array(items)) => Some(items),
            _ => None,
        },
        _ => None,
    }
}

fn zero_value(data_type: DataType) -> Value {
    match data_type {
        DataType::String | DataType::Image => Value::String(String::new()),
        DataType::Integer => Value::from(0),
        DataType::Number => Value::from(0.0),
        DataType::Boolean => Value::Bool(false),
        DataType::Object => Value::Object(Map::new()),
        DataType::List => Value::Array(Vec::new()),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn empty_string_takes_declared_default() {
        let fields = vec![Variable::new("s", DataType::String).with_default(json!("str"))];
        let out = coerce_fields(&fields, &obj(json!({"s": ""})), CoerceOptions::default()).unwrap();
        assert_eq!(out.value["s"], json!("str"));
        assert!(out.warnings.is_empty());
    }

    #[test]
    fn string_true_becomes_boolean() {
        let fields = vec![Variable::new("bool", DataType::Boolean)];
        let out =
            coerce_fields(&fields, &obj(json!({"bool": "true"})), CoerceOptions::default()).unwrap();
        assert_eq!(out.value["bool"], json!(true));
    }

    #[test]
    fn mismatch_is_a_warning_with_path() {
        let fields = vec![
            Variable::new("a", DataType::Object)
                .with_fields(vec![Variable::new("b", DataType::Integer)]),
        ];
        let out = coerce_fields(
            &fields,
            &obj(json!({"a": {"b": "nope"}})),
            CoerceOptions::default(),
        )
        .unwrap();
        assert_eq!(out.value["a"]["b"], Value::Null);
        assert_eq!(out.warnings.len(), 1);
        assert_eq!(out.warnings[0].path, "a.b");
        assert_eq!(out.warnings[0].expected, DataType::Integer);
    }

    #[test]
    fn fail_fast_turns_mismatch_into_error() {
        let fields = vec![Variable::new("n", DataType::Number)];
        let opts = CoerceOptions {
            fail_fast: true,
            ..Default::default()
        };
        let err = coerce_fields(&fields, &obj(json!({"n": "abc"})), opts).unwrap_err();
        assert!(matches!(err, FlowError::InvalidParam(_)));
    }

    #[test]
    fn ignore_type_error_yields_zero_value() {
        let mut field = Variable::new("n", DataType::Integer);
        field.ignore_type_error = true;
        let out = coerce_fields(&[field], &obj(json!({"n": "x"})), CoerceOptions::default()).unwrap();
        assert_eq!(out.value["n"], json!(0));
        assert!(out.warnings.is_empty());
    }

    #[test]
    fn missing_required_field_is_invalid_param() {
        let fields = vec![Variable::new("q", DataType::String).required()];
        let err = coerce_fields(&fields, &Map::new(), CoerceOptions::default()).unwrap_err();
        assert!(err.to_string().contains("'q'"));

        let opts = CoerceOptions {
            skip_required_check: true,
            ..Default::default()
        };
        assert!(coerce_fields(&fields, &Map::new(), opts).is_ok());
    }

    #[test]
    fn list_drops_elements_that_do_not_fit() {
        let fields = vec![
            Variable::new("xs", DataType::List).with_items(Variable::new("", DataType::Integer)),
        ];
        let out = coerce_fields(
            &fields,
            &obj(json!({"xs": "[1, \"2\", \"three\", 4.9]"})),
            CoerceOptions::default(),
        )
        .unwrap();
        assert_eq!(out.value["xs"], json!([1, 2, 4]));
        assert_eq!(out.warnings[0].path, "xs.2");
    }

    #[test]
    fn object_elements_are_kept_with_warnings() {
        let item = Variable::new("", DataType::Object)
            .with_fields(vec![Variable::new("age", DataType::Integer)]);
        let fields = vec![Variable::new("people", DataType::List).with_items(item)];
        let out = coerce_fields(
            &fields,
            &obj(json!({"people": [{"age": "old"}, {"age": 3}]})),
            CoerceOptions::default(),
        )
        .unwrap();
        assert_eq!(out.value["people"].as_array().unwrap().len(), 2);
        assert_eq!(out.warnings[0].path, "people.0.age");
    }

    #[test]
    fn unknown_fields_pass_through_unless_skipped() {
        let fields = vec![Variable::new("a", DataType::String)];
        let input = obj(json!({"a": 1, "extra": true}));
        let out = coerce_fields(&fields, &input, CoerceOptions::default()).unwrap();
        assert_eq!(out.value["a"], json!("1"));
        assert_eq!(out.value["extra"], json!(true));

        let opts = CoerceOptions {
            skip_unknown_fields: true,
            ..Default::default()
        };
        let out = coerce_fields(&fields, &input, opts).unwrap();
        assert!(!out.value.contains_key("extra"));
    }

    #[test]
    fn literal_coercion_keeps_mismatches() {
        assert_eq!(coerce_literal(DataType::Integer, &json!("42")), json!(42));
        assert_eq!(coerce_literal(DataType::Integer, &json!("x")), json!("x"));
    }
}
