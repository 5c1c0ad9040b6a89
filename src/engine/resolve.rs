use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::canvas::{BlockValue, Branch, Logic, Operator, Param, Reference, SelectorConfig, ValueSource};
use crate::coercion::coerce_literal;

/// Variables visible to a node: its own scope's outputs, then enclosing
/// composite iteration variables, then outer scopes up to the root.
#[derive(Debug, Default)]
pub struct Env {
    parent: Option<Arc<Env>>,
    vars: BTreeMap<String, Value>,
}

impl Env {
    pub fn root(vars: BTreeMap<String, Value>) -> Arc<Self> {
        Arc::new(Self { parent: None, vars })
    }

    pub fn child(parent: &Arc<Env>, vars: BTreeMap<String, Value>) -> Arc<Self> {
        Arc::new(Self {
            parent: Some(parent.clone()),
            vars,
        })
    }

    /// Innermost binding for a block ID.
    pub fn lookup(&self, block_id: &str) -> Option<&Value> {
        match self.vars.get(block_id) {
            Some(v) => Some(v),
            None => self.parent.as_ref().and_then(|p| p.lookup(block_id)),
        }
    }
}

pub fn resolve_reference(r: &Reference, env: &Env) -> Value {
    let Some(block) = env.lookup(&r.block_id) else {
        return Value::Null;
    };
    let mut current = match block.get(&r.name) {
        Some(v) => v,
        None => return Value::Null,
    };
    for seg in &r.path {
        let next = match current {
            Value::Array(items) => seg.parse::<usize>().ok().and_then(|i| items.get(i)),
            other => other.get(seg),
        };
        current = match next {
            Some(v) => v,
            None => return Value::Null,
        };
    }
    current.clone()
}

pub fn resolve_source(src: &ValueSource, env: &Env) -> Value {
    match &src.value {
        Some(BlockValue::Literal(v)) => coerce_literal(src.data_type, v),
        Some(BlockValue::Ref(r)) => resolve_reference(r, env),
        None => Value::Null,
    }
}

/// Resolve a node's named parameters into an input object.
pub fn resolve_params(params: &[Param], env: &Env) -> Map<String, Value> {
    params
        .iter()
        .map(|p| (p.name.clone(), resolve_source(&p.input, env)))
        .collect()
}

/// First matching selector branch, or `None` for the `false` port.
pub fn evaluate_selector(config: &SelectorConfig, env: &Env) -> Option<usize> {
    config.branches.iter().position(|b| branch_matches(b, env))
}

fn branch_matches(branch: &Branch, env: &Env) -> bool {
    if branch.conditions.is_empty() {
        return false;
    }
    let mut results = branch.conditions.iter().map(|c| {
        let left = resolve_source(&c.left, env);
        let right = c.right.as_ref().map(|r| resolve_source(r, env)).unwrap_or(Value::Null);
        compare(c.operator, &left, &right)
    });
    match branch.logic {
        Logic::And => results.all(|r| r),
        Logic::Or => results.any(|r| r),
    }
}

fn as_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn length(v: &Value) -> Option<usize> {
    match v {
        Value::String(s) => Some(s.chars().count()),
        Value::Array(a) => Some(a.len()),
        Value::Object(m) => Some(m.len()),
        Value::Null => Some(0),
        _ => None,
    }
}

fn is_empty(v: &Value) -> bool {
    match v {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(m) => m.is_empty(),
        _ => false,
    }
}

fn equals(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(_), _) | (_, Value::Number(_)) => match (as_f64(left), as_f64(right)) {
            (Some(a), Some(b)) => a == b,
            _ => left == right,
        },
        _ => left == right,
    }
}

fn contains(haystack: &Value, needle: &Value) -> bool {
    match haystack {
        Value::String(s) => match needle {
            Value::String(n) => s.contains(n.as_str()),
            other => s.contains(&other.to_string()),
        },
        Value::Array(items) => items.iter().any(|i| equals(i, needle)),
        Value::Object(m) => needle.as_str().is_some_and(|k| m.contains_key(k)),
        _ => false,
    }
}

pub fn compare(op: Operator, left: &Value, right: &Value) -> bool {
    let numeric = |f: fn(f64, f64) -> bool| match (as_f64(left), as_f64(right)) {
        (Some(a), Some(b)) => f(a, b),
        _ => false,
    };
    let by_len = |f: fn(usize, usize) -> bool| match (length(left), as_f64(right)) {
        (Some(len), Some(n)) if n >= 0.0 => f(len, n as usize),
        _ => false,
    };
    match op {
        Operator::Equal => equals(left, right),
        Operator::NotEqual => !equals(left, right),
        Operator::LengthGt => by_len(|a, b| a > b),
        Operator::LengthGe => by_len(|a, b| a >= b),
        Operator::LengthLt => by_len(|a, b| a < b),
        Operator::LengthLe => by_len(|a, b| a <= b),
        Operator::Contains => contains(left, right),
        Operator::NotContains => !contains(left, right),
        Operator::Empty => is_empty(left),
        Operator::NotEmpty => !is_empty(left),
        Operator::IsTrue => left.as_bool() == Some(true),
        Operator::IsFalse => left.as_bool() == Some(false),
        Operator::Gt => numeric(|a, b| a > b),
        Operator::Ge => numeric(|a, b| a >= b),
        Operator::Lt => numeric(|a, b| a < b),
        Operator::Le => numeric(|a, b| a <= b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canvas::DataType;
    use serde_json::json;

    #[test]
    fn inner_scope_shadows_outer() {
        let root = Env::root(BTreeMap::from([
            ("a".to_string(), json!({"v": 1})),
            ("b".to_string(), json!({"v": [10, 20]})),
        ]));
        let inner = Env::child(&root, BTreeMap::from([("a".to_string(), json!({"v": 2}))]));

        let p = Param::reference("x", DataType::Integer, "a", "v");
        assert_eq!(resolve_source(&p.input, &inner), json!(2));

        let r = Reference {
            block_id: "b".into(),
            name: "v".into(),
            path: vec!["1".into()],
        };
        assert_eq!(resolve_reference(&r, &inner), json!(20));
    }

    #[test]
    fn missing_reference_resolves_to_null() {
        let env = Env::root(BTreeMap::new());
        let p = Param::reference("x", DataType::String, "nope", "v");
        assert_eq!(resolve_params(&[p], &env)["x"], Value::Null);
    }

    #[test]
    fn operators_compare_loosely() {
        assert!(compare(Operator::Equal, &json!(1), &json!(1.0)));
        assert!(compare(Operator::Gt, &json!("10"), &json!(9)));
        assert!(compare(Operator::LengthGe, &json!([1, 2]), &json!(2)));
        assert!(compare(Operator::Contains, &json!("hello"), &json!("ell")));
        assert!(compare(Operator::Contains, &json!(["a", "b"]), &json!("b")));
        assert!(compare(Operator::Empty, &Value::Null, &Value::Null));
        assert!(!compare(Operator::IsTrue, &json!("true"), &Value::Null));
    }

    #[test]
    fn first_matching_branch_wins() {
        let env = Env::root(BTreeMap::from([("s".to_string(), json!({"n": 5}))]));
        let cfg: SelectorConfig = serde_json::from_value(json!({
            "branches": [
                {"conditions": [{"operator": "gt",
                    "left": {"type": "integer", "value": {"type": "ref", "content": {"blockID": "s", "name": "n"}}},
                    "right": {"type": "integer", "value": {"type": "literal", "content": 10}}}]},
                {"logic": "or", "conditions": [
                    {"operator": "is_true", "left": {"type": "boolean", "value": {"type": "literal", "content": false}}},
                    {"operator": "le",
                     "left": {"type": "integer", "value": {"type": "ref", "content": {"blockID": "s", "name": "n"}}},
                     "right": {"type": "integer", "value": {"type": "literal", "content": 5}}}
                ]}
            ]
        }))
        .unwrap();
        assert_eq!(evaluate_selector(&cfg, &env), Some(1));
        assert_eq!(SelectorConfig::port_for(evaluate_selector(&cfg, &env)), "true_1");
    }
}
