use serde_json::{Map, Value};

/// Render `{{name}}` and `{{name.nested.0}}` placeholders against resolved node inputs.
/// Unknown placeholders render as empty strings; unterminated ones are left as-is.
pub fn render(template: &str, vars: &Map<String, Value>) -> String {
    let mut result = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find("{{") {
        let Some(close) = rest[open + 2..].find("}}") else {
            break;
        };
        result.push_str(&rest[..open]);
        let path = rest[open + 2..open + 2 + close].trim();
        result.push_str(&resolve_path(path, vars));
        rest = &rest[open + 2 + close + 2..];
    }

    result.push_str(rest);
    result
}

/// Resolve a dotted path; numeric segments index into arrays.
fn resolve_path(path: &str, vars: &Map<String, Value>) -> String {
    let mut parts = path.split('.');

    let Some(first) = parts.next().and_then(|p| vars.get(p)) else {
        return String::new();
    };

    let mut current = first;
    for part in parts {
        let next = match current {
            Value::Array(items) => part.parse::<usize>().ok().and_then(|i| items.get(i)),
            other => other.get(part),
        };
        current = match next {
            Some(v) => v,
            None => return String::new(),
        };
    }

    match current {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn test_simple_render() {
        assert_eq!(
            render("Hello {{name}}!", &vars(json!({"name": "Alice"}))),
            "Hello Alice!"
        );
    }

    #[test]
    fn test_nested_and_indexed() {
        let v = vars(json!({"user": {"emails": ["a@x.io", "b@x.io"]}}));
        assert_eq!(render("{{ user.emails.1 }}", &v), "b@x.io");
    }

    #[test]
    fn test_non_string_values() {
        let v = vars(json!({"n": 3, "obj": {"k": true}}));
        assert_eq!(render("{{n}} {{obj}}", &v), r#"3 {"k":true}"#);
    }

    #[test]
    fn test_missing_and_unterminated() {
        let v = Map::new();
        assert_eq!(render("a{{missing}}b", &v), "ab");
        assert_eq!(render("a{{open", &v), "a{{open");
    }
}
