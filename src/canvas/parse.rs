use crate::error::{FlowError, FlowResult};

use super::types::Canvas;
use super::validate::{Issue, validate_tree};

/// Decode canvas JSON without structural validation (drafts are saved this way).
pub fn parse_unchecked(bytes: &[u8]) -> FlowResult<Canvas> {
    serde_json::from_slice(bytes)
        .map_err(|e| FlowError::Validation(vec![Issue::canvas(format!("malformed canvas: {}", e))]))
}

/// Decode and validate a canvas. All issues are returned together.
pub fn parse(bytes: &[u8]) -> FlowResult<Canvas> {
    let canvas = parse_unchecked(bytes)?;
    let issues = validate_tree(&canvas);
    if issues.is_empty() {
        Ok(canvas)
    } else {
        Err(FlowError::Validation(issues))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_malformed_json() {
        let err = parse(b"{ nodes: ").unwrap_err();
        match err {
            FlowError::Validation(issues) => {
                assert_eq!(issues.len(), 1);
                assert!(issues[0].message.starts_with("malformed canvas"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn unknown_node_type_is_a_validation_error() {
        let raw = br#"{"nodes":[{"id":"1","type":"teleport"}],"edges":[]}"#;
        assert!(matches!(parse(raw), Err(FlowError::Validation(_))));
    }

    #[test]
    fn accepts_minimal_canvas() {
        let raw = br#"{
            "version": "1",
            "nodes": [
                {"id": "100001", "type": "start", "data": {"outputs": [{"name": "q", "type": "string"}]}},
                {"id": "900001", "type": "end", "data": {"inputs": [
                    {"name": "out", "input": {"type": "string", "value": {"type": "ref", "content": {"blockID": "100001", "name": "q"}}}}
                ]}}
            ],
            "edges": [{"sourceNodeID": "100001", "targetNodeID": "900001"}]
        }"#;
        let canvas = parse(raw).unwrap();
        assert_eq!(canvas.nodes.len(), 2);
        assert_eq!(canvas.start_node().unwrap().id, "100001");
    }
}
