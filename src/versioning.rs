//! Version strings, content-addressed commit IDs and structural canvas diffs.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::canvas::Canvas;
use crate::error::FlowError;

/// A published version tag, `v<major>.<minor>.<patch>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl FromStr for Version {
    type Err = FlowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || FlowError::InvalidParam(format!("invalid version '{}', expected vX.Y.Z", s));
        let body = s.strip_prefix('v').ok_or_else(invalid)?;
        let mut parts = body.split('.').map(|p| p.parse::<u64>().map_err(|_| invalid()));
        let version = Version {
            major: parts.next().ok_or_else(invalid)??,
            minor: parts.next().ok_or_else(invalid)??,
            patch: parts.next().ok_or_else(invalid)??,
        };
        if parts.next().is_some() {
            return Err(invalid());
        }
        Ok(version)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Check that `next` parses and is strictly newer than `latest`.
pub fn check_next_version(latest: Option<&str>, next: &str) -> Result<Version, FlowError> {
    let next_version: Version = next.parse()?;
    if let Some(latest) = latest {
        let latest_version: Version = latest.parse()?;
        if next_version.cmp(&latest_version) != Ordering::Greater {
            return Err(FlowError::InvalidParam(format!(
                "version {} must be greater than the latest published {}",
                next, latest
            )));
        }
    }
    Ok(next_version)
}

/// Hex SHA-256 of the canvas's canonical JSON.
pub fn commit_id(canvas: &Canvas) -> String {
    let bytes = serde_json::to_vec(canvas).unwrap_or_default();
    hex::encode(Sha256::digest(&bytes))
}

/// Node-level differences between two canvases, ignoring layout.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CanvasDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub changed: Vec<String>,
    pub edges_changed: bool,
}

impl CanvasDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
            && self.removed.is_empty()
            && self.changed.is_empty()
            && !self.edges_changed
    }
}

fn nodes_by_id(canvas: &Value) -> BTreeMap<String, Value> {
    fn walk(nodes: &Value, out: &mut BTreeMap<String, Value>) {
        for node in nodes.as_array().into_iter().flatten() {
            let Some(id) = node.get("id").and_then(Value::as_str) else {
                continue;
            };
            let mut own = node.clone();
            if let Value::Object(map) = &mut own {
                map.remove("blocks");
            }
            out.insert(id.to_string(), own);
            if let Some(blocks) = node.get("blocks") {
                walk(blocks, out);
            }
        }
    }
    let mut out = BTreeMap::new();
    walk(&canvas["nodes"], &mut out);
    out
}

fn all_edges(canvas: &Value) -> Vec<Value> {
    fn walk(v: &Value, out: &mut Vec<Value>) {
        if let Some(edges) = v.get("edges").and_then(Value::as_array) {
            out.extend(edges.iter().cloned());
        }
        for node in v.get("nodes").or_else(|| v.get("blocks")).and_then(Value::as_array).into_iter().flatten() {
            walk(node, out);
        }
    }
    let mut out = Vec::new();
    walk(canvas, &mut out);
    out.sort_by_key(|e| e.to_string());
    out
}

/// Structural diff from `base` to `draft`.
pub fn diff(base: &Canvas, draft: &Canvas) -> CanvasDiff {
    let (a, b) = (base.structural_value(), draft.structural_value());
    let (before, after) = (nodes_by_id(&a), nodes_by_id(&b));

    let mut d = CanvasDiff {
        edges_changed: all_edges(&a) != all_edges(&b),
        ..Default::default()
    };
    for (id, node) in &after {
        match before.get(id) {
            None => d.added.push(id.clone()),
            Some(old) if old != node => d.changed.push(id.clone()),
            Some(_) => {}
        }
    }
    d.removed = before.keys().filter(|id| !after.contains_key(*id)).cloned().collect();
    d
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn canvas(v: Value) -> Canvas {
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn versions_must_increase() {
        assert!(check_next_version(None, "v0.0.1").is_ok());
        assert!(check_next_version(Some("v0.0.1"), "v0.1.0").is_ok());
        assert!(check_next_version(Some("v0.1.0"), "v0.0.9").is_err());
        assert!(check_next_version(Some("v0.1.0"), "v0.1.0").is_err());
        assert!("1.0.0".parse::<Version>().is_err());
        assert!("v1.0".parse::<Version>().is_err());
        assert_eq!("v1.2.3".parse::<Version>().unwrap().to_string(), "v1.2.3");
    }

    #[test]
    fn layout_moves_are_not_changes() {
        let base = canvas(json!({"nodes": [
            {"id": "s", "type": "start", "meta": {"title": "Start", "position": {"x": 0, "y": 0}}},
            {"id": "e", "type": "end"}
        ], "edges": [{"sourceNodeID": "s", "targetNodeID": "e"}]}));
        let moved = canvas(json!({"nodes": [
            {"id": "s", "type": "start", "meta": {"title": "Start", "position": {"x": 90, "y": 10}}},
            {"id": "e", "type": "end"}
        ], "edges": [{"sourceNodeID": "s", "targetNodeID": "e"}]}));
        assert!(diff(&base, &moved).is_empty());
        assert_ne!(commit_id(&base), commit_id(&moved));

        let renamed = canvas(json!({"nodes": [
            {"id": "s", "type": "start", "meta": {"title": "Begin"}},
            {"id": "m", "type": "message"},
            {"id": "e", "type": "end"}
        ], "edges": [{"sourceNodeID": "s", "targetNodeID": "e"}]}));
        let d = diff(&base, &renamed);
        assert_eq!(d.changed, vec!["s".to_string()]);
        assert_eq!(d.added, vec!["m".to_string()]);
        assert!(!d.edges_changed);
    }
}
