mod common;

use serde_json::{Value, json};

use canvasflow::canvas::{Issue, parse, validate_tree};
use canvasflow::error::FlowError;

use common::*;

fn issues(canvas: &Value) -> Vec<Issue> {
    match parse(&serde_json::to_vec(canvas).unwrap()) {
        Ok(_) => Vec::new(),
        Err(FlowError::Validation(issues)) => issues,
        Err(other) => panic!("unexpected error: {other}"),
    }
}

fn has(issues: &[Issue], node: Option<&str>, needle: &str) -> bool {
    issues.iter().any(|i| {
        i.message.contains(needle) && node.is_none_or(|id| i.node.as_ref().is_some_and(|n| n.node_id == id))
    })
}

#[test]
fn a_linear_canvas_is_valid() {
    let canvas = canvas(
        vec![
            start(json!([field("q", "string")])),
            node("work", "code", json!({ "inputs": [reference("q", "string", "start", "q")] })),
            end(json!([reference("q", "string", "work", "q")])),
        ],
        vec![edge("start", "work"), edge("work", "end")],
    );
    assert!(issues(&canvas).is_empty());
}

#[test]
fn all_issues_are_reported_together() {
    let canvas = canvas(
        vec![start(json!([])), start(json!([]))],
        vec![edge("start", "ghost")],
    );
    let found = issues(&canvas);

    assert!(has(&found, None, "no end node"));
    assert!(has(&found, None, "more than one start node"));
    assert!(has(&found, None, "duplicate node id 'start'"));
    assert!(found.iter().any(|i| i.path.as_ref().is_some_and(|p| p.end == "ghost")));
}

#[test]
fn selector_ports_must_all_be_connected() {
    let canvas = canvas(
        vec![
            start(json!([])),
            node("pick", "selector", json!({ "config": { "branches": [{ "conditions": [] }] } })),
            end(json!([])),
        ],
        vec![
            edge("start", "pick"),
            port_edge("pick", "true", "end"),
        ],
    );
    let found = issues(&canvas);

    assert!(has(&found, Some("pick"), "output port 'false' is not connected"));
    assert!(!has(&found, Some("pick"), "output port 'true'"));
}

#[test]
fn edges_from_unknown_ports_are_rejected() {
    let canvas = canvas(
        vec![start(json!([])), node("work", "code", json!({})), end(json!([]))],
        vec![
            edge("start", "work"),
            port_edge("work", "sideways", "end"),
        ],
    );
    assert!(has(&issues(&canvas), None, "has no output port 'sideways'"));
}

#[test]
fn references_must_point_upstream() {
    let canvas = canvas(
        vec![
            start(json!([])),
            node("a", "code", json!({ "inputs": [reference("x", "string", "b", "x")] })),
            node("b", "code", json!({})),
            end(json!([reference("y", "string", "nowhere", "y")])),
        ],
        vec![edge("start", "a"), edge("a", "b"), edge("b", "end")],
    );
    let found = issues(&canvas);

    assert!(has(&found, Some("a"), "references node 'b' which is not upstream"));
    assert!(has(&found, Some("end"), "references unknown node 'nowhere'"));
}

#[test]
fn cycles_are_rejected() {
    let canvas = canvas(
        vec![
            start(json!([])),
            node("a", "code", json!({})),
            node("b", "code", json!({})),
            end(json!([])),
        ],
        vec![
            edge("start", "a"),
            edge("a", "b"),
            edge("b", "a"),
            edge("b", "end"),
        ],
    );
    assert!(has(&issues(&canvas), None, "cycle"));
}

#[test]
fn break_only_lives_inside_loops() {
    let outside = canvas(
        vec![
            start(json!([])),
            node("stop", "break", json!({})),
            end(json!([])),
        ],
        vec![edge("start", "stop"), edge("stop", "end")],
    );
    assert!(has(&issues(&outside), Some("stop"), "must be inside a loop"));

    let mut looping = node("loop", "loop", json!({ "config": { "loopType": "infinite" } }));
    looping["blocks"] = json!([node("stop", "break", json!({}))]);
    let canvas = canvas(
        vec![start(json!([])), looping, end(json!([]))],
        vec![edge("start", "loop"), edge("loop", "end")],
    );
    assert!(issues(&canvas).is_empty(), "{:?}", issues(&canvas));
}

#[test]
fn infinite_loops_need_a_break() {
    let mut looping = node("loop", "loop", json!({ "config": { "loopType": "infinite" } }));
    looping["blocks"] = json!([node("inner", "code", json!({}))]);
    let canvas = canvas(
        vec![start(json!([])), looping, end(json!([]))],
        vec![edge("start", "loop"), edge("loop", "end")],
    );
    assert!(has(&issues(&canvas), Some("loop"), "infinite loop has no break node"));
}

#[test]
fn composites_cannot_nest() {
    let mut outer = node("outer", "batch", json!({}));
    outer["blocks"] = json!([node("inner", "loop", json!({}))]);
    let canvas = canvas(
        vec![start(json!([])), outer, end(json!([]))],
        vec![edge("start", "outer"), edge("outer", "end")],
    );
    assert!(has(&issues(&canvas), Some("inner"), "cannot be nested"));
}

#[test]
fn sub_workflow_nodes_need_a_target() {
    let canvas = canvas(
        vec![start(json!([])), node("call", "sub_workflow", json!({})), end(json!([]))],
        vec![edge("start", "call"), edge("call", "end")],
    );
    assert!(has(&issues(&canvas), Some("call"), "has no workflowId"));
}

#[test]
fn unconnected_start_is_reported() {
    let canvas = canvas(vec![start(json!([])), end(json!([]))], vec![]);
    let found = validate_tree(&serde_json::from_value(canvas).unwrap());
    assert!(has(&found, Some("start"), "start node is not connected"));
}

#[test]
fn questions_offer_at_most_one_option_per_letter() {
    let options: Vec<String> = (0..27).map(|i| format!("choice {i}")).collect();
    let canvas = canvas(
        vec![
            start(json!([])),
            node(
                "pick",
                "question_answer",
                json!({ "config": { "question": "Which?", "answerType": "option", "options": options } }),
            ),
            end(json!([])),
        ],
        vec![edge("start", "pick"), port_edge("pick", "default", "end")],
    );
    assert!(has(&issues(&canvas), Some("pick"), "question has more than 26 options"));
}
