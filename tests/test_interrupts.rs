//! Suspend/resume: interrupt events, resume addressing across composites
//! and sub-workflows, cancellation, and the synchronous-run guard.

mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use axum::extract::Query;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{Value, json};

use canvasflow::checkpoint::MemoryCheckpointStore;
use canvasflow::engine::InterruptType;
use canvasflow::engine::interrupt::AddressSegment;
use canvasflow::engine::types::*;
use canvasflow::error::FlowError;
use canvasflow::service::{OpenApiRun, WorkflowService};
use canvasflow::storage::JsonRepository;

use common::*;

/// Test-run the draft and wait until it stops.
async fn start_run(service: &WorkflowService, canvas: &Value) -> String {
    let id = draft(service, "wf", canvas).await;
    let execute_id = service
        .test_run(&caller(), &id, Default::default())
        .await
        .unwrap();
    service.wait(&execute_id).await.unwrap();
    execute_id
}

#[tokio::test]
async fn input_node_suspends_until_resumed() {
    let service = service();
    let execute_id = start_run(&service, &input_canvas()).await;

    let process = service.get_process(&caller(), &execute_id).await.unwrap();
    assert_eq!(process.status, ExecutionStatus::Running);
    assert_eq!(process.node_events.len(), 1);
    let event = &process.node_events[0];
    assert_eq!(event.event_type, InterruptType::Input);
    assert_eq!(event.node_id, "ask");
    assert_eq!(event.payload["prompt"], json!("Who are you?"));
    assert_eq!(event.payload["fields"][0]["name"], json!("name"));
    assert!(event.id.starts_with(&format!("{}:", execute_id)));

    let root = service
        .resume(&caller(), &execute_id, &event.id, json!({ "name": "x" }))
        .await
        .unwrap();
    assert_eq!(root, execute_id);
    let report = service.wait(&root).await.unwrap();

    assert_eq!(report.status, ExecutionStatus::Success);
    assert_eq!(report.output, Some(json!({ "name": "x" })));
    assert!(report.interrupts.is_empty());
}

#[tokio::test]
async fn json_text_is_accepted_as_resume_data() {
    let service = service();
    let execute_id = start_run(&service, &input_canvas()).await;
    let event_id = service.wait(&execute_id).await.unwrap().interrupts[0].id.clone();

    service
        .resume(&caller(), &execute_id, &event_id, json!(r#"{"name": "y"}"#))
        .await
        .unwrap();
    let report = service.wait(&execute_id).await.unwrap();

    assert_eq!(report.output, Some(json!({ "name": "y" })));
}

#[tokio::test]
async fn invalid_submission_asks_again() {
    let service = service();
    let execute_id = start_run(&service, &input_canvas()).await;
    let first = service.wait(&execute_id).await.unwrap().interrupts[0].id.clone();

    service
        .resume(&caller(), &execute_id, &first, json!({ "other": 1 }))
        .await
        .unwrap();
    let report = service.wait(&execute_id).await.unwrap();

    assert_eq!(report.status, ExecutionStatus::Running);
    assert_eq!(report.interrupts.len(), 1);
    let again = &report.interrupts[0];
    assert_ne!(again.id, first);
    assert_eq!(again.node_id, "ask");
    assert!(again.payload["error"].as_str().unwrap().contains("name"));
}

#[tokio::test]
async fn an_event_can_only_be_resumed_once() {
    let service = service();
    let canvas = canvas(
        vec![
            start(json!([])),
            node("first", "input", json!({ "outputs": [field("a", "string")] })),
            node("second", "input", json!({ "outputs": [field("b", "string")] })),
            end(json!([
                reference("a", "string", "first", "a"),
                reference("b", "string", "second", "b")
            ])),
        ],
        vec![edge("start", "first"), edge("first", "second"), edge("second", "end")],
    );
    let execute_id = start_run(&service, &canvas).await;
    let first = service.wait(&execute_id).await.unwrap().interrupts[0].id.clone();

    service
        .resume(&caller(), &execute_id, &first, json!({ "a": "1" }))
        .await
        .unwrap();
    let report = service.wait(&execute_id).await.unwrap();
    assert_eq!(report.status, ExecutionStatus::Running);
    assert_eq!(report.interrupts[0].node_id, "second");

    let err = service
        .resume(&caller(), &execute_id, &first, json!({ "a": "2" }))
        .await
        .unwrap_err();
    assert!(matches!(err, FlowError::AlreadyResumed(_)));

    let second = report.interrupts[0].id.clone();
    service
        .resume(&caller(), &execute_id, &second, json!({ "b": "3" }))
        .await
        .unwrap();
    let report = service.wait(&execute_id).await.unwrap();
    assert_eq!(report.output, Some(json!({ "a": "1", "b": "3" })));
}

#[tokio::test]
async fn unknown_events_are_not_found() {
    let service = service();
    let execute_id = start_run(&service, &input_canvas()).await;

    let err = service
        .resume(&caller(), &execute_id, &format!("{}:ask#99", execute_id), json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, FlowError::NotFound(_)));

    let err = service
        .resume(&caller(), &execute_id, "other-root:ask#1", json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, FlowError::NotFound(_)));
}

#[tokio::test]
async fn batch_iterations_suspend_and_resume_independently() {
    let service = service();
    let batch = json!({
        "id": "fan",
        "type": "batch",
        "data": {
            "inputs": [reference("topics", "list", "start", "topics")],
            "outputParams": [reference("answers", "list", "ask", "answer")]
        },
        "blocks": [
            node("ask", "input", json!({ "outputs": [field("answer", "string")] })),
        ]
    });
    let canvas = canvas(
        vec![
            start(json!([field("topics", "list")])),
            batch,
            end(json!([reference("answers", "list", "fan", "answers")])),
        ],
        vec![edge("start", "fan"), edge("fan", "end")],
    );
    let id = draft(&service, "batch", &canvas).await;
    let execute_id = service
        .test_run(&caller(), &id, object(json!({ "topics": ["a", "b"] })))
        .await
        .unwrap();
    let report = service.wait(&execute_id).await.unwrap();

    assert_eq!(report.status, ExecutionStatus::Running);
    assert_eq!(report.interrupts.len(), 2);
    let by_index = |index: usize| {
        report
            .interrupts
            .iter()
            .find(|e| e.address.innermost_index() == Some(index))
            .map(|e| e.id.clone())
            .unwrap()
    };
    let (ev0, ev1) = (by_index(0), by_index(1));
    assert!(ev1.contains("fan[1]/ask"));

    service
        .resume(&caller(), &execute_id, &ev1, json!({ "answer": "second" }))
        .await
        .unwrap();
    let report = service.wait(&execute_id).await.unwrap();
    assert_eq!(report.status, ExecutionStatus::Running);
    assert_eq!(report.interrupts.len(), 1);
    assert_eq!(report.interrupts[0].id, ev0);

    service
        .resume(&caller(), &execute_id, &ev0, json!({ "answer": "first" }))
        .await
        .unwrap();
    let report = service.wait(&execute_id).await.unwrap();

    assert_eq!(report.status, ExecutionStatus::Success);
    // completion order
    assert_eq!(report.output, Some(json!({ "answers": ["second", "first"] })));
}

#[tokio::test]
async fn loop_iterations_suspend_one_at_a_time() {
    let service = service();
    let looping = json!({
        "id": "each",
        "type": "loop",
        "data": {
            "inputs": [reference("names", "list", "start", "names")],
            "outputParams": [reference("answers", "list", "ask", "answer")],
            "config": { "loopType": "array" }
        },
        "blocks": [
            node("ask", "input", json!({ "outputs": [field("answer", "string")] })),
        ]
    });
    let canvas = canvas(
        vec![
            start(json!([field("names", "list")])),
            looping,
            end(json!([reference("answers", "list", "each", "answers")])),
        ],
        vec![edge("start", "each"), edge("each", "end")],
    );
    let id = draft(&service, "loop", &canvas).await;
    let execute_id = service
        .test_run(&caller(), &id, object(json!({ "names": ["a", "b"] })))
        .await
        .unwrap();

    let mut answers = ["x", "y"].into_iter();
    for index in 0..2 {
        let report = service.wait(&execute_id).await.unwrap();
        assert_eq!(report.status, ExecutionStatus::Running);
        assert_eq!(report.interrupts.len(), 1);
        let event = &report.interrupts[0];
        assert_eq!(event.address.innermost_index(), Some(index));
        assert!(event.id.contains(&format!("each[{index}]/ask")));

        service
            .resume(&caller(), &execute_id, &event.id, json!({ "answer": answers.next().unwrap() }))
            .await
            .unwrap();
    }
    let report = service.wait(&execute_id).await.unwrap();

    assert_eq!(report.status, ExecutionStatus::Success);
    assert_eq!(report.output, Some(json!({ "answers": ["x", "y"] })));
}

/// Start -> question `pick` (red/blue) -> one code node per port -> End.
fn colour_question_canvas() -> Value {
    let route = |id: &str| node(id, "code", json!({ "inputs": [lit("route", "string", json!(id))] }));
    canvas(
        vec![
            start(json!([])),
            node(
                "pick",
                "question_answer",
                json!({ "config": {
                    "question": "Favourite colour?",
                    "answerType": "option",
                    "options": ["red", "blue"]
                } }),
            ),
            route("red"),
            route("blue"),
            route("other"),
            end(json!([
                reference("option", "string", "pick", "optionId"),
                reference("content", "string", "pick", "optionContent"),
                reference("red", "string", "red", "route"),
                reference("blue", "string", "blue", "route"),
                reference("other", "string", "other", "route")
            ])),
        ],
        vec![
            edge("start", "pick"),
            port_edge("pick", "branch_0", "red"),
            port_edge("pick", "branch_1", "blue"),
            port_edge("pick", "default", "other"),
            edge("red", "end"),
            edge("blue", "end"),
            edge("other", "end"),
        ],
    )
}

#[tokio::test]
async fn question_routes_on_the_chosen_option() {
    let service = service();
    let execute_id = start_run(&service, &colour_question_canvas()).await;
    let report = service.wait(&execute_id).await.unwrap();
    let first = report.interrupts[0].clone();
    assert_eq!(first.event_type, InterruptType::Question);
    assert_eq!(first.payload["question"], json!("Favourite colour?"));
    assert_eq!(first.payload["options"][1], json!({ "id": "B", "content": "blue" }));

    // An empty answer asks again.
    service
        .resume(&caller(), &execute_id, &first.id, json!(""))
        .await
        .unwrap();
    let report = service.wait(&execute_id).await.unwrap();
    assert_eq!(report.status, ExecutionStatus::Running);
    assert_eq!(report.interrupts.len(), 1);
    let again = report.interrupts[0].clone();
    assert_ne!(again.id, first.id);
    assert_eq!(again.node_id, "pick");
    assert_eq!(again.payload["history"][0]["answer"], json!(""));

    service
        .resume(&caller(), &execute_id, &again.id, json!({ "answer": "blue" }))
        .await
        .unwrap();
    let report = service.wait(&execute_id).await.unwrap();

    assert_eq!(report.status, ExecutionStatus::Success);
    assert_eq!(
        report.output,
        Some(json!({
            "option": "B",
            "content": "blue",
            "red": null,
            "blue": "blue",
            "other": null
        }))
    );
}

#[tokio::test]
async fn unmatched_answers_take_the_default_port() {
    let service = service();
    let execute_id = start_run(&service, &colour_question_canvas()).await;
    let event_id = service.wait(&execute_id).await.unwrap().interrupts[0].id.clone();

    service
        .resume(&caller(), &execute_id, &event_id, json!("green"))
        .await
        .unwrap();
    let report = service.wait(&execute_id).await.unwrap();

    assert_eq!(report.status, ExecutionStatus::Success);
    assert_eq!(
        report.output,
        Some(json!({
            "option": "other",
            "content": "green",
            "red": null,
            "blue": null,
            "other": "other"
        }))
    );
}

/// Local tool answering GET with its query string. Returns the URL and a
/// call counter.
async fn echo_tool() -> (String, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let app = Router::new().route(
        "/echo",
        get(move |Query(query): Query<HashMap<String, String>>| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Json(query)
            }
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}/echo"), calls)
}

fn confirmed_tool_canvas(url: &str) -> Value {
    canvas(
        vec![
            start(json!([])),
            node(
                "tool",
                "plugin_call",
                json!({
                    "inputs": [lit("city", "string", json!("paris"))],
                    "config": { "method": "GET", "url": url, "requireConfirmation": true }
                }),
            ),
            end(json!([
                reference("confirmed", "boolean", "tool", "confirmed"),
                reference("status", "integer", "tool", "statusCode"),
                reference("body", "object", "tool", "body")
            ])),
        ],
        vec![edge("start", "tool"), edge("tool", "end")],
    )
}

#[tokio::test]
async fn confirmed_tool_calls_run_after_approval() {
    let (url, calls) = echo_tool().await;
    let service = service();
    let execute_id = start_run(&service, &confirmed_tool_canvas(&url)).await;
    let report = service.wait(&execute_id).await.unwrap();

    assert_eq!(report.interrupts.len(), 1);
    let event = &report.interrupts[0];
    assert_eq!(event.event_type, InterruptType::ToolConfirmation);
    assert_eq!(event.payload["method"], json!("GET"));
    assert_eq!(event.payload["arguments"], json!({ "city": "paris" }));
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    service
        .resume(&caller(), &execute_id, &event.id, json!({ "confirmed": true }))
        .await
        .unwrap();
    let report = service.wait(&execute_id).await.unwrap();

    assert_eq!(report.status, ExecutionStatus::Success);
    assert_eq!(
        report.output,
        Some(json!({ "confirmed": true, "status": 200, "body": { "city": "paris" } }))
    );
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn rejected_tool_calls_are_skipped() {
    let (url, calls) = echo_tool().await;
    let service = service();
    let execute_id = start_run(&service, &confirmed_tool_canvas(&url)).await;
    let event_id = service.wait(&execute_id).await.unwrap().interrupts[0].id.clone();

    service
        .resume(&caller(), &execute_id, &event_id, json!({ "confirmed": false }))
        .await
        .unwrap();
    let report = service.wait(&execute_id).await.unwrap();

    assert_eq!(report.status, ExecutionStatus::Success);
    assert_eq!(
        report.output,
        Some(json!({ "confirmed": false, "status": null, "body": null }))
    );
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn nested_sub_workflow_interrupts_resume_through_the_tree() {
    let service = service();

    let grandchild = draft(&service, "grandchild", &input_canvas()).await;
    publish(&service, &grandchild, "v1.0.0").await;

    let calling = |target: &str| {
        canvas(
            vec![
                start(json!([])),
                node(
                    "call",
                    "sub_workflow",
                    json!({
                        "outputs": [field("name", "string")],
                        "config": { "workflowId": target, "workflowVersion": "v1.0.0" }
                    }),
                ),
                end(json!([reference("name", "string", "call", "name")])),
            ],
            vec![edge("start", "call"), edge("call", "end")],
        )
    };
    let child = draft(&service, "child", &calling(grandchild.as_str())).await;
    publish(&service, &child, "v1.0.0").await;
    let execute_id = start_run(&service, &calling(child.as_str())).await;

    let report = service.wait(&execute_id).await.unwrap();
    assert_eq!(report.status, ExecutionStatus::Running);
    assert_eq!(report.interrupts.len(), 1);
    let event = report.interrupts[0].clone();
    let subs: Vec<&str> = event.address.sub_executions().collect();
    assert_eq!(subs.len(), 2);
    assert!(matches!(
        &event.address.segments[0],
        AddressSegment::SubExecution { node_id, .. } if node_id == "call"
    ));
    assert_eq!(event.execute_id, subs[1]);
    assert_eq!(event.root_execute_id, execute_id);

    // The child execution sees the grandchild's interrupt as its own.
    let child_process = service.get_process(&caller(), subs[0]).await.unwrap();
    assert_eq!(child_process.status, ExecutionStatus::Running);
    assert_eq!(child_process.node_events.len(), 1);

    let root = service
        .resume(&caller(), &event.execute_id, &event.id, json!({ "name": "deep" }))
        .await
        .unwrap();
    assert_eq!(root, execute_id);
    let report = service.wait(&root).await.unwrap();

    assert_eq!(report.status, ExecutionStatus::Success);
    assert_eq!(report.output, Some(json!({ "name": "deep" })));
    for sub in &subs {
        let process = service.get_process(&caller(), sub).await.unwrap();
        assert_eq!(process.status, ExecutionStatus::Success);
    }

    let schema = service
        .get_history_schema(&caller(), &execute_id, Some(subs[1]))
        .await
        .unwrap();
    assert_eq!(schema.workflow_id, grandchild);
}

#[tokio::test]
async fn cancelling_a_suspended_run_closes_it() {
    let service = service();
    let execute_id = start_run(&service, &input_canvas()).await;
    let event_id = service.wait(&execute_id).await.unwrap().interrupts[0].id.clone();

    let status = service.cancel(&caller(), &execute_id).await.unwrap();
    assert_eq!(status, ExecutionStatus::Cancelled);

    let process = service.get_process(&caller(), &execute_id).await.unwrap();
    assert_eq!(process.status, ExecutionStatus::Cancelled);
    assert!(process.node_events.is_empty());

    let err = service
        .resume(&caller(), &execute_id, &event_id, json!({ "name": "late" }))
        .await
        .unwrap_err();
    assert!(matches!(err, FlowError::NotFound(_)));
}

#[tokio::test]
async fn cancelling_a_finished_run_keeps_its_status() {
    let service = service();
    let canvas = canvas(
        vec![start(json!([])), end(json!([lit("ok", "boolean", json!(true))]))],
        vec![edge("start", "end")],
    );
    let execute_id = start_run(&service, &canvas).await;

    let status = service.cancel(&caller(), &execute_id).await.unwrap();

    assert_eq!(status, ExecutionStatus::Success);
}

#[tokio::test]
async fn synchronous_run_rejects_interrupting_workflows_before_executing() {
    let dir = tempfile::tempdir().unwrap();
    let service = service_with(
        Arc::new(JsonRepository::new(dir.path())),
        Arc::new(MemoryCheckpointStore::new()),
    );
    let id = draft(&service, "ask", &input_canvas()).await;
    publish(&service, &id, "v1.0.0").await;

    let err = service
        .openapi_run(&caller(), &id, OpenApiRun::default())
        .await
        .unwrap_err();

    assert!(matches!(err, FlowError::InterruptNotSupported));
    assert!(!dir.path().join("executions").exists());

    // Asynchronous runs may suspend.
    let started = service
        .openapi_run(
            &caller(),
            &id,
            OpenApiRun {
                is_async: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(started.status, ExecutionStatus::Running);
    let report = service.wait(&started.execute_id).await.unwrap();
    assert_eq!(report.interrupts.len(), 1);
}

#[tokio::test]
async fn synchronous_run_looks_through_sub_workflows() {
    let service = service();
    let asking = draft(&service, "asking", &input_canvas()).await;
    publish(&service, &asking, "v1.0.0").await;
    let caller_canvas = canvas(
        vec![
            start(json!([])),
            node("call", "sub_workflow", json!({ "config": { "workflowId": asking } })),
            end(json!([])),
        ],
        vec![edge("start", "call"), edge("call", "end")],
    );
    let id = draft(&service, "outer", &caller_canvas).await;
    publish(&service, &id, "v1.0.0").await;

    let err = service
        .openapi_run(&caller(), &id, OpenApiRun::default())
        .await
        .unwrap_err();

    assert!(matches!(err, FlowError::InterruptNotSupported));
}
