mod common;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tower::ServiceExt;

use canvasflow::api;
use canvasflow::error::codes;

use common::*;

fn app() -> Router {
    api::router(service(), 1024 * 1024)
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("x-space-id", SPACE)
        .header("x-user-id", "tester");
    let body = match body {
        Some(v) => {
            builder = builder.header("content-type", "application/json");
            Body::from(v.to_string())
        }
        None => Body::empty(),
    };
    let response = app.clone().oneshot(builder.body(body).unwrap()).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

#[tokio::test]
async fn health_needs_no_identity() {
    let response = app()
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn workflow_routes_require_a_space() {
    let response = app()
        .oneshot(Request::builder().uri("/workflows").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["code"], json!(codes::ERR_INVALID_PARAM));
}

#[tokio::test]
async fn create_save_publish_and_run() {
    let app = app();
    let (status, meta) = send(&app, "POST", "/workflows", Some(json!({ "name": "greeter" }))).await;
    assert_eq!(status, StatusCode::OK);
    let id = meta["id"].as_str().unwrap().to_string();

    let (_, info) = send(&app, "GET", &format!("/workflows/{id}"), None).await;
    assert_eq!(info["status"], "unpublished");
    assert_eq!(info["meta"]["name"], "greeter");

    let greeting = canvas(
        vec![
            start(json!([field("who", "string")])),
            end(json!([reference("who", "string", "start", "who")])),
        ],
        vec![edge("start", "end")],
    );
    let (status, saved) = send(&app, "PUT", &format!("/workflows/{id}/draft"), Some(greeting)).await;
    assert_eq!(status, StatusCode::OK);
    assert!(saved["commit_id"].is_string());

    let (status, published) = send(
        &app,
        "POST",
        &format!("/workflows/{id}/publish"),
        Some(json!({ "version": "v1.0.0" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(published["version"], "v1.0.0");

    let (status, result) = send(
        &app,
        "POST",
        &format!("/workflows/{id}/run"),
        Some(json!({ "input": { "who": "world" } })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(result["status"], "success");
    assert_eq!(result["output"], json!({ "who": "world" }));

    let execute_id = result["execute_id"].as_str().unwrap();
    let (status, process) = send(&app, "GET", &format!("/executions/{execute_id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(process["workflow_id"], json!(id));
}

#[tokio::test]
async fn validate_reports_issues_without_saving() {
    let app = app();
    let (status, body) = send(
        &app,
        "POST",
        "/validate",
        Some(canvas(vec![start(json!([]))], vec![])),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["valid"], false);
    assert!(!body["issues"].as_array().unwrap().is_empty());

    let (_, body) = send(&app, "GET", "/workflows", None).await;
    assert_eq!(body["total"], 0);
}

#[tokio::test]
async fn synchronous_run_of_an_interrupting_workflow_is_unprocessable() {
    let app = app();
    let (_, meta) = send(&app, "POST", "/workflows", Some(json!({ "name": "ask" }))).await;
    let id = meta["id"].as_str().unwrap().to_string();
    send(&app, "PUT", &format!("/workflows/{id}/draft"), Some(input_canvas())).await;
    send(
        &app,
        "POST",
        &format!("/workflows/{id}/publish"),
        Some(json!({ "version": "v1.0.0" })),
    )
    .await;

    let (status, body) = send(&app, "POST", &format!("/workflows/{id}/run"), Some(json!({}))).await;

    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["code"], json!(720_702_005));
}

#[tokio::test]
async fn unknown_executions_are_not_found() {
    let app = app();
    let (status, body) = send(&app, "GET", "/executions/nope", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], json!(codes::ERR_NOT_FOUND));
}

#[tokio::test]
async fn publishing_an_invalid_draft_returns_issues() {
    let app = app();
    let (_, meta) = send(&app, "POST", "/workflows", Some(json!({ "name": "bad" }))).await;
    let id = meta["id"].as_str().unwrap().to_string();
    send(
        &app,
        "PUT",
        &format!("/workflows/{id}/draft"),
        Some(canvas(vec![start(json!([]))], vec![])),
    )
    .await;

    let (status, body) = send(
        &app,
        "POST",
        &format!("/workflows/{id}/publish"),
        Some(json!({ "version": "v1.0.0" })),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], json!(codes::ERR_VALIDATION));
    assert!(!body["issues"].as_array().unwrap().is_empty());
}

/// `(event name, data)` for each frame of an SSE body.
fn sse_frames(body: &str) -> Vec<(String, Value)> {
    body.split("\n\n")
        .filter_map(|frame| {
            let mut name = None;
            let mut data = None;
            for line in frame.lines() {
                if let Some(v) = line.strip_prefix("event:") {
                    name = Some(v.trim_start().to_string());
                } else if let Some(v) = line.strip_prefix("data:") {
                    data = Some(serde_json::from_str(v.trim_start()).unwrap());
                }
            }
            Some((name?, data?))
        })
        .collect()
}

#[tokio::test]
async fn stream_run_emits_interrupt_then_done_frames() {
    let app = app();
    let (_, meta) = send(&app, "POST", "/workflows", Some(json!({ "name": "ask" }))).await;
    let id = meta["id"].as_str().unwrap().to_string();
    send(&app, "PUT", &format!("/workflows/{id}/draft"), Some(input_canvas())).await;
    send(
        &app,
        "POST",
        &format!("/workflows/{id}/publish"),
        Some(json!({ "version": "v1.0.0" })),
    )
    .await;

    let request = Request::builder()
        .method("POST")
        .uri(format!("/workflows/{id}/stream_run"))
        .header("x-space-id", SPACE)
        .header("x-user-id", "tester")
        .header("content-type", "application/json")
        .body(Body::from("{}"))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(
        response.headers()["content-type"]
            .to_str()
            .unwrap()
            .starts_with("text/event-stream")
    );
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let frames = sse_frames(std::str::from_utf8(&bytes).unwrap());

    for (i, (name, data)) in frames.iter().enumerate() {
        assert_eq!(data["event"], json!(name));
        assert_eq!(data["index"], json!(i));
    }

    let interrupts: Vec<&Value> = frames
        .iter()
        .filter(|(name, _)| name == "interrupt")
        .map(|(_, data)| data)
        .collect();
    assert_eq!(interrupts.len(), 1);
    assert_eq!(interrupts[0]["node_id"], "ask");
    assert_eq!(interrupts[0]["payload"]["prompt"], "Who are you?");
    assert!(interrupts[0]["id"].as_str().unwrap().contains(":ask#"));

    let (name, done) = frames.last().unwrap();
    assert_eq!(name, "done");
    assert_eq!(done["status"], "running");
}
