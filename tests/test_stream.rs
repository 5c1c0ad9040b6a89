mod common;

use serde_json::json;
use tokio::sync::mpsc::Receiver;

use canvasflow::engine::types::{ExecutionStatus, NodeStatus};
use canvasflow::stream::StreamEvent;

use common::*;

async fn drain(mut rx: Receiver<StreamEvent>) -> Vec<StreamEvent> {
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    events
}

fn llm_canvas() -> serde_json::Value {
    canvas(
        vec![
            start(json!([field("topic", "string")])),
            node(
                "llm",
                "llm",
                json!({
                    "inputs": [reference("prompt", "string", "start", "topic")],
                    "outputs": [field("output", "string")]
                }),
            ),
            end(json!([reference("output", "string", "llm", "output")])),
        ],
        vec![edge("start", "llm"), edge("llm", "end")],
    )
}

#[tokio::test]
async fn stream_carries_chunks_then_done() {
    let service = service();
    let id = draft(&service, "chat", &llm_canvas()).await;
    publish(&service, &id, "v1.0.0").await;

    let (execute_id, rx) = service
        .stream_run(&caller(), &id, object(json!({ "topic": "rust" })), None)
        .await
        .unwrap();
    let events = drain(rx).await;

    for (i, event) in events.iter().enumerate() {
        assert_eq!(event.index(), i as u64);
    }

    let chunks: Vec<(u64, &str, bool)> = events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::Message {
                node_id,
                seq,
                content,
                is_finish,
                ..
            } if node_id == "llm" => Some((*seq, content.as_str(), *is_finish)),
            _ => None,
        })
        .collect();
    assert_eq!(chunks, vec![(0, "echo: ", false), (1, "rust", true)]);

    match events.last().unwrap() {
        StreamEvent::Done {
            execute_id: done_id,
            status,
            output,
            ..
        } => {
            assert_eq!(done_id, &execute_id);
            assert_eq!(*status, ExecutionStatus::Success);
            assert_eq!(output, &Some(json!({ "output": "echo: rust" })));
        }
        other => panic!("expected done, got {other:?}"),
    }
    assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
}

#[tokio::test]
async fn suspended_streams_end_and_resume_on_a_new_stream() {
    let service = service();
    let id = draft(&service, "ask", &input_canvas()).await;
    publish(&service, &id, "v1.0.0").await;

    let (execute_id, rx) = service
        .stream_run(&caller(), &id, Default::default(), None)
        .await
        .unwrap();
    let events = drain(rx).await;

    let [.., StreamEvent::Interrupt { interrupt: event, .. }, StreamEvent::Done { status, .. }] = events.as_slice()
    else {
        panic!("expected interrupt then done, got {events:?}");
    };
    assert_eq!(*status, ExecutionStatus::Running);
    assert_eq!(event.node_id, "ask");
    assert_eq!(event.payload["prompt"], json!("Who are you?"));

    let rx = service
        .stream_resume(&caller(), &execute_id, &event.id, json!({ "name": "ada" }))
        .await
        .unwrap();
    let events = drain(rx).await;

    assert_eq!(events[0].index(), 0);
    match events.last().unwrap() {
        StreamEvent::Done { status, output, .. } => {
            assert_eq!(*status, ExecutionStatus::Success);
            assert_eq!(output, &Some(json!({ "name": "ada" })));
        }
        other => panic!("expected done, got {other:?}"),
    }
    assert!(!events.iter().any(|e| matches!(e, StreamEvent::Interrupt { .. })));
}

#[tokio::test]
async fn batch_interrupts_stream_before_the_wave_ends() {
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
            node("slow", "code", json!({ "config": { "sleepMs": 500 } })),
            end(json!([reference("answers", "list", "fan", "answers")])),
        ],
        vec![
            edge("start", "fan"),
            edge("start", "slow"),
            edge("fan", "end"),
            edge("slow", "end"),
        ],
    );
    let id = draft(&service, "fan", &canvas).await;
    publish(&service, &id, "v1.0.0").await;

    let (execute_id, mut rx) = service
        .stream_run(&caller(), &id, object(json!({ "topics": ["a"] })), None)
        .await
        .unwrap();
    let interrupt = loop {
        match rx.recv().await {
            Some(StreamEvent::Interrupt { interrupt, .. }) => break interrupt,
            Some(StreamEvent::Message { .. }) => continue,
            other => panic!("expected an interrupt, got {other:?}"),
        }
    };
    assert_eq!(interrupt.node_id, "ask");
    assert!(interrupt.id.contains("fan[0]/ask"));

    // The sibling node is still sleeping.
    let process = service.get_process(&caller(), &execute_id).await.unwrap();
    assert_eq!(process.status, ExecutionStatus::Running);
    assert!(process.node_events.iter().any(|e| e.id == interrupt.id));
    assert!(
        process
            .node_results
            .iter()
            .filter(|r| r.node_id == "slow")
            .all(|r| r.status == NodeStatus::Running)
    );

    let rest = drain(rx).await;
    assert!(!rest.iter().any(|e| matches!(e, StreamEvent::Interrupt { .. })));
    match rest.last().unwrap() {
        StreamEvent::Done { status, .. } => assert_eq!(*status, ExecutionStatus::Running),
        other => panic!("expected done, got {other:?}"),
    }

    let report = service.wait(&execute_id).await.unwrap();
    assert_eq!(report.interrupts.len(), 1);
    assert_eq!(report.interrupts[0].id, interrupt.id);
}
