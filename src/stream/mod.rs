//! Ordered progress stream for one run.
//!
//! The engine pushes [`Progress`] into an unbounded channel so dispatch never
//! waits on a slow consumer. A single emitter task numbers events and forwards
//! them over a bounded channel; backpressure lands on the transport side.

use std::collections::HashMap;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::canvas::NodeKind;
use crate::engine::interrupt::InterruptEvent;
use crate::engine::types::ExecutionStatus;

/// Engine-internal progress notification.
#[derive(Debug, Clone)]
pub enum Progress {
    Chunk {
        execute_id: String,
        node_id: String,
        node_type: NodeKind,
        node_title: String,
        content: String,
        is_finish: bool,
    },
    Interrupt(InterruptEvent),
    /// The run stopped: finished, failed, cancelled, or suspended.
    Finished {
        execute_id: String,
        status: ExecutionStatus,
        output: Option<Value>,
        error: Option<(i64, String)>,
        debug_url: String,
    },
}

/// Cheap cloneable handle the engine and providers write progress to.
#[derive(Debug, Clone, Default)]
pub struct ProgressSink(Option<mpsc::UnboundedSender<Progress>>);

impl ProgressSink {
    pub fn disabled() -> Self {
        Self(None)
    }

    pub fn new(tx: mpsc::UnboundedSender<Progress>) -> Self {
        Self(Some(tx))
    }

    pub fn is_enabled(&self) -> bool {
        self.0.is_some()
    }

    pub fn send(&self, progress: Progress) {
        if let Some(tx) = &self.0 {
            // A closed channel means nobody is listening anymore.
            let _ = tx.send(progress);
        }
    }
}

/// Events as seen by stream consumers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StreamEvent {
    Message {
        index: u64,
        execute_id: String,
        node_id: String,
        node_type: NodeKind,
        node_title: String,
        /// Per-node chunk sequence.
        seq: u64,
        content: String,
        is_finish: bool,
    },
    Interrupt {
        index: u64,
        #[serde(flatten)]
        interrupt: InterruptEvent,
    },
    Error {
        index: u64,
        execute_id: String,
        code: i64,
        msg: String,
        debug_url: String,
    },
    Done {
        index: u64,
        execute_id: String,
        status: ExecutionStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        output: Option<Value>,
        debug_url: String,
    },
}

impl StreamEvent {
    /// SSE event name.
    pub fn name(&self) -> &'static str {
        match self {
            StreamEvent::Message { .. } => "message",
            StreamEvent::Interrupt { .. } => "interrupt",
            StreamEvent::Error { .. } => "error",
            StreamEvent::Done { .. } => "done",
        }
    }

    pub fn index(&self) -> u64 {
        match self {
            StreamEvent::Message { index, .. }
            | StreamEvent::Interrupt { index, .. }
            | StreamEvent::Error { index, .. }
            | StreamEvent::Done { index, .. } => *index,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Error { .. } | StreamEvent::Done { .. })
    }
}

/// Numbers progress into stream events.
#[derive(Default)]
struct Sequencer {
    index: u64,
    seqs: HashMap<(String, String), u64>,
}

impl Sequencer {
    fn next(&mut self, progress: Progress) -> StreamEvent {
        let index = self.index;
        self.index += 1;
        match progress {
            Progress::Chunk {
                execute_id,
                node_id,
                node_type,
                node_title,
                content,
                is_finish,
            } => {
                let counter = self
                    .seqs
                    .entry((execute_id.clone(), node_id.clone()))
                    .or_insert(0);
                let seq = *counter;
                *counter += 1;
                StreamEvent::Message {
                    index,
                    execute_id,
                    node_id,
                    node_type,
                    node_title,
                    seq,
                    content,
                    is_finish,
                }
            }
            Progress::Interrupt(interrupt) => StreamEvent::Interrupt { index, interrupt },
            Progress::Finished {
                execute_id,
                status,
                output,
                error,
                debug_url,
            } => match error {
                Some((code, msg)) => StreamEvent::Error {
                    index,
                    execute_id,
                    code,
                    msg,
                    debug_url,
                },
                None => StreamEvent::Done {
                    index,
                    execute_id,
                    status,
                    output,
                    debug_url,
                },
            },
        }
    }
}

/// Start an emitter. Returns the engine-side sink and the consumer receiver.
/// The task ends after forwarding a terminal event or when either side closes.
pub fn spawn_emitter(buffer: usize) -> (ProgressSink, mpsc::Receiver<StreamEvent>, JoinHandle<()>) {
    let (progress_tx, mut progress_rx) = mpsc::unbounded_channel::<Progress>();
    let (event_tx, event_rx) = mpsc::channel::<StreamEvent>(buffer.max(1));

    let handle = tokio::spawn(async move {
        let mut sequencer = Sequencer::default();
        while let Some(progress) = progress_rx.recv().await {
            let event = sequencer.next(progress);
            let terminal = event.is_terminal();
            if event_tx.send(event).await.is_err() {
                debug!("Stream consumer went away");
                break;
            }
            if terminal {
                break;
            }
        }
    });

    (ProgressSink::new(progress_tx), event_rx, handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(node: &str, content: &str, is_finish: bool) -> Progress {
        Progress::Chunk {
            execute_id: "e".into(),
            node_id: node.into(),
            node_type: NodeKind::Message,
            node_title: node.into(),
            content: content.into(),
            is_finish,
        }
    }

    #[tokio::test]
    async fn assigns_index_and_per_node_seq() {
        let (sink, mut rx, handle) = spawn_emitter(2);
        sink.send(chunk("a", "he", false));
        sink.send(chunk("b", "x", true));
        sink.send(chunk("a", "llo", true));
        sink.send(Progress::Finished {
            execute_id: "e".into(),
            status: ExecutionStatus::Success,
            output: None,
            error: None,
            debug_url: "u".into(),
        });

        let mut events = Vec::new();
        while let Some(ev) = rx.recv().await {
            events.push(ev);
        }
        handle.await.unwrap();

        let indices: Vec<u64> = events.iter().map(StreamEvent::index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3]);
        match &events[2] {
            StreamEvent::Message { seq, is_finish, .. } => {
                assert_eq!(*seq, 1);
                assert!(*is_finish);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(events[3].name(), "done");
    }

    #[tokio::test]
    async fn failure_becomes_error_event() {
        let (sink, mut rx, _handle) = spawn_emitter(1);
        sink.send(Progress::Finished {
            execute_id: "e".into(),
            status: ExecutionStatus::Failed,
            output: None,
            error: Some((42, "boom".into())),
            debug_url: "u".into(),
        });
        let ev = rx.recv().await.unwrap();
        assert!(matches!(ev, StreamEvent::Error { code: 42, .. }));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn interrupt_events_keep_their_tag_and_fields() {
        use crate::engine::interrupt::{InterruptType, NodeAddress, event_id};

        let address = NodeAddress::new(Vec::new(), "ask");
        let interrupt = InterruptEvent {
            id: event_id("e", &address, 1),
            root_execute_id: "e".into(),
            execute_id: "e".into(),
            event_type: InterruptType::Input,
            node_id: "ask".into(),
            node_type: NodeKind::Input,
            node_title: "Ask".into(),
            payload: serde_json::json!({ "prompt": "name?" }),
            address,
            created_at: chrono::Utc::now(),
        };
        let (sink, mut rx, _handle) = spawn_emitter(1);
        sink.send(Progress::Interrupt(interrupt));

        let ev = rx.recv().await.unwrap();
        let encoded = serde_json::to_value(&ev).unwrap();
        assert_eq!(encoded["event"], "interrupt");
        assert_eq!(encoded["index"], 0);
        assert_eq!(encoded["id"], "e:ask#1");
        assert_eq!(encoded["node_id"], "ask");
        assert_eq!(encoded["payload"]["prompt"], "name?");
    }
}
