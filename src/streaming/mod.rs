//! SSE event stream for `/api/chat/stream`.
//!
//! One unbounded queue carries the whole workflow lifecycle -
//! `workflow_start`, one `step_start`/`step_end` pair per graph node, and a
//! terminal `workflow_end`/`workflow_error` - exactly mirroring the
//! producer-thread-plus-queue shape the service used before this port: a
//! background task drives the graph and pushes lifecycle items, the request
//! handler only translates items already computed into SSE text as it reads
//! them off the queue. The channel closing ends the stream; no explicit
//! sentinel item is needed.

use std::convert::Infallible;
use std::time::Duration;

use axum::response::sse::Event;
use chrono::Utc;
use futures::stream::{self, Stream};
use serde::Serialize;
use serde_json::json;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::graph::StepEvent;
use crate::http::handlers::chat::ChatResponseData;

/// How long to wait for a queue item before emitting a heartbeat comment.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(800);

/// Width of the leading SSE comment line, padding the response past common
/// proxy/middleware small-write buffering thresholds.
pub const PRELUDE_PADDING_CHARS: usize = 2048;

const WORKFLOW_START_MESSAGE: &str = "工作流已启动";
const WORKFLOW_END_MESSAGE: &str = "工作流已完成";
const WORKFLOW_ERROR_MESSAGE: &str = "工作流执行失败，请稍后重试。";

fn step_message(step: &str, status: &str) -> String {
    match status {
        "start" => format!("{step}步骤开始执行"),
        _ => format!("{step}步骤执行完成"),
    }
}

fn step_error_message(step: &str) -> String {
    format!("{step}步骤执行异常，系统已终止本次处理。")
}

/// One lifecycle item pushed onto the queue by the graph-running task.
pub enum StreamItem {
    WorkflowStart,
    Step(StepEvent),
    WorkflowEnd(ChatResponseData),
    WorkflowError(String),
}

/// Returns a sender for lifecycle items and the stream that reads them.
///
/// The caller spawns a task that sends `WorkflowStart`, forwards the
/// graph's [`StepEvent`]s as they arrive, and finally sends exactly one of
/// `WorkflowEnd`/`WorkflowError`, then drops the sender.
pub fn channel() -> (UnboundedSender<StreamItem>, UnboundedReceiver<StreamItem>) {
    mpsc::unbounded_channel()
}

#[derive(Serialize)]
struct EventPayload<'a> {
    session_id: &'a str,
    step: &'a str,
    status: &'a str,
    message: String,
    timestamp: String,
    seq: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<&'a ChatResponseData>,
}

fn build_event(session_id: &str, seq: u64, item: StreamItem) -> Event {
    let timestamp = Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true);

    let (event_name, step, status, message, result) = match &item {
        StreamItem::WorkflowStart => ("workflow_start", "workflow", "start", WORKFLOW_START_MESSAGE.to_string(), None),
        StreamItem::Step(StepEvent::Start { step }) => ("step_start", *step, "start", step_message(step, "start"), None),
        StreamItem::Step(StepEvent::End { step }) => ("step_end", *step, "end", step_message(step, "end"), None),
        StreamItem::Step(StepEvent::Error { step, .. }) => ("step_end", *step, "error", step_error_message(step), None),
        StreamItem::WorkflowEnd(data) => ("workflow_end", "workflow", "end", WORKFLOW_END_MESSAGE.to_string(), Some(data)),
        StreamItem::WorkflowError(_) => ("workflow_error", "workflow", "error", WORKFLOW_ERROR_MESSAGE.to_string(), None),
    };

    let payload = EventPayload {
        session_id,
        step,
        status,
        message,
        timestamp,
        seq,
        result,
    };

    Event::default()
        .event(event_name)
        .data(serde_json::to_string(&json!(payload)).unwrap_or_default())
}

/// Builds the full SSE body: a padding comment, then one event per queue
/// item, with a heartbeat comment whenever the queue is idle past
/// [`HEARTBEAT_INTERVAL`]. Ends when the queue's sender is dropped.
pub fn event_stream(
    session_id: String,
    rx: UnboundedReceiver<StreamItem>,
) -> impl Stream<Item = Result<Event, Infallible>> {
    let prelude = stream::once(futures::future::ready(Ok(Event::default().comment(
        " ".repeat(PRELUDE_PADDING_CHARS),
    ))));

    let body = stream::unfold((rx, session_id, 0u64), |(mut rx, session_id, seq)| async move {
        loop {
            match tokio::time::timeout(HEARTBEAT_INTERVAL, rx.recv()).await {
                Ok(Some(item)) => {
                    let next_seq = seq + 1;
                    let event = build_event(&session_id, next_seq, item);
                    return Some((Ok(event), (rx, session_id, next_seq)));
                }
                Ok(None) => return None,
                Err(_elapsed) => {
                    return Some((Ok(Event::default().comment("heartbeat")), (rx, session_id, seq)));
                }
            }
        }
    });

    prelude.chain(body)
}
