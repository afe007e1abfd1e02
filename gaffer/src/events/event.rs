//! Typed events for the four workflow streams.
//!
//! Every event carries a timestamp, the emitting node (when there is one),
//! and a payload whose variant determines which stream it belongs to:
//!
//! - **messages** — free-form agent prose (thinking, output, tool results)
//! - **task** — task lifecycle: started, completed, failed, milestone moves
//! - **node** — node lifecycle: start, end, error, keyed on the outermost
//!   run only (nested LLM and tool invocations do not emit node events)
//! - **tool** — tool invocation start/end
//!
//! Payloads are serialisable so sinks can forward them over the wire.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::{NodeName, Status};

/// The four logical streams of the dispatcher.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    Messages,
    Task,
    Node,
    Tool,
}

impl StreamKind {
    pub const ALL: [StreamKind; 4] = [
        StreamKind::Messages,
        StreamKind::Task,
        StreamKind::Node,
        StreamKind::Tool,
    ];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamKind::Messages => "messages",
            StreamKind::Task => "task",
            StreamKind::Node => "node",
            StreamKind::Tool => "tool",
        }
    }
}

/// Classification of agent prose on the messages stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Model reasoning enclosed in think tags.
    Thinking,
    /// Final or intermediate answer text.
    Output,
    /// A tool result echoed back into the conversation.
    ToolResult,
}

/// Task-stream payloads.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskEvent {
    TaskStarted {
        description: String,
    },
    TaskCompleted {
        description: String,
        summary: String,
    },
    TaskFailed {
        description: String,
        reason: String,
    },
    MilestoneAdvanced {
        index: usize,
        description: String,
    },
    WorkflowEnded {
        status: Status,
    },
}

/// Node-stream payloads.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeLifecycle {
    Start,
    End { summary: String },
    Error { error: String },
}

/// Tool-stream payloads.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolLifecycle {
    Start {
        name: String,
        args: String,
    },
    End {
        name: String,
        output: String,
        ok: bool,
    },
}

/// Payload union; the variant decides the stream.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stream", rename_all = "snake_case")]
pub enum EventPayload {
    Message { kind: MessageKind, text: String },
    Task(TaskEvent),
    Node(NodeLifecycle),
    Tool(ToolLifecycle),
}

impl EventPayload {
    #[must_use]
    pub fn stream(&self) -> StreamKind {
        match self {
            EventPayload::Message { .. } => StreamKind::Messages,
            EventPayload::Task(_) => StreamKind::Task,
            EventPayload::Node(_) => StreamKind::Node,
            EventPayload::Tool(_) => StreamKind::Tool,
        }
    }
}

/// One event as delivered to subscribers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub timestamp: DateTime<Utc>,
    pub node: Option<NodeName>,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(node: Option<NodeName>, payload: EventPayload) -> Self {
        Self {
            timestamp: Utc::now(),
            node,
            payload,
        }
    }

    #[must_use]
    pub fn stream(&self) -> StreamKind {
        self.payload.stream()
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let node = self
            .node
            .map(|n| n.as_str())
            .unwrap_or("engine");
        match &self.payload {
            EventPayload::Message { kind, text } => {
                let tag = match kind {
                    MessageKind::Thinking => "think",
                    MessageKind::Output => "out",
                    MessageKind::ToolResult => "tool",
                };
                write!(f, "[{node}/{tag}] {text}")
            }
            EventPayload::Task(task) => write!(f, "[{node}/task] {task:?}"),
            EventPayload::Node(lifecycle) => write!(f, "[{node}/node] {lifecycle:?}"),
            EventPayload::Tool(tool) => write!(f, "[{node}/tool] {tool:?}"),
        }
    }
}

/// Split raw model output into classified segments.
///
/// Thinking-mode models interleave reasoning inside `<think>…</think>`
/// blocks with the answer text. Subscribers want them apart: verbose
/// consoles show the reasoning dimmed, quiet ones drop it entirely.
/// Unterminated think blocks classify the remainder as thinking.
#[must_use]
pub fn classify_segments(raw: &str) -> Vec<(MessageKind, String)> {
    const OPEN: &str = "<think>";
    const CLOSE: &str = "</think>";

    let mut segments = Vec::new();
    let mut rest = raw;
    loop {
        match rest.find(OPEN) {
            None => {
                if !rest.trim().is_empty() {
                    segments.push((MessageKind::Output, rest.trim().to_string()));
                }
                break;
            }
            Some(open_at) => {
                let before = &rest[..open_at];
                if !before.trim().is_empty() {
                    segments.push((MessageKind::Output, before.trim().to_string()));
                }
                let after_open = &rest[open_at + OPEN.len()..];
                match after_open.find(CLOSE) {
                    None => {
                        if !after_open.trim().is_empty() {
                            segments.push((MessageKind::Thinking, after_open.trim().to_string()));
                        }
                        break;
                    }
                    Some(close_at) => {
                        let inner = &after_open[..close_at];
                        if !inner.trim().is_empty() {
                            segments.push((MessageKind::Thinking, inner.trim().to_string()));
                        }
                        rest = &after_open[close_at + CLOSE.len()..];
                    }
                }
            }
        }
    }
    segments
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_variant_decides_stream() {
        let event = Event::new(
            Some(NodeName::Qa),
            EventPayload::Node(NodeLifecycle::Start),
        );
        assert_eq!(event.stream(), StreamKind::Node);
    }

    #[test]
    fn classify_splits_think_blocks() {
        let raw = "<think>planning the edit</think>Here is the change.";
        let segments = classify_segments(raw);
        assert_eq!(
            segments,
            vec![
                (MessageKind::Thinking, "planning the edit".to_string()),
                (MessageKind::Output, "Here is the change.".to_string()),
            ]
        );
    }

    #[test]
    fn classify_handles_unterminated_think() {
        let segments = classify_segments("prefix <think>still going");
        assert_eq!(segments[0], (MessageKind::Output, "prefix".to_string()));
        assert_eq!(
            segments[1],
            (MessageKind::Thinking, "still going".to_string())
        );
    }

    #[test]
    fn classify_plain_text_is_output() {
        let segments = classify_segments("just an answer");
        assert_eq!(segments, vec![(MessageKind::Output, "just an answer".to_string())]);
    }
}
