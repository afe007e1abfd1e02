//! Plain-text rendering of events for console subscribers.
//!
//! Rendering lives here so sinks and the CLI agree on one format without
//! either owning it. Nothing in the engine depends on this module.

use crate::events::{Event, EventPayload, MessageKind, NodeLifecycle, TaskEvent, ToolLifecycle};

/// Render one event as a single display line (no trailing newline).
#[must_use]
pub fn render_line(event: &Event) -> String {
    let node = event.node.map(|n| n.as_str()).unwrap_or("engine");
    match &event.payload {
        EventPayload::Message { kind, text } => match kind {
            MessageKind::Thinking => format!("[{node}] · {text}"),
            MessageKind::Output => format!("[{node}] {text}"),
            MessageKind::ToolResult => format!("[{node}] ⇒ {text}"),
        },
        EventPayload::Task(task) => match task {
            TaskEvent::TaskStarted { description } => {
                format!("▶ task started: {description}")
            }
            TaskEvent::TaskCompleted {
                description,
                summary,
            } => format!("✓ task complete: {description} — {summary}"),
            TaskEvent::TaskFailed {
                description,
                reason,
            } => format!("✗ task failed: {description} — {reason}"),
            TaskEvent::MilestoneAdvanced { index, description } => {
                format!("◆ milestone {} active: {description}", index + 1)
            }
            TaskEvent::WorkflowEnded { status } => format!("■ workflow ended: {status}"),
        },
        EventPayload::Node(lifecycle) => match lifecycle {
            NodeLifecycle::Start => format!("[{node}] start"),
            NodeLifecycle::End { summary } if summary.is_empty() => format!("[{node}] end"),
            NodeLifecycle::End { summary } => format!("[{node}] end ({summary})"),
            NodeLifecycle::Error { error } => format!("[{node}] ERROR {error}"),
        },
        EventPayload::Tool(tool) => match tool {
            ToolLifecycle::Start { name, args } => format!("[{node}] {name}({args})"),
            ToolLifecycle::End { name, ok, .. } => {
                format!("[{node}] {name} {}", if *ok { "ok" } else { "failed" })
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{NodeName, Status};

    #[test]
    fn renders_each_stream() {
        let event = Event::new(
            Some(NodeName::Implementor),
            EventPayload::Tool(ToolLifecycle::Start {
                name: "write_file".into(),
                args: "{\"path\":\"a.rs\"}".into(),
            }),
        );
        assert!(render_line(&event).contains("write_file"));

        let event = Event::new(None, EventPayload::Task(TaskEvent::WorkflowEnded {
            status: Status::Complete,
        }));
        assert!(render_line(&event).contains("complete"));
    }
}
