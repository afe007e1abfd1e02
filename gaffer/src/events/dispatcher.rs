//! Synchronous fan-out of events to per-stream subscribers.
//!
//! The [`StreamDispatcher`] keeps four independent subscriber lists, one per
//! [`StreamKind`]. Dispatch is synchronous and ordered *within* a stream:
//! subscribers see events in emission order, and the timestamps on one
//! stream never decrease. Across streams there is no ordering guarantee.
//!
//! Subscribers must never block the engine; a consumer that needs async
//! processing should subscribe through [`StreamDispatcher::subscribe_channel`]
//! and drain the returned channel at its own pace.
//!
//! Nodes and the invoker hold an [`EventEmitter`] — a cheap cloneable handle
//! onto the dispatcher.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;

use super::event::{Event, EventPayload, StreamKind};
use crate::types::NodeName;

type Callback = Box<dyn Fn(&Event) + Send + Sync>;

#[derive(Default)]
struct Stream {
    subscribers: Mutex<Vec<Callback>>,
    last_timestamp: Mutex<Option<DateTime<Utc>>>,
}

impl Stream {
    /// Stamp a monotonic timestamp and deliver to every subscriber in order.
    fn dispatch(&self, node: Option<NodeName>, payload: EventPayload) {
        let subscribers = self.subscribers.lock();
        let timestamp = {
            let mut last = self.last_timestamp.lock();
            let now = Utc::now();
            let stamped = match *last {
                Some(previous) if now < previous => previous,
                _ => now,
            };
            *last = Some(stamped);
            stamped
        };
        let event = Event {
            timestamp,
            node,
            payload,
        };
        for subscriber in subscribers.iter() {
            subscriber(&event);
        }
    }
}

/// Fan-out hub for the four workflow streams.
pub struct StreamDispatcher {
    messages: Stream,
    task: Stream,
    node: Stream,
    tool: Stream,
}

impl Default for StreamDispatcher {
    fn default() -> Self {
        Self {
            messages: Stream::default(),
            task: Stream::default(),
            node: Stream::default(),
            tool: Stream::default(),
        }
    }
}

impl StreamDispatcher {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn stream(&self, kind: StreamKind) -> &Stream {
        match kind {
            StreamKind::Messages => &self.messages,
            StreamKind::Task => &self.task,
            StreamKind::Node => &self.node,
            StreamKind::Tool => &self.tool,
        }
    }

    /// Subscribe a callback to the messages stream.
    pub fn subscribe_messages(&self, callback: impl Fn(&Event) + Send + Sync + 'static) {
        self.subscribe(StreamKind::Messages, callback);
    }

    /// Subscribe a callback to the task stream.
    pub fn subscribe_task(&self, callback: impl Fn(&Event) + Send + Sync + 'static) {
        self.subscribe(StreamKind::Task, callback);
    }

    /// Subscribe a callback to the node-lifecycle stream.
    pub fn subscribe_node(&self, callback: impl Fn(&Event) + Send + Sync + 'static) {
        self.subscribe(StreamKind::Node, callback);
    }

    /// Subscribe a callback to the tool stream.
    pub fn subscribe_tool(&self, callback: impl Fn(&Event) + Send + Sync + 'static) {
        self.subscribe(StreamKind::Tool, callback);
    }

    /// Subscribe a callback to an arbitrary stream.
    pub fn subscribe(&self, kind: StreamKind, callback: impl Fn(&Event) + Send + Sync + 'static) {
        self.stream(kind).subscribers.lock().push(Box::new(callback));
    }

    /// Channel-backed subscription for consumers that process asynchronously.
    ///
    /// Events are pushed into an unbounded channel at dispatch time; the
    /// receiver drains at its own pace without ever blocking the engine.
    #[must_use]
    pub fn subscribe_channel(&self, kind: StreamKind) -> flume::Receiver<Event> {
        let (tx, rx) = flume::unbounded();
        self.subscribe(kind, move |event| {
            // Receiver dropped means the consumer went away; nothing to do.
            let _ = tx.send(event.clone());
        });
        rx
    }

    /// Emit an event; the payload variant selects the stream.
    pub fn emit(&self, node: Option<NodeName>, payload: EventPayload) {
        self.stream(payload.stream()).dispatch(node, payload);
    }
}

/// Cloneable emitter handle given to nodes and the invoker.
#[derive(Clone)]
pub struct EventEmitter {
    dispatcher: Arc<StreamDispatcher>,
    node: Option<NodeName>,
}

impl EventEmitter {
    #[must_use]
    pub fn new(dispatcher: Arc<StreamDispatcher>) -> Self {
        Self {
            dispatcher,
            node: None,
        }
    }

    /// A copy of this emitter attributed to a specific node.
    #[must_use]
    pub fn for_node(&self, node: NodeName) -> Self {
        Self {
            dispatcher: Arc::clone(&self.dispatcher),
            node: Some(node),
        }
    }

    /// The node this emitter is attributed to, if any.
    #[must_use]
    pub fn node(&self) -> Option<NodeName> {
        self.node
    }

    pub fn emit(&self, payload: EventPayload) {
        self.dispatcher.emit(self.node, payload);
    }
}

impl std::fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventEmitter")
            .field("node", &self.node)
            .finish_non_exhaustive()
    }
}
