pub mod dispatcher;
pub mod event;

pub use dispatcher::{EventEmitter, StreamDispatcher};
pub use event::{
    classify_segments, Event, EventPayload, MessageKind, NodeLifecycle, StreamKind, TaskEvent,
    ToolLifecycle,
};
