//! Console subscriber: renders the event streams to stdout.
//!
//! The console is a plain subscriber of the dispatcher — it holds no
//! reference into the engine and the engine knows nothing about it.
//! Task and node events always render; agent prose and tool chatter only
//! in verbose mode (thinking is dropped entirely otherwise).

use gaffer::events::{EventPayload, MessageKind, NodeLifecycle, StreamDispatcher};
use gaffer::telemetry::render_line;

pub fn attach(dispatcher: &StreamDispatcher, verbose: bool) {
    dispatcher.subscribe_task(|event| {
        println!("{}", render_line(event));
    });

    dispatcher.subscribe_node(move |event| {
        let interesting = match &event.payload {
            EventPayload::Node(NodeLifecycle::Error { .. }) => true,
            _ => verbose,
        };
        if interesting {
            println!("{}", render_line(event));
        }
    });

    if verbose {
        dispatcher.subscribe_messages(|event| {
            if !matches!(
                event.payload,
                EventPayload::Message {
                    kind: MessageKind::Thinking,
                    ..
                }
            ) {
                println!("{}", render_line(event));
            }
        });
        dispatcher.subscribe_tool(|event| {
            println!("{}", render_line(event));
        });
    }
}
