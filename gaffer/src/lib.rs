//! ```text
//! user request ─► Engine ─► NodeHandler(role, state) ─► AgentInvoker ─► LLM + tools
//!                   │                                        │
//!                   │                                        └─► StreamDispatcher
//!                   │                                             (messages/task/node/tool)
//!                   ├─► StateStore.apply(StateUpdate) ─► reducers ─► WorkflowState
//!                   └─► Router.next(state) ─► next node | END ─► Reporter
//! ```
//!
//! Gaffer is an autonomous development-task orchestrator. Given a user
//! request and a working repository it drives a bounded multi-phase
//! workflow — interpret scope, execute code changes iteratively under a
//! sliding-window planner, validate each change, periodically re-assess
//! alignment with the original intent, and escalate on divergence — until
//! the declared scope is satisfied, abandoned, or exhausted.
//!
//! The crate is the workflow *engine*: the state machine composing five
//! agents into a self-correcting loop, the state model around it, and the
//! event streams exposing progress. LLM backends, the retrieval index, and
//! the console are external collaborators behind traits.

pub mod config;
pub mod engine;
pub mod events;
pub mod invoker;
pub mod nodes;
pub mod router;
pub mod state;
pub mod store;
pub mod telemetry;
pub mod tools;
pub mod types;
pub mod update;

pub use engine::{DirectiveQueue, Engine, EngineBuilder, EngineError};
pub use state::WorkflowState;
pub use types::{Next, NodeName, PlannerAction, Status, Verdict};
