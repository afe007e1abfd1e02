//! Node handlers: the executable units of the workflow graph.
//!
//! A node receives a cloned state snapshot and an execution context, does
//! its work (for the five agent nodes, through the
//! [`AgentInvoker`](crate::invoker::AgentInvoker)), and returns a
//! [`StateUpdate`] patch. Nodes never mutate state in place and never write
//! to the event streams directly except through the context's emitter.
//!
//! Failure discipline: anything a node can recover from is expressed in its
//! returned update (a failed QA result, an abort action). A returned
//! [`NodeError`] is reserved for the cases the engine has an explicit policy
//! for — scope failure is terminal, planner failure becomes a synthetic
//! abort, budget failure joins the retry path.

pub mod assessor;
pub mod bookkeeping;
pub mod implementor;
pub mod planner;
pub mod qa;
pub mod report;
pub mod scope;

use async_trait::async_trait;
use miette::Diagnostic;
use thiserror::Error;

use crate::events::EventEmitter;
use crate::invoker::{BudgetError, InvokerError, StructuredInvokeError};
use crate::state::WorkflowState;
use crate::types::NodeName;
use crate::update::StateUpdate;

pub use assessor::AssessorNode;
pub use bookkeeping::{IncrementAttemptNode, MarkCompleteNode, MarkFailedNode};
pub use implementor::ImplementorNode;
pub use planner::TaskPlannerNode;
pub use qa::QaNode;
pub use report::ReportNode;
pub use scope::{ScopeAgentNode, ScopeError};

/// Execution context handed to a node for one run.
#[derive(Clone, Debug)]
pub struct NodeContext {
    /// The node being run.
    pub node: NodeName,
    /// Driver-loop step number, monotonically increasing.
    pub step: u64,
    /// Emitter attributed to this node.
    pub emitter: EventEmitter,
}

/// One executable workflow node.
#[async_trait]
pub trait NodeHandler: Send + Sync {
    async fn run(
        &self,
        snapshot: WorkflowState,
        ctx: NodeContext,
    ) -> Result<StateUpdate, NodeError>;
}

/// Failures a node surfaces to the engine for policy handling.
#[derive(Debug, Error, Diagnostic)]
pub enum NodeError {
    /// Terminal: the scope agent could not produce a usable scope.
    #[error(transparent)]
    #[diagnostic(transparent)]
    Scope(#[from] ScopeError),

    /// Converted by the engine into a synthetic abort.
    #[error(transparent)]
    #[diagnostic(transparent)]
    Planner(#[from] planner::PlannerError),

    /// Routed to the retry path (implementor/qa) or as an abort (planner).
    #[error(transparent)]
    #[diagnostic(transparent)]
    Budget(#[from] BudgetError),

    /// Unclassified node failure; the engine applies per-node policy.
    #[error("{node} failed: {message}")]
    #[diagnostic(code(gaffer::nodes::internal))]
    Internal { node: NodeName, message: String },
}

impl NodeError {
    /// Collapse an invoker error into the node-level taxonomy.
    pub(crate) fn from_invoker(node: NodeName, error: InvokerError) -> Self {
        match error {
            InvokerError::Budget(budget) => NodeError::Budget(budget),
            other => NodeError::Internal {
                node,
                message: other.to_string(),
            },
        }
    }

    pub(crate) fn from_structured(node: NodeName, error: StructuredInvokeError) -> Self {
        match error {
            StructuredInvokeError::Invoke(invoke) => Self::from_invoker(node, invoke),
            StructuredInvokeError::Normalise(normalise) => NodeError::Internal {
                node,
                message: normalise.to_string(),
            },
        }
    }
}
