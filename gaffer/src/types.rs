//! Core identifier types for the gaffer workflow engine.
//!
//! This module defines the closed enumerations the router and engine are
//! built on: the node names of the workflow graph, the planner's four
//! actions, the assessor's four verdicts, and the terminal workflow status.
//! Routing is exhaustive pattern matching over these types; there is no
//! runtime type probing anywhere in the graph.
//!
//! # Key Types
//!
//! - [`NodeName`]: Identifies the nodes of the workflow graph
//! - [`Next`]: A routing outcome — another node, or the end of the workflow
//! - [`PlannerAction`]: The task planner's four-way decision
//! - [`Verdict`]: The assessor's four-way decision
//! - [`Status`]: Workflow lifecycle status
//!
//! # Examples
//!
//! ```rust
//! use gaffer::types::{NodeName, PlannerAction};
//!
//! let node = NodeName::TaskPlanner;
//! assert_eq!(node.as_str(), "task_planner");
//! assert_eq!(PlannerAction::MilestoneDone.as_str(), "milestone_done");
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies a node of the workflow graph.
///
/// The graph has five agent nodes (scope, planner, implementor, qa,
/// assessor), three bookkeeping nodes, and the terminal reporter. The set is
/// closed: the router maps every `(NodeName, state)` pair to a successor and
/// the engine refuses to run anything it does not know.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeName {
    /// Interprets the user request into a remit and milestones.
    ScopeAgent,
    /// Sliding-window planner: picks and plans exactly one task per round.
    TaskPlanner,
    /// Executes the current implementation plan with file tools.
    Implementor,
    /// Two-phase validation of the implementor's output.
    Qa,
    /// Periodic / escalated alignment review against the remit.
    Assessor,
    /// Folds the ephemeral task fields into a completed done-list entry.
    MarkComplete,
    /// Folds the ephemeral task fields into a failed done-list entry.
    MarkFailed,
    /// Consumes one retry and hands the QA feedback back to the planner.
    IncrementAttempt,
    /// Produces the final work report; always routes to the end.
    Report,
}

impl NodeName {
    /// All nodes, in rough execution order. Useful for registries and tests.
    pub const ALL: [NodeName; 9] = [
        NodeName::ScopeAgent,
        NodeName::TaskPlanner,
        NodeName::Implementor,
        NodeName::Qa,
        NodeName::Assessor,
        NodeName::MarkComplete,
        NodeName::MarkFailed,
        NodeName::IncrementAttempt,
        NodeName::Report,
    ];

    /// Stable snake_case name used in events, logs, and persisted payloads.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeName::ScopeAgent => "scope_agent",
            NodeName::TaskPlanner => "task_planner",
            NodeName::Implementor => "implementor",
            NodeName::Qa => "qa",
            NodeName::Assessor => "assessor",
            NodeName::MarkComplete => "mark_complete",
            NodeName::MarkFailed => "mark_failed",
            NodeName::IncrementAttempt => "increment_attempt",
            NodeName::Report => "report",
        }
    }

    /// Returns `true` for the five nodes that invoke an LLM.
    #[must_use]
    pub fn is_agent(&self) -> bool {
        matches!(
            self,
            NodeName::ScopeAgent
                | NodeName::TaskPlanner
                | NodeName::Implementor
                | NodeName::Qa
                | NodeName::Assessor
        )
    }
}

impl fmt::Display for NodeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Outcome of a routing decision.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Next {
    /// Continue with the named node.
    Node(NodeName),
    /// The workflow is finished; the engine returns after the reporter ran.
    End,
}

/// The task planner's decision for a round.
///
/// Exactly one action is produced per planner round. Anything the planner
/// emits that cannot be normalised to one of these four raises
/// a planner error, which the engine records as an abort.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlannerAction {
    /// A task was selected and a detailed plan written.
    Implement,
    /// The gap is already closed; record a no-op entry and move on.
    Skip,
    /// The task is infeasible within milestone scope; escalate.
    Abort,
    /// Every outcome of the active milestone is achieved.
    MilestoneDone,
}

impl PlannerAction {
    /// Parse the planner's textual action. Unknown strings are `None`.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "implement" => Some(PlannerAction::Implement),
            "skip" => Some(PlannerAction::Skip),
            "abort" => Some(PlannerAction::Abort),
            "milestone_done" => Some(PlannerAction::MilestoneDone),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            PlannerAction::Implement => "implement",
            PlannerAction::Skip => "skip",
            PlannerAction::Abort => "abort",
            PlannerAction::MilestoneDone => "milestone_done",
        }
    }
}

impl fmt::Display for PlannerAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The assessor's verdict on the work done since the last review.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// Work tracks the remit; continue planning.
    Aligned,
    /// Slightly off-track; a correction hint is set and the carry-forward
    /// is cleared so the planner re-derives it.
    MinorDrift,
    /// Fundamentally the wrong direction; route back to the scope agent.
    MajorDivergence,
    /// The active milestone's outcomes are all achieved.
    MilestoneComplete,
}

impl Verdict {
    /// Parse the assessor's textual verdict. Unknown strings are `None`.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "aligned" => Some(Verdict::Aligned),
            "minor_drift" => Some(Verdict::MinorDrift),
            "major_divergence" => Some(Verdict::MajorDivergence),
            "milestone_complete" => Some(Verdict::MilestoneComplete),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Aligned => "aligned",
            Verdict::MinorDrift => "minor_drift",
            Verdict::MajorDivergence => "major_divergence",
            Verdict::MilestoneComplete => "milestone_complete",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Workflow lifecycle status.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// The engine is still driving the graph.
    #[default]
    Running,
    /// The remit is satisfied; exit code 0.
    Complete,
    /// Scope unsatisfied, abort cascade, cancellation, or cap exhaustion.
    Failed,
}

impl Status {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Running => "running",
            Status::Complete => "complete",
            Status::Failed => "failed",
        }
    }

    /// Returns `true` once the workflow reached a terminal status.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Status::Running)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_names_are_stable() {
        for node in NodeName::ALL {
            let json = serde_json::to_string(&node).unwrap();
            assert_eq!(json, format!("\"{}\"", node.as_str()));
        }
    }

    #[test]
    fn planner_action_parse_round_trip() {
        for action in [
            PlannerAction::Implement,
            PlannerAction::Skip,
            PlannerAction::Abort,
            PlannerAction::MilestoneDone,
        ] {
            assert_eq!(PlannerAction::parse(action.as_str()), Some(action));
        }
        assert_eq!(PlannerAction::parse("retry"), None);
    }

    #[test]
    fn verdict_parse_is_case_insensitive() {
        assert_eq!(Verdict::parse("Minor_Drift"), Some(Verdict::MinorDrift));
        assert_eq!(Verdict::parse(" aligned "), Some(Verdict::Aligned));
        assert_eq!(Verdict::parse("unknown"), None);
    }

    #[test]
    fn agent_nodes_are_the_five_llm_nodes() {
        let agents: Vec<_> = NodeName::ALL.iter().filter(|n| n.is_agent()).collect();
        assert_eq!(agents.len(), 5);
    }
}
