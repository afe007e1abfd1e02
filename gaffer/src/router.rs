//! Pure routing functions over workflow state.
//!
//! Routing is a function of state and nothing else: no side channels, no
//! clocks, no randomness. Every function here takes a state reference and
//! returns a [`Next`], and applying a function twice to equal snapshots
//! yields the same outcome — which is what makes the event log replayable
//! and the graph statically checkable (every planner action and every
//! verdict has a routing arm; the compiler enforces the coverage).
//!
//! The graph admits exactly two cycles: the retry boundary
//! (`qa → increment_attempt → task_planner`) and the scope boundary
//! (`assessor → scope_agent` on major divergence). Termination is guaranteed
//! by the retry ledger and the engine's planner-round cap.
//!
//! ```text
//! scope_agent ──► task_planner ──► implementor ──► qa ──► mark_complete ──► assessor
//!      ▲              │   ▲                        │            │              │
//!      │              │   └──── increment_attempt ◄┘            │              │
//!      │              └──────────► mark_failed ─────────────────┴──────────────┤
//!      └────────────────────────────────────────────────────────────────── (divergence)
//! ```

use crate::state::WorkflowState;
use crate::types::{Next, NodeName, PlannerAction, Status, Verdict};

/// Dispatch: compute the successor of `node` given the current state.
#[must_use]
pub fn next(node: NodeName, state: &WorkflowState) -> Next {
    match node {
        NodeName::ScopeAgent => after_scope_agent(state),
        NodeName::TaskPlanner => after_task_planner(state),
        NodeName::Implementor => after_implementor(state),
        NodeName::Qa => after_qa(state),
        NodeName::Assessor => after_assessor(state),
        NodeName::MarkComplete => after_mark_complete(state),
        NodeName::MarkFailed => after_mark_failed(state),
        NodeName::IncrementAttempt => Next::Node(NodeName::TaskPlanner),
        NodeName::Report => Next::End,
    }
}

/// After scope: plan if there are milestones, otherwise report.
///
/// A re-plan that returns no remaining milestones means the remit is
/// already satisfied; the reporter still runs to produce the summary.
#[must_use]
pub fn after_scope_agent(state: &WorkflowState) -> Next {
    if state.status == Status::Failed {
        return Next::Node(NodeName::Report);
    }
    if state.milestones.is_empty() || state.active_milestone_index >= state.milestones.len() {
        Next::Node(NodeName::Report)
    } else {
        Next::Node(NodeName::TaskPlanner)
    }
}

/// After the planner: switch on its four-way action.
///
/// A missing action means the planner output could not be normalised; the
/// engine has already recorded a synthetic abort, so the defensive arm
/// routes the same way.
#[must_use]
pub fn after_task_planner(state: &WorkflowState) -> Next {
    match state.task_planner_action {
        Some(PlannerAction::Implement) => Next::Node(NodeName::Implementor),
        Some(PlannerAction::Skip) => Next::Node(NodeName::MarkComplete),
        Some(PlannerAction::Abort) | None => Next::Node(NodeName::MarkFailed),
        Some(PlannerAction::MilestoneDone) => Next::Node(NodeName::Assessor),
    }
}

/// The implementor always hands its output to QA.
#[must_use]
pub fn after_implementor(_state: &WorkflowState) -> Next {
    Next::Node(NodeName::Qa)
}

/// After QA: pass completes the task; a failure retries while the ledger
/// allows, then fails the task. A missing result is treated as a failure
/// with no retry budget consumed on its behalf.
#[must_use]
pub fn after_qa(state: &WorkflowState) -> Next {
    match &state.current_qa_result {
        Some(qa) if qa.passed => Next::Node(NodeName::MarkComplete),
        Some(_) if state.retry_available() => Next::Node(NodeName::IncrementAttempt),
        _ => Next::Node(NodeName::MarkFailed),
    }
}

/// After a completed task: pull the assessor forward when the periodic
/// cadence is due or urgency crossed the threshold; otherwise plan on.
#[must_use]
pub fn after_mark_complete(state: &WorkflowState) -> Next {
    if state.tasks_since_last_review >= state.review_interval || state.urgency >= 1.0 {
        Next::Node(NodeName::Assessor)
    } else {
        Next::Node(NodeName::TaskPlanner)
    }
}

/// A failed task always gets a strategic review.
#[must_use]
pub fn after_mark_failed(_state: &WorkflowState) -> Next {
    Next::Node(NodeName::Assessor)
}

/// After the assessor: switch on its verdict.
///
/// The assessor node itself advances the milestone index and flips status
/// to complete on the last milestone, so this function only reads.
#[must_use]
pub fn after_assessor(state: &WorkflowState) -> Next {
    if state.status.is_terminal() {
        return Next::Node(NodeName::Report);
    }
    match state.last_verdict {
        Some(Verdict::Aligned) | Some(Verdict::MinorDrift) | None => {
            Next::Node(NodeName::TaskPlanner)
        }
        Some(Verdict::MilestoneComplete) => {
            if state.active_milestone_index < state.milestones.len() {
                Next::Node(NodeName::TaskPlanner)
            } else {
                Next::Node(NodeName::Report)
            }
        }
        Some(Verdict::MajorDivergence) => Next::Node(NodeName::ScopeAgent),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{Milestone, QaResult};

    fn base_state() -> WorkflowState {
        let mut state = WorkflowState::new("req", ".");
        state.milestones = vec![Milestone::new("m1", ""), Milestone::new("m2", "")];
        state
    }

    #[test]
    fn scope_with_milestones_plans() {
        assert_eq!(
            after_scope_agent(&base_state()),
            Next::Node(NodeName::TaskPlanner)
        );
    }

    #[test]
    fn scope_without_milestones_reports() {
        let state = WorkflowState::new("req", ".");
        assert_eq!(after_scope_agent(&state), Next::Node(NodeName::Report));
    }

    #[test]
    fn planner_actions_route_four_ways() {
        let mut state = base_state();
        state.task_planner_action = Some(PlannerAction::Implement);
        assert_eq!(after_task_planner(&state), Next::Node(NodeName::Implementor));
        state.task_planner_action = Some(PlannerAction::Skip);
        assert_eq!(after_task_planner(&state), Next::Node(NodeName::MarkComplete));
        state.task_planner_action = Some(PlannerAction::Abort);
        assert_eq!(after_task_planner(&state), Next::Node(NodeName::MarkFailed));
        state.task_planner_action = Some(PlannerAction::MilestoneDone);
        assert_eq!(after_task_planner(&state), Next::Node(NodeName::Assessor));
    }

    #[test]
    fn qa_pass_completes() {
        let mut state = base_state();
        state.current_qa_result = Some(QaResult {
            passed: true,
            ..QaResult::default()
        });
        assert_eq!(after_qa(&state), Next::Node(NodeName::MarkComplete));
    }

    #[test]
    fn qa_fail_retries_until_budget_exhausted() {
        let mut state = base_state();
        state.current_qa_result = Some(QaResult::default());

        state.attempt_count = 0;
        assert_eq!(after_qa(&state), Next::Node(NodeName::IncrementAttempt));
        state.attempt_count = 1;
        assert_eq!(after_qa(&state), Next::Node(NodeName::IncrementAttempt));
        // Third failure: the initial attempt and both retries are spent.
        state.attempt_count = 2;
        assert_eq!(after_qa(&state), Next::Node(NodeName::MarkFailed));
    }

    #[test]
    fn review_cadence_and_urgency_pull_the_assessor() {
        let mut state = base_state();
        assert_eq!(after_mark_complete(&state), Next::Node(NodeName::TaskPlanner));
        state.tasks_since_last_review = 5;
        assert_eq!(after_mark_complete(&state), Next::Node(NodeName::Assessor));
        state.tasks_since_last_review = 1;
        state.urgency = 1.0;
        assert_eq!(after_mark_complete(&state), Next::Node(NodeName::Assessor));
    }

    #[test]
    fn assessor_verdicts_route_four_ways() {
        let mut state = base_state();
        state.last_verdict = Some(Verdict::Aligned);
        assert_eq!(after_assessor(&state), Next::Node(NodeName::TaskPlanner));
        state.last_verdict = Some(Verdict::MinorDrift);
        assert_eq!(after_assessor(&state), Next::Node(NodeName::TaskPlanner));
        state.last_verdict = Some(Verdict::MajorDivergence);
        assert_eq!(after_assessor(&state), Next::Node(NodeName::ScopeAgent));

        // Milestone advanced by the assessor node; next one exists.
        state.last_verdict = Some(Verdict::MilestoneComplete);
        state.active_milestone_index = 1;
        assert_eq!(after_assessor(&state), Next::Node(NodeName::TaskPlanner));

        // Terminal status wins over the verdict.
        state.status = Status::Complete;
        assert_eq!(after_assessor(&state), Next::Node(NodeName::Report));
    }

    #[test]
    fn report_ends_the_workflow() {
        assert_eq!(next(NodeName::Report, &base_state()), Next::End);
    }
}
