//! Property tests over the pure routing functions.
//!
//! Strategy: generate random states satisfying the structural invariants,
//! run every router function, and assert the outcome is a valid successor
//! and the state (which routing may not touch) still satisfies the
//! invariants. Determinism is asserted by double application.

use proptest::prelude::*;

use gaffer::router;
use gaffer::state::{Milestone, QaResult, WorkflowState};
use gaffer::types::{Next, NodeName, PlannerAction, Status, Verdict};

fn planner_action_strategy() -> impl Strategy<Value = Option<PlannerAction>> {
    prop_oneof![
        Just(None),
        Just(Some(PlannerAction::Implement)),
        Just(Some(PlannerAction::Skip)),
        Just(Some(PlannerAction::Abort)),
        Just(Some(PlannerAction::MilestoneDone)),
    ]
}

fn verdict_strategy() -> impl Strategy<Value = Option<Verdict>> {
    prop_oneof![
        Just(None),
        Just(Some(Verdict::Aligned)),
        Just(Some(Verdict::MinorDrift)),
        Just(Some(Verdict::MajorDivergence)),
        Just(Some(Verdict::MilestoneComplete)),
    ]
}

fn qa_strategy() -> impl Strategy<Value = Option<QaResult>> {
    prop_oneof![
        Just(None),
        any::<bool>().prop_map(|passed| Some(QaResult {
            passed,
            feedback: "feedback".into(),
            issues: Vec::new(),
        })),
    ]
}

fn status_strategy() -> impl Strategy<Value = Status> {
    prop_oneof![
        Just(Status::Running),
        Just(Status::Complete),
        Just(Status::Failed),
    ]
}

prop_compose! {
    /// A random state that satisfies the structural invariants.
    fn arb_state()(
        milestone_count in 1usize..6,
        index_seed in 0usize..6,
        action in planner_action_strategy(),
        verdict in verdict_strategy(),
        qa in qa_strategy(),
        status in status_strategy(),
        tasks_since in 0u32..12,
        review_interval in 1u32..8,
        attempts in 0u32..3,
        urgency in 0.0f32..2.0,
    ) -> WorkflowState {
        let mut state = WorkflowState::new("prop request", ".");
        state.milestones = (0..milestone_count)
            .map(|i| Milestone::new(format!("outcome {i}"), ""))
            .collect();
        state.active_milestone_index = if status == Status::Running {
            index_seed % milestone_count
        } else {
            index_seed
        };
        state.task_planner_action = action;
        state.last_verdict = verdict;
        state.current_qa_result = qa;
        state.status = status;
        state.tasks_since_last_review = tasks_since;
        state.review_interval = review_interval;
        state.max_attempts = 3;
        state.attempt_count = attempts;
        state.urgency = urgency;
        state
    }
}

proptest! {
    #[test]
    fn every_router_outcome_is_a_valid_successor(state in arb_state()) {
        prop_assert!(state.check_invariants().is_ok());
        for node in NodeName::ALL {
            match router::next(node, &state) {
                Next::Node(successor) => {
                    prop_assert!(NodeName::ALL.contains(&successor));
                }
                Next::End => {
                    // Only the reporter may end the workflow.
                    prop_assert_eq!(node, NodeName::Report);
                }
            }
        }
        // Routing is read-only; the invariants still hold.
        prop_assert!(state.check_invariants().is_ok());
    }

    #[test]
    fn routing_is_deterministic(state in arb_state()) {
        for node in NodeName::ALL {
            prop_assert_eq!(router::next(node, &state), router::next(node, &state));
        }
    }

    #[test]
    fn qa_routing_respects_the_retry_ledger(state in arb_state()) {
        match router::next(NodeName::Qa, &state) {
            Next::Node(NodeName::MarkComplete) => {
                prop_assert!(state.current_qa_result.as_ref().is_some_and(|qa| qa.passed));
            }
            Next::Node(NodeName::IncrementAttempt) => {
                prop_assert!(state.attempt_count + 1 < state.max_attempts);
            }
            Next::Node(NodeName::MarkFailed) => {}
            other => prop_assert!(false, "unexpected qa successor: {other:?}"),
        }
    }

    #[test]
    fn planner_actions_all_have_routing_arms(state in arb_state()) {
        let successor = router::next(NodeName::TaskPlanner, &state);
        let expected = match state.task_planner_action {
            Some(PlannerAction::Implement) => NodeName::Implementor,
            Some(PlannerAction::Skip) => NodeName::MarkComplete,
            Some(PlannerAction::Abort) | None => NodeName::MarkFailed,
            Some(PlannerAction::MilestoneDone) => NodeName::Assessor,
        };
        prop_assert_eq!(successor, Next::Node(expected));
    }

    #[test]
    fn review_trigger_is_cadence_or_urgency(state in arb_state()) {
        let successor = router::next(NodeName::MarkComplete, &state);
        let due = state.tasks_since_last_review >= state.review_interval
            || state.urgency >= 1.0;
        let expected = if due { NodeName::Assessor } else { NodeName::TaskPlanner };
        prop_assert_eq!(successor, Next::Node(expected));
    }
}
