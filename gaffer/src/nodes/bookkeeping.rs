//! Bookkeeping nodes: deterministic task-boundary transitions.
//!
//! These three nodes never invoke a model. They fold the ephemeral task
//! fields into the monotonic done list (or preserve them across a retry),
//! keep the retry ledger honest, and emit the task-stream lifecycle events.

use async_trait::async_trait;
use chrono::Utc;
use tracing::info;

use super::{NodeContext, NodeError, NodeHandler};
use crate::events::{EventPayload, TaskEvent};
use crate::state::{
    clamp_chars, DoneEntry, WorkflowState, QA_FEEDBACK_MAX, RESULT_SUMMARY_MAX,
};
use crate::types::PlannerAction;
use crate::update::{Field, StateUpdate};

/// Fold the current task into a completed [`DoneEntry`] and clear the
/// ephemeral fields. Skipped rounds record a no-op entry so the planner
/// does not re-pick the same gap.
pub struct MarkCompleteNode;

#[async_trait]
impl NodeHandler for MarkCompleteNode {
    async fn run(
        &self,
        snapshot: WorkflowState,
        ctx: NodeContext,
    ) -> Result<StateUpdate, NodeError> {
        let skipped = snapshot.task_planner_action == Some(PlannerAction::Skip);
        let task_description = snapshot
            .current_task_description
            .clone()
            .unwrap_or_else(|| "Skipped (gap closed)".to_string());
        let result_summary = if skipped {
            "No work needed".to_string()
        } else {
            snapshot
                .current_implementation_result
                .as_ref()
                .map(|r| r.result_summary.clone())
                .unwrap_or_default()
        };
        let qa_feedback = snapshot
            .current_qa_result
            .as_ref()
            .map(|qa| qa.feedback.clone())
            .unwrap_or_default();

        let entry = DoneEntry {
            task_description: task_description.clone(),
            result_summary: clamp_chars(&result_summary, RESULT_SUMMARY_MAX),
            qa_feedback: clamp_chars(&qa_feedback, QA_FEEDBACK_MAX),
            milestone_index: snapshot.active_milestone_index,
            failed: false,
            when: Utc::now(),
        };
        ctx.emitter
            .emit(EventPayload::Task(TaskEvent::TaskCompleted {
                description: task_description,
                summary: entry.result_summary.clone(),
            }));
        info!(task = %entry.task_description, "task complete");

        let mut update = StateUpdate::clear_ephemeral();
        update.done_append = Some(entry);
        update.tasks_since_last_review = Some(snapshot.tasks_since_last_review + 1);
        update.attempt_count = Some(0);
        update.drop_in_flight_directives = true;
        Ok(update)
    }
}

/// Fold the current task into a failed [`DoneEntry`] with its escalation
/// context and clear the ephemeral fields.
pub struct MarkFailedNode;

#[async_trait]
impl NodeHandler for MarkFailedNode {
    async fn run(
        &self,
        snapshot: WorkflowState,
        ctx: NodeContext,
    ) -> Result<StateUpdate, NodeError> {
        let task_description = snapshot
            .current_task_description
            .clone()
            .unwrap_or_else(|| "Unplanned task".to_string());
        let reason = snapshot
            .escalation_context
            .clone()
            .or_else(|| {
                snapshot
                    .current_qa_result
                    .as_ref()
                    .map(|qa| qa.feedback.clone())
            })
            .unwrap_or_else(|| "task failed".to_string());

        let entry = DoneEntry {
            task_description: task_description.clone(),
            result_summary: clamp_chars(&format!("abandoned: {reason}"), RESULT_SUMMARY_MAX),
            qa_feedback: clamp_chars(&reason, QA_FEEDBACK_MAX),
            milestone_index: snapshot.active_milestone_index,
            failed: true,
            when: Utc::now(),
        };
        ctx.emitter.emit(EventPayload::Task(TaskEvent::TaskFailed {
            description: task_description,
            reason: entry.qa_feedback.clone(),
        }));
        info!(task = %entry.task_description, "task failed");

        let aborted = snapshot.task_planner_action == Some(PlannerAction::Abort);
        let mut update = StateUpdate::clear_ephemeral();
        update.done_append = Some(entry);
        update.attempt_count = Some(0);
        update.drop_in_flight_directives = true;
        // The assessor reads the escalation context before it is cleared at
        // the *next* task boundary; keep it through this one.
        update.escalation_context = Field::Keep;
        if aborted {
            update.milestone_aborts = Some(snapshot.milestone_aborts + 1);
        }
        Ok(update)
    }
}

/// Consume one retry: bump the attempt counter while preserving the plan
/// and the QA result for the planner's next round.
pub struct IncrementAttemptNode;

#[async_trait]
impl NodeHandler for IncrementAttemptNode {
    async fn run(
        &self,
        snapshot: WorkflowState,
        _ctx: NodeContext,
    ) -> Result<StateUpdate, NodeError> {
        // The router only sends us here while retries remain; the guard
        // keeps a defective route from overrunning the ledger.
        if !snapshot.retry_available() {
            return Ok(StateUpdate::default());
        }
        info!(
            attempt = snapshot.attempt_count + 1,
            max = snapshot.max_attempts,
            "consuming retry"
        );
        Ok(StateUpdate {
            attempt_count: Some(snapshot.attempt_count + 1),
            // Plan and QA result deliberately preserved; the implementation
            // result is stale and dropped.
            current_implementation_result: Field::Clear,
            ..StateUpdate::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventEmitter, StreamDispatcher, StreamKind};
    use crate::state::{ImplementationResult, QaResult};
    use crate::types::NodeName;

    fn ctx(node: NodeName) -> NodeContext {
        let dispatcher = StreamDispatcher::new();
        NodeContext {
            node,
            step: 1,
            emitter: EventEmitter::new(dispatcher).for_node(node),
        }
    }

    fn task_state() -> WorkflowState {
        let mut state = WorkflowState::new("req", ".");
        state.current_task_description = Some("wire titanium".into());
        state.current_implementation_plan = Some("plan".into());
        state.current_implementation_result = Some(ImplementationResult {
            files_modified: vec!["a.rs".into()],
            result_summary: "wired it".into(),
            issues: Vec::new(),
            success: true,
        });
        state.current_qa_result = Some(QaResult {
            passed: true,
            feedback: "looks right".into(),
            issues: Vec::new(),
        });
        state
    }

    #[tokio::test]
    async fn mark_complete_folds_and_clears() {
        let state = task_state();
        let update = MarkCompleteNode
            .run(state, ctx(NodeName::MarkComplete))
            .await
            .unwrap();
        let entry = update.done_append.unwrap();
        assert_eq!(entry.task_description, "wire titanium");
        assert_eq!(entry.result_summary, "wired it");
        assert!(!entry.failed);
        assert_eq!(update.tasks_since_last_review, Some(1));
        assert_eq!(update.attempt_count, Some(0));
        assert!(!update.current_qa_result.is_keep());
    }

    #[tokio::test]
    async fn mark_failed_records_escalation_and_counts_abort() {
        let mut state = task_state();
        state.task_planner_action = Some(crate::types::PlannerAction::Abort);
        state.escalation_context = Some("impossible within scope".into());
        let update = MarkFailedNode
            .run(state, ctx(NodeName::MarkFailed))
            .await
            .unwrap();
        let entry = update.done_append.unwrap();
        assert!(entry.failed);
        assert!(entry.qa_feedback.contains("impossible"));
        assert_eq!(update.milestone_aborts, Some(1));
    }

    #[tokio::test]
    async fn increment_preserves_plan_and_qa() {
        let mut state = task_state();
        state.attempt_count = 0;
        let update = IncrementAttemptNode
            .run(state, ctx(NodeName::IncrementAttempt))
            .await
            .unwrap();
        assert_eq!(update.attempt_count, Some(1));
        assert!(update.current_implementation_plan.is_keep());
        assert!(update.current_qa_result.is_keep());
        assert!(!update.current_implementation_result.is_keep());
    }

    #[tokio::test]
    async fn task_events_are_emitted() {
        let dispatcher = StreamDispatcher::new();
        let rx = dispatcher.subscribe_channel(StreamKind::Task);
        let context = NodeContext {
            node: NodeName::MarkComplete,
            step: 1,
            emitter: EventEmitter::new(dispatcher).for_node(NodeName::MarkComplete),
        };
        MarkCompleteNode.run(task_state(), context).await.unwrap();
        let event = rx.recv().unwrap();
        assert!(matches!(
            event.payload,
            EventPayload::Task(TaskEvent::TaskCompleted { .. })
        ));
    }
}
