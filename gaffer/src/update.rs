//! Partial state updates returned by node execution.
//!
//! Nodes never mutate [`WorkflowState`](crate::state::WorkflowState) in
//! place. Each node returns a [`StateUpdate`] describing only the fields it
//! wants to change; the [`StateStore`](crate::store::StateStore) applies the
//! patch through its reducer registry. This keeps intent explicit — an
//! update that says nothing about a field leaves it untouched — and lets the
//! store validate every transition in one place.
//!
//! Ephemeral fields need a third possibility besides "keep" and "set": the
//! bookkeeping nodes must *clear* them at task boundaries. [`Field`]
//! expresses that.

use crate::state::{
    Directive, DoneEntry, ImplementationResult, Milestone, MilestoneRollup, QaResult,
};
use crate::types::{PlannerAction, Status, Verdict};

/// A patch instruction for one optional state field.
#[derive(Clone, Debug, PartialEq)]
pub enum Field<T> {
    /// Leave the field as it is.
    Keep,
    /// Reset the field to `None`.
    Clear,
    /// Replace the field with a value.
    Set(T),
}

// Hand-written so `Field<T>: Default` does not demand `T: Default`.
impl<T> Default for Field<T> {
    fn default() -> Self {
        Field::Keep
    }
}

impl<T> Field<T> {
    /// Apply this instruction to the target slot. Returns `true` when the
    /// slot was touched.
    pub fn apply(self, slot: &mut Option<T>) -> bool {
        match self {
            Field::Keep => false,
            Field::Clear => {
                let changed = slot.is_some();
                *slot = None;
                changed
            }
            Field::Set(value) => {
                *slot = Some(value);
                true
            }
        }
    }

    #[must_use]
    pub fn is_keep(&self) -> bool {
        matches!(self, Field::Keep)
    }
}

impl<T> From<Option<T>> for Field<T> {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(v) => Field::Set(v),
            None => Field::Clear,
        }
    }
}

/// How an update touches the urgency accumulator.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum UrgencySignal {
    /// Add a failure-signal weight.
    Add(f32),
    /// Reset to a floor (0.0, or 0.5 after a minor-drift verdict).
    Reset(f32),
}

/// The patch a node returns after running.
///
/// All fields default to "no change". Construct with struct-update syntax:
///
/// ```rust
/// use gaffer::update::{Field, StateUpdate};
///
/// let update = StateUpdate {
///     carry_forward: Some(vec!["wire titanium into refinery".into()]),
///     correction_hint: Field::Clear,
///     ..StateUpdate::default()
/// };
/// assert!(update.remit.is_none());
/// ```
#[derive(Clone, Debug, Default)]
pub struct StateUpdate {
    // Scope
    pub remit: Option<String>,
    /// Full milestone list replacement (scope agent only).
    pub milestones: Option<Vec<Milestone>>,
    pub active_milestone_index: Option<usize>,

    // Sliding window
    /// Entry appended to the monotonic done list.
    pub done_append: Option<DoneEntry>,
    /// Replacement rollup for one milestone.
    pub done_rollup: Option<(usize, MilestoneRollup)>,
    pub carry_forward: Option<Vec<String>>,

    // Current task (ephemeral)
    pub current_task_description: Field<String>,
    pub current_implementation_plan: Field<String>,
    pub current_implementation_result: Field<ImplementationResult>,
    pub current_qa_result: Field<QaResult>,

    // Routing controls
    pub task_planner_action: Field<PlannerAction>,
    pub escalation_context: Field<String>,
    pub correction_hint: Field<String>,
    pub divergence_analysis: Field<String>,
    pub prior_work: Field<String>,
    pub last_verdict: Field<Verdict>,

    // Counters
    pub tasks_since_last_review: Option<u32>,
    pub attempt_count: Option<u32>,
    pub urgency: Option<UrgencySignal>,
    pub milestone_aborts: Option<u32>,
    pub planner_rounds: Option<u64>,

    // Directives
    /// New directives appended to the pending queue.
    pub push_directives: Vec<Directive>,
    /// Pending directive ids the planned task addresses; moved in-flight.
    pub consume_directives: Vec<u64>,
    /// Drop everything in flight (task boundary reached).
    pub drop_in_flight_directives: bool,

    // Status
    pub status: Option<Status>,
    pub error: Field<String>,
    pub work_report: Option<String>,
}

impl StateUpdate {
    /// An update that clears every ephemeral current-task field.
    ///
    /// Used by the bookkeeping nodes at task boundaries.
    #[must_use]
    pub fn clear_ephemeral() -> Self {
        Self {
            current_task_description: Field::Clear,
            current_implementation_plan: Field::Clear,
            current_implementation_result: Field::Clear,
            current_qa_result: Field::Clear,
            task_planner_action: Field::Clear,
            escalation_context: Field::Clear,
            ..Self::default()
        }
    }

    /// An update that marks the workflow failed with a reason.
    #[must_use]
    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            status: Some(Status::Failed),
            error: Field::Set(reason.into()),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_apply_semantics() {
        let mut slot = Some("old".to_string());
        assert!(!Field::<String>::Keep.apply(&mut slot));
        assert_eq!(slot.as_deref(), Some("old"));

        assert!(Field::<String>::Clear.apply(&mut slot));
        assert!(slot.is_none());
        assert!(!Field::<String>::Clear.apply(&mut slot));

        assert!(Field::Set("new".to_string()).apply(&mut slot));
        assert_eq!(slot.as_deref(), Some("new"));
    }

    #[test]
    fn clear_ephemeral_touches_only_task_fields() {
        let update = StateUpdate::clear_ephemeral();
        assert!(update.remit.is_none());
        assert!(update.status.is_none());
        assert!(!update.current_qa_result.is_keep());
        assert!(!update.task_planner_action.is_keep());
    }
}
