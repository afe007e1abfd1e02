//! State ownership and reducer-based update application.
//!
//! The [`StateStore`] holds the one live [`WorkflowState`] record. Updates
//! arrive as [`StateUpdate`] patches and are applied by a fixed registry of
//! reducers, each owning one group of fields. After every apply the store
//! re-checks the structural invariants and *refuses* the update (restoring
//! the previous state) when a patch would violate them — a defective node
//! surfaces as a structured error, never as a corrupted record.
//!
//! Reducers are deliberately small and declarative: the store can report
//! which groups an update touched, which the engine forwards to the event
//! stream for observability.

use miette::Diagnostic;
use thiserror::Error;
use tracing::instrument;

use crate::state::{InvariantViolation, WorkflowState};
use crate::update::{StateUpdate, UrgencySignal};

/// A reducer folds one group of update fields into the state.
///
/// Implementations must be order-independent with respect to the other
/// groups; the registry applies them in a fixed sequence.
pub trait Reducer: Send + Sync {
    /// Stable group name, reported in apply results.
    fn name(&self) -> &'static str;
    /// Apply the relevant fields of `update`. Returns `true` on change.
    fn apply(&self, state: &mut WorkflowState, update: &StateUpdate) -> bool;
}

/// Errors raised when applying an update.
#[derive(Debug, Error, Diagnostic)]
pub enum StoreError {
    /// The patch would violate a structural invariant; it was not applied.
    #[error("update rejected: {violation}")]
    #[diagnostic(
        code(gaffer::store::invariant),
        help("The producing node returned an inconsistent patch; it is dropped and surfaced as a node failure.")
    )]
    Rejected {
        #[source]
        violation: InvariantViolation,
    },
}

struct ScopeReducer;
impl Reducer for ScopeReducer {
    fn name(&self) -> &'static str {
        "scope"
    }
    fn apply(&self, state: &mut WorkflowState, update: &StateUpdate) -> bool {
        let mut changed = false;
        if let Some(remit) = &update.remit {
            state.remit = remit.clone();
            changed = true;
        }
        if let Some(milestones) = &update.milestones {
            state.milestones = milestones.clone();
            changed = true;
        }
        if let Some(index) = update.active_milestone_index {
            state.active_milestone_index = index;
            changed = true;
        }
        changed
    }
}

struct WindowReducer;
impl Reducer for WindowReducer {
    fn name(&self) -> &'static str {
        "window"
    }
    fn apply(&self, state: &mut WorkflowState, update: &StateUpdate) -> bool {
        let mut changed = false;
        if let Some(entry) = &update.done_append {
            state.done_list.push(entry.clone());
            changed = true;
        }
        if let Some((index, rollup)) = &update.done_rollup {
            state.done_rollup.insert(*index, rollup.clone());
            changed = true;
        }
        if let Some(carry) = &update.carry_forward {
            state.carry_forward = carry.clone();
            changed = true;
        }
        changed
    }
}

struct TaskReducer;
impl Reducer for TaskReducer {
    fn name(&self) -> &'static str {
        "task"
    }
    fn apply(&self, state: &mut WorkflowState, update: &StateUpdate) -> bool {
        let mut changed = false;
        changed |= update
            .current_task_description
            .clone()
            .apply(&mut state.current_task_description);
        changed |= update
            .current_implementation_plan
            .clone()
            .apply(&mut state.current_implementation_plan);
        changed |= update
            .current_implementation_result
            .clone()
            .apply(&mut state.current_implementation_result);
        changed |= update
            .current_qa_result
            .clone()
            .apply(&mut state.current_qa_result);
        changed
    }
}

struct RoutingReducer;
impl Reducer for RoutingReducer {
    fn name(&self) -> &'static str {
        "routing"
    }
    fn apply(&self, state: &mut WorkflowState, update: &StateUpdate) -> bool {
        let mut changed = false;
        changed |= update
            .task_planner_action
            .clone()
            .apply(&mut state.task_planner_action);
        changed |= update
            .escalation_context
            .clone()
            .apply(&mut state.escalation_context);
        changed |= update
            .correction_hint
            .clone()
            .apply(&mut state.correction_hint);
        changed |= update
            .divergence_analysis
            .clone()
            .apply(&mut state.divergence_analysis);
        changed |= update.prior_work.clone().apply(&mut state.prior_work);
        changed |= update.last_verdict.clone().apply(&mut state.last_verdict);
        changed
    }
}

struct CounterReducer;
impl Reducer for CounterReducer {
    fn name(&self) -> &'static str {
        "counters"
    }
    fn apply(&self, state: &mut WorkflowState, update: &StateUpdate) -> bool {
        let mut changed = false;
        if let Some(value) = update.tasks_since_last_review {
            state.tasks_since_last_review = value;
            changed = true;
        }
        if let Some(value) = update.attempt_count {
            state.attempt_count = value;
            changed = true;
        }
        if let Some(signal) = update.urgency {
            state.urgency = match signal {
                UrgencySignal::Add(weight) => state.urgency + weight,
                UrgencySignal::Reset(floor) => floor,
            };
            changed = true;
        }
        if let Some(value) = update.milestone_aborts {
            state.milestone_aborts = value;
            changed = true;
        }
        if let Some(value) = update.planner_rounds {
            state.planner_rounds = value;
            changed = true;
        }
        changed
    }
}

struct DirectiveReducer;
impl Reducer for DirectiveReducer {
    fn name(&self) -> &'static str {
        "directives"
    }
    fn apply(&self, state: &mut WorkflowState, update: &StateUpdate) -> bool {
        let mut changed = false;
        if !update.push_directives.is_empty() {
            state.pending_directives.extend(update.push_directives.iter().cloned());
            changed = true;
        }
        if !update.consume_directives.is_empty() {
            let consumed: Vec<_> = update.consume_directives.clone();
            let mut remaining = Vec::with_capacity(state.pending_directives.len());
            for directive in state.pending_directives.drain(..) {
                if consumed.contains(&directive.id) {
                    state.directives_in_flight.push(directive);
                    changed = true;
                } else {
                    remaining.push(directive);
                }
            }
            state.pending_directives = remaining;
        }
        if update.drop_in_flight_directives && !state.directives_in_flight.is_empty() {
            state.directives_in_flight.clear();
            changed = true;
        }
        changed
    }
}

struct StatusReducer;
impl Reducer for StatusReducer {
    fn name(&self) -> &'static str {
        "status"
    }
    fn apply(&self, state: &mut WorkflowState, update: &StateUpdate) -> bool {
        let mut changed = false;
        if let Some(status) = update.status {
            state.status = status;
            changed = true;
        }
        changed |= update.error.clone().apply(&mut state.error);
        if let Some(report) = &update.work_report {
            state.work_report = Some(report.clone());
            changed = true;
        }
        changed
    }
}

/// Fixed registry of the declared reducers, applied in order.
pub struct ReducerRegistry {
    reducers: Vec<Box<dyn Reducer>>,
}

impl Default for ReducerRegistry {
    fn default() -> Self {
        Self {
            reducers: vec![
                Box::new(ScopeReducer),
                Box::new(WindowReducer),
                Box::new(TaskReducer),
                Box::new(RoutingReducer),
                Box::new(CounterReducer),
                Box::new(DirectiveReducer),
                Box::new(StatusReducer),
            ],
        }
    }
}

/// Holds the live workflow state and applies node updates.
pub struct StateStore {
    state: WorkflowState,
    registry: ReducerRegistry,
}

impl StateStore {
    pub fn new(state: WorkflowState) -> Self {
        Self {
            state,
            registry: ReducerRegistry::default(),
        }
    }

    /// Read-only view of the live state.
    #[must_use]
    pub fn state(&self) -> &WorkflowState {
        &self.state
    }

    /// Cloned snapshot safe to hand to nodes and subscribers.
    #[must_use]
    pub fn snapshot(&self) -> WorkflowState {
        self.state.clone()
    }

    /// Apply a patch through the reducer registry.
    ///
    /// Returns the names of the reducer groups that changed state. On an
    /// invariant violation the previous state is restored and the update is
    /// rejected.
    #[instrument(skip_all, fields(version = self.state.version))]
    pub fn apply(&mut self, update: StateUpdate) -> Result<Vec<&'static str>, StoreError> {
        let before = self.state.clone();
        let mut touched = Vec::new();
        for reducer in &self.registry.reducers {
            if reducer.apply(&mut self.state, &update) {
                touched.push(reducer.name());
            }
        }
        if let Err(violation) = self.state.check_invariants() {
            self.state = before;
            return Err(StoreError::Rejected { violation });
        }
        if !touched.is_empty() {
            self.state.version += 1;
        }
        Ok(touched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{Directive, DirectiveKind, DirectivePriority, Milestone, QaResult};
    use crate::types::Status;
    use crate::update::Field;

    fn directive(id: u64) -> Directive {
        Directive {
            id,
            kind: DirectiveKind::Functional,
            source: "supervisor".into(),
            description: format!("directive {id}"),
            rationale: String::new(),
            priority: DirectivePriority::Normal,
        }
    }

    #[test]
    fn apply_reports_touched_groups_and_bumps_version() {
        let mut store = StateStore::new(WorkflowState::new("req", "."));
        let touched = store
            .apply(StateUpdate {
                remit: Some("do the thing".into()),
                carry_forward: Some(vec!["first".into()]),
                ..StateUpdate::default()
            })
            .unwrap();
        assert_eq!(touched, vec!["scope", "window"]);
        assert_eq!(store.state().version, 1);
    }

    #[test]
    fn no_op_update_does_not_bump_version() {
        let mut store = StateStore::new(WorkflowState::new("req", "."));
        let touched = store.apply(StateUpdate::default()).unwrap();
        assert!(touched.is_empty());
        assert_eq!(store.state().version, 0);
    }

    #[test]
    fn invariant_violation_restores_previous_state() {
        let mut state = WorkflowState::new("req", ".");
        state.milestones = vec![Milestone::new("m1", "")];
        let mut store = StateStore::new(state);

        let err = store
            .apply(StateUpdate {
                active_milestone_index: Some(5),
                ..StateUpdate::default()
            })
            .unwrap_err();
        assert!(matches!(err, StoreError::Rejected { .. }));
        assert_eq!(store.state().active_milestone_index, 0);
        assert_eq!(store.state().version, 0);
    }

    #[test]
    fn directives_move_pending_to_in_flight_and_drop() {
        let mut store = StateStore::new(WorkflowState::new("req", "."));
        store
            .apply(StateUpdate {
                push_directives: vec![directive(1), directive(2)],
                ..StateUpdate::default()
            })
            .unwrap();

        store
            .apply(StateUpdate {
                consume_directives: vec![2],
                ..StateUpdate::default()
            })
            .unwrap();
        assert_eq!(store.state().pending_directives.len(), 1);
        assert_eq!(store.state().directives_in_flight.len(), 1);
        assert_eq!(store.state().directives_in_flight[0].id, 2);

        store
            .apply(StateUpdate {
                drop_in_flight_directives: true,
                ..StateUpdate::default()
            })
            .unwrap();
        assert!(store.state().directives_in_flight.is_empty());
        assert_eq!(store.state().pending_directives[0].id, 1);
    }

    #[test]
    fn ephemeral_clear_resets_task_fields() {
        let mut store = StateStore::new(WorkflowState::new("req", "."));
        store
            .apply(StateUpdate {
                current_task_description: Field::Set("task".into()),
                current_qa_result: Field::Set(QaResult::default()),
                ..StateUpdate::default()
            })
            .unwrap();
        store.apply(StateUpdate::clear_ephemeral()).unwrap();
        assert!(store.state().current_task_description.is_none());
        assert!(store.state().current_qa_result.is_none());
    }

    #[test]
    fn failed_update_sets_status_and_error() {
        let mut store = StateStore::new(WorkflowState::new("req", "."));
        store.apply(StateUpdate::failed("boom")).unwrap();
        assert_eq!(store.state().status, Status::Failed);
        assert_eq!(store.state().error.as_deref(), Some("boom"));
    }
}
