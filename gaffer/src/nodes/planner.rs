//! Task planner: the sliding-window core of the engine.
//!
//! Every round the planner re-derives its lookahead from current knowledge
//! and commits to exactly one of four actions. Its context is bounded
//! regardless of milestone size: a rollup paragraph covers everything older
//! than the done-list window, the carry-forward holds at most ten rough
//! sketches, and only the task being executed *now* gets a detailed plan.
//!
//! Round shape:
//!
//! 1. Mechanically fold over-window done entries into the milestone rollup
//!    (summariser role; hard truncation when the summariser fails).
//! 2. Build the windowed prompt: milestone, rollup + recent entries,
//!    carry-forward, retry feedback, correction hint, ordered directives.
//! 3. Invoke, normalise, and map the action:
//!    - `implement` with a too-thin plan is demoted to `skip` (the original
//!      behaviour for sub-100-char plans);
//!    - `abort` carries escalation context and a full urgency point;
//!    - carry-forward churn above half the items adds urgency.

use async_trait::async_trait;
use miette::Diagnostic;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

use super::{NodeContext, NodeError, NodeHandler};
use crate::events::{EventPayload, TaskEvent};
use crate::invoker::normaliser::{FieldSpec, Schema};
use crate::invoker::{AgentInvoker, AgentRequest, Role, StructuredInvokeError};
use crate::state::{
    clamp_chars, Directive, DirectiveKind, DirectivePriority, MilestoneRollup, WorkflowState,
    CARRY_ITEM_MAX, CARRY_MAX, DONE_WINDOW,
};
use crate::tools::Tool;
use crate::types::{NodeName, PlannerAction};
use crate::update::{Field, StateUpdate, UrgencySignal};

/// Minimum characters a plan must have for `implement` to stand.
const MIN_PLAN_CHARS: usize = 100;
/// Character budget for a milestone rollup paragraph.
const ROLLUP_MAX_CHARS: usize = 700;
/// Urgency added when more than half the carry-forward changed in a round.
const CHURN_URGENCY: f32 = 0.2;
/// Urgency added by an abort; crosses the review threshold on its own.
const ABORT_URGENCY: f32 = 1.0;

/// The planner output could not be normalised to one of the four actions.
#[derive(Debug, Error, Diagnostic)]
pub enum PlannerError {
    #[error("planner output had no recognisable action (got `{got}`)")]
    #[diagnostic(
        code(gaffer::planner::bad_action),
        help("Expected one of implement, skip, abort, milestone_done.")
    )]
    BadAction { got: String },

    #[error("planner invocation failed: {message}")]
    #[diagnostic(code(gaffer::planner::invoke))]
    Invoke { message: String },
}

const PLANNER_SYSTEM_PROMPT: &str = "\
You are the task planning agent for a software development project. You work \
within one milestone using a sliding window: think a few steps ahead, pick \
one bite-sized chunk, and produce a detailed plan for it.

ACTIONS (choose exactly one per round)
- implement: you selected a task. Output task_description and a detailed \
implementation_plan with concrete file paths, code snippets, and locations.
- skip: the gap is already closed; no work needed this round.
- abort: the task is infeasible within milestone scope. Explain in \
escalation_context.
- milestone_done: every user outcome of this milestone is achieved.

PROCESS PER ROUND
1. Review the milestone scope, the done list, and the carry-forward.
2. Research with the tools when unsure; verify, do not guess.
3. Re-derive the carry-forward: keep, modify, drop, or add items. No item \
survives unchanged without being reconsidered. Items stay under 100 chars.
4. Pick the next cohesive chunk and, for implement, write the full plan.

RETRY ROUNDS
When QA feedback is present, address it first: re-research, adjust the \
plan, or abort if the approach is fundamentally wrong.

DIRECTIVES
Supervisory directives are listed in priority order. Critical ones must be \
addressed before anything else. When a directive contradicts a \
carry-forward item, the directive wins: drop the contradicted item. List \
the ids of directives your chosen task addresses in addressed_directives.

OUTPUT
One JSON object:
{\"action\": \"implement|skip|abort|milestone_done\", \"task_description\": \
\"...\", \"implementation_plan\": \"...\", \"carry_forward\": [\"...\"], \
\"escalation_context\": \"...\", \"addressed_directives\": [1]}";

fn planner_schema() -> Schema {
    Schema {
        name: "planner_output",
        fields: vec![
            FieldSpec::required_str("action", 40),
            FieldSpec::optional_str("task_description", 500),
            // The plan is the one deliberately unbounded field; it is the
            // detailed work order for the implementor.
            FieldSpec {
                name: "implementation_plan",
                kind: crate::invoker::normaliser::FieldKind::Str,
                required: false,
                max_len: None,
                default: Some(Value::String(String::new())),
            },
            FieldSpec::str_list("carry_forward", CARRY_ITEM_MAX),
            FieldSpec::optional_str("escalation_context", 500),
            FieldSpec::list("addressed_directives"),
        ],
    }
}

/// The task planner node.
pub struct TaskPlannerNode {
    invoker: Arc<AgentInvoker>,
    tools: Vec<Arc<dyn Tool>>,
    budget_tokens: usize,
}

impl TaskPlannerNode {
    pub fn new(
        invoker: Arc<AgentInvoker>,
        tools: Vec<Arc<dyn Tool>>,
        budget_tokens: usize,
    ) -> Self {
        Self {
            invoker,
            tools,
            budget_tokens,
        }
    }

    /// Fold done entries beyond the window into the milestone rollup.
    ///
    /// Incremental: only entries not yet covered are summarised, appended to
    /// the existing paragraph, and the whole thing recompressed when it
    /// outgrows its budget.
    async fn compact_rollup(
        &self,
        snapshot: &WorkflowState,
    ) -> Option<(usize, MilestoneRollup)> {
        let index = snapshot.active_milestone_index;
        let milestone_entries = snapshot.done_for_milestone(index);
        if milestone_entries.len() <= DONE_WINDOW {
            return None;
        }
        let overflow = milestone_entries.len() - DONE_WINDOW;
        let covered = snapshot.rollup_for(index).map_or(0, |r| r.covered);
        if overflow <= covered {
            return None;
        }

        let mut paragraph = snapshot
            .rollup_for(index)
            .map(|r| r.paragraph.clone())
            .unwrap_or_default();
        for entry in &milestone_entries[covered..overflow] {
            let outcome = if entry.failed { "failed" } else { "done" };
            if !paragraph.is_empty() {
                paragraph.push(' ');
            }
            paragraph.push_str(&format!(
                "[{outcome}] {}: {}.",
                entry.task_description, entry.result_summary
            ));
        }
        if paragraph.chars().count() > ROLLUP_MAX_CHARS {
            let (compressed, _) = self
                .invoker
                .normaliser()
                .compress(&paragraph, ROLLUP_MAX_CHARS, "milestone progress rollup")
                .await;
            paragraph = compressed;
        }
        debug!(milestone = index, covered = overflow, "done-list rollup compacted");
        Some((
            index,
            MilestoneRollup {
                paragraph,
                covered: overflow,
            },
        ))
    }

    /// Directives in consumption order: critical first, then functional,
    /// then cleanup.
    fn ordered_directives(directives: &[Directive]) -> Vec<&Directive> {
        let mut ordered: Vec<&Directive> = Vec::with_capacity(directives.len());
        ordered.extend(
            directives
                .iter()
                .filter(|d| d.priority == DirectivePriority::Critical),
        );
        ordered.extend(directives.iter().filter(|d| {
            d.priority != DirectivePriority::Critical && d.kind == DirectiveKind::Functional
        }));
        ordered.extend(directives.iter().filter(|d| {
            d.priority != DirectivePriority::Critical && d.kind == DirectiveKind::Cleanup
        }));
        ordered
    }

    fn build_prompt(snapshot: &WorkflowState, rollup: Option<&MilestoneRollup>) -> String {
        let mut parts = vec!["## MILESTONE SCOPE".to_string()];
        match snapshot.active_milestone() {
            Some(milestone) => {
                parts.push(format!("**Milestone**: {}", milestone.description));
                if !milestone.sketch.is_empty() {
                    parts.push(format!("**Areas**: {}", milestone.sketch));
                }
            }
            None => parts.push("(no active milestone - treat as milestone_done)".to_string()),
        }
        parts.push(String::new());

        let rollup = rollup.or_else(|| snapshot.rollup_for(snapshot.active_milestone_index));
        if let Some(rollup) = rollup {
            if !rollup.paragraph.is_empty() {
                parts.push("## EARLIER THIS MILESTONE (rolled up)".to_string());
                parts.push(rollup.paragraph.clone());
                parts.push(String::new());
            }
        }

        let recent = snapshot.recent_done(DONE_WINDOW);
        if !recent.is_empty() {
            parts.push("## DONE (recent)".to_string());
            for (i, entry) in recent.iter().enumerate() {
                let outcome = if entry.failed { "FAILED" } else { "ok" };
                parts.push(format!(
                    "  {}. [{}] {} -> {}",
                    i + 1,
                    outcome,
                    clamp_chars(&entry.task_description, 80),
                    clamp_chars(&entry.result_summary, 60)
                ));
            }
            parts.push(String::new());
        }

        if !snapshot.carry_forward.is_empty() {
            parts.push("## CARRY-FORWARD (lookahead, re-derive every round)".to_string());
            for (i, item) in snapshot.carry_forward.iter().enumerate() {
                parts.push(format!("  {}. {}", i + 1, clamp_chars(item, CARRY_ITEM_MAX)));
            }
            parts.push(String::new());
        }

        if let Some(qa) = snapshot.last_qa_feedback() {
            parts.push("## RETRY CONTEXT (QA failed - address this)".to_string());
            parts.push(clamp_chars(&qa.feedback, 500));
            for issue in &qa.issues {
                parts.push(format!("  - {issue}"));
            }
            if let Some(plan) = &snapshot.current_implementation_plan {
                parts.push("### Previous plan (for reference)".to_string());
                parts.push(clamp_chars(plan, 1_500));
            }
            parts.push(String::new());
        }

        if let Some(hint) = &snapshot.correction_hint {
            parts.push("## CORRECTION HINT (from assessor)".to_string());
            parts.push(clamp_chars(hint, 300));
            parts.push(String::new());
        }

        let ordered = Self::ordered_directives(&snapshot.pending_directives);
        if !ordered.is_empty() {
            parts.push("## DIRECTIVES (priority order)".to_string());
            for directive in ordered {
                let marker = match directive.priority {
                    DirectivePriority::Critical => "CRITICAL",
                    DirectivePriority::Normal => match directive.kind {
                        DirectiveKind::Functional => "functional",
                        DirectiveKind::Cleanup => "cleanup",
                    },
                };
                parts.push(format!(
                    "  [{}] #{} from {}: {} ({})",
                    marker,
                    directive.id,
                    directive.source,
                    directive.description,
                    clamp_chars(&directive.rationale, 120)
                ));
            }
            parts.push(String::new());
        }

        parts.push("## INSTRUCTIONS".to_string());
        parts.push(format!(
            "Repository root: {}",
            snapshot.repo_root.display()
        ));
        parts.push(
            "Review the scope, done list, and carry-forward. Research if needed. Pick the \
             next task and output the structured JSON."
                .to_string(),
        );
        parts.join("\n")
    }

    /// Fraction of carry-forward items that changed between rounds.
    fn carry_churn(old: &[String], new: &[String]) -> f32 {
        if old.is_empty() {
            return 0.0;
        }
        let added = new.iter().filter(|item| !old.contains(item)).count();
        let dropped = old.iter().filter(|item| !new.contains(item)).count();
        (added + dropped) as f32 / old.len().max(new.len()) as f32
    }

    fn parse_directive_ids(raw: Option<&Value>, pending: &[Directive]) -> Vec<u64> {
        let Some(Value::Array(items)) = raw else {
            return Vec::new();
        };
        let mut ids: Vec<u64> = items
            .iter()
            .filter_map(|item| match item {
                Value::Number(n) => n.as_u64(),
                Value::String(s) => s.trim().trim_start_matches('#').parse().ok(),
                _ => None,
            })
            .filter(|id| pending.iter().any(|d| d.id == *id))
            .collect();
        let mut seen = Vec::new();
        ids.retain(|id| {
            if seen.contains(id) {
                false
            } else {
                seen.push(*id);
                true
            }
        });
        ids
    }
}

#[async_trait]
impl NodeHandler for TaskPlannerNode {
    async fn run(
        &self,
        snapshot: WorkflowState,
        ctx: NodeContext,
    ) -> Result<StateUpdate, NodeError> {
        if snapshot.active_milestone().is_none() {
            return Err(PlannerError::Invoke {
                message: "no active milestone".into(),
            }
            .into());
        }

        let rollup = self.compact_rollup(&snapshot).await;
        let user_prompt = Self::build_prompt(&snapshot, rollup.as_ref().map(|(_, r)| r));

        let (output, _reply) = self
            .invoker
            .invoke_structured(
                AgentRequest {
                    agent: NodeName::TaskPlanner,
                    role: Role::Primary,
                    system_prompt: PLANNER_SYSTEM_PROMPT.to_string(),
                    user_prompt,
                    tools: self.tools.clone(),
                    max_input_tokens: self.budget_tokens,
                },
                &planner_schema(),
            )
            .await
            .map_err(|error| match error {
                StructuredInvokeError::Normalise(n) => NodeError::Planner(PlannerError::Invoke {
                    message: n.to_string(),
                }),
                other => NodeError::from_structured(NodeName::TaskPlanner, other),
            })?;

        let action_text = output.str_field("action").to_string();
        let mut action = PlannerAction::parse(&action_text)
            .ok_or(PlannerError::BadAction { got: action_text })?;

        let carry: Vec<String> = output
            .str_list_field("carry_forward")
            .into_iter()
            .map(|item| clamp_chars(&item, CARRY_ITEM_MAX))
            .take(CARRY_MAX)
            .collect();
        let churn = Self::carry_churn(&snapshot.carry_forward, &carry);

        let plan = output.str_field("implementation_plan").to_string();
        let task_description = {
            let description = output.str_field("task_description").trim().to_string();
            if description.is_empty() {
                "Implementation task".to_string()
            } else {
                description
            }
        };

        if action == PlannerAction::Implement && plan.chars().count() < MIN_PLAN_CHARS {
            info!("planner chose implement with a thin plan; demoting to skip");
            action = PlannerAction::Skip;
        }

        let mut update = StateUpdate {
            task_planner_action: Field::Set(action),
            carry_forward: Some(carry),
            // Both retry inputs are consumed by the round that saw them.
            correction_hint: Field::Clear,
            current_qa_result: Field::Clear,
            planner_rounds: Some(snapshot.planner_rounds + 1),
            done_rollup: rollup,
            consume_directives: Self::parse_directive_ids(
                output.fields.get("addressed_directives"),
                &snapshot.pending_directives,
            ),
            ..StateUpdate::default()
        };

        let mut urgency = 0.0f32;
        if churn > 0.5 {
            debug!(churn, "high carry-forward churn");
            urgency += CHURN_URGENCY;
        }

        match action {
            PlannerAction::Implement => {
                ctx.emitter.emit(EventPayload::Task(TaskEvent::TaskStarted {
                    description: task_description.clone(),
                }));
                update.current_task_description = Field::Set(task_description);
                update.current_implementation_plan = Field::Set(plan);
            }
            PlannerAction::Skip => {
                update.current_task_description = Field::Set(task_description);
            }
            PlannerAction::Abort => {
                let context = {
                    let context = output.str_field("escalation_context").trim().to_string();
                    if context.is_empty() {
                        "task judged infeasible within milestone scope".to_string()
                    } else {
                        context
                    }
                };
                update.current_task_description = Field::Set(task_description);
                update.escalation_context = Field::Set(context);
                urgency += ABORT_URGENCY;
            }
            PlannerAction::MilestoneDone => {}
        }

        if urgency > 0.0 {
            update.urgency = Some(UrgencySignal::Add(urgency));
        }
        info!(action = %action, "planner round complete");
        Ok(update)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{DoneEntry, Milestone};
    use chrono::Utc;

    fn entry(i: usize) -> DoneEntry {
        DoneEntry {
            task_description: format!("task {i}"),
            result_summary: format!("result {i}"),
            qa_feedback: String::new(),
            milestone_index: 0,
            failed: false,
            when: Utc::now(),
        }
    }

    #[test]
    fn churn_is_zero_for_empty_old_list() {
        assert_eq!(TaskPlannerNode::carry_churn(&[], &["a".into()]), 0.0);
    }

    #[test]
    fn churn_counts_added_and_dropped() {
        let old = vec!["a".to_string(), "b".to_string()];
        let new = vec!["a".to_string(), "c".to_string()];
        // one added, one dropped over max len 2
        assert!((TaskPlannerNode::carry_churn(&old, &new) - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn directive_ordering_is_critical_functional_cleanup() {
        let directives = vec![
            Directive {
                id: 1,
                kind: DirectiveKind::Cleanup,
                source: "s".into(),
                description: "cleanup".into(),
                rationale: String::new(),
                priority: DirectivePriority::Normal,
            },
            Directive {
                id: 2,
                kind: DirectiveKind::Functional,
                source: "s".into(),
                description: "functional".into(),
                rationale: String::new(),
                priority: DirectivePriority::Normal,
            },
            Directive {
                id: 3,
                kind: DirectiveKind::Cleanup,
                source: "s".into(),
                description: "urgent".into(),
                rationale: String::new(),
                priority: DirectivePriority::Critical,
            },
        ];
        let ordered: Vec<u64> = TaskPlannerNode::ordered_directives(&directives)
            .iter()
            .map(|d| d.id)
            .collect();
        assert_eq!(ordered, vec![3, 2, 1]);
    }

    #[test]
    fn directive_ids_are_filtered_to_pending() {
        let pending = vec![Directive {
            id: 7,
            kind: DirectiveKind::Functional,
            source: "s".into(),
            description: String::new(),
            rationale: String::new(),
            priority: DirectivePriority::Normal,
        }];
        let raw = serde_json::json!([7, "9", "#7", 3.5]);
        let ids = TaskPlannerNode::parse_directive_ids(Some(&raw), &pending);
        assert_eq!(ids, vec![7]);
    }

    #[test]
    fn prompt_windows_the_done_list() {
        let mut state = WorkflowState::new("req", ".");
        state.milestones = vec![Milestone::new("outcome", "themes")];
        for i in 0..12 {
            state.done_list.push(entry(i));
        }
        state.done_rollup.insert(
            0,
            MilestoneRollup {
                paragraph: "early work folded".into(),
                covered: 5,
            },
        );
        let prompt = TaskPlannerNode::build_prompt(&state, None);
        assert!(prompt.contains("rolled up"));
        assert!(prompt.contains("task 11"));
        // Entries below the window only appear via the rollup.
        assert!(!prompt.contains("task 4 "));
    }
}
