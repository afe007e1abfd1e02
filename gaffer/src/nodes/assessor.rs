//! Assessor: periodic and escalated alignment review.
//!
//! The assessor is the strategic gate. It reads the remit, the active
//! milestone, the done list since the last review, the carry-forward, and
//! any escalation context from an abort, and returns one of four verdicts.
//! Two deterministic rules override the model:
//!
//! - two or more aborts within the same milestone force `major_divergence`
//!   (the soft abort cap);
//! - `milestone_complete` on the last milestone completes the workflow.
//!
//! Every invocation resets the review cadence. Urgency resets to zero —
//! or to 0.5 after a minor-drift verdict, pulling the next review forward.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

use super::{NodeContext, NodeError, NodeHandler};
use crate::events::{EventPayload, TaskEvent};
use crate::invoker::normaliser::{FieldSpec, Schema};
use crate::invoker::{AgentInvoker, AgentRequest, Role};
use crate::state::{clamp_chars, WorkflowState, CORRECTION_HINT_MAX, DONE_WINDOW};
use crate::types::{NodeName, Status, Verdict};
use crate::update::{Field, StateUpdate, UrgencySignal};

/// Urgency floor left behind by a minor-drift verdict.
const MINOR_DRIFT_URGENCY_FLOOR: f32 = 0.5;
/// Aborts within one milestone that force escalation to scope.
const MILESTONE_ABORT_CAP: u32 = 2;

const ASSESSOR_SYSTEM_PROMPT: &str = "\
You are the assessment agent for a software development project. Review the \
work done since the last review against the remit and the active milestone, \
and return exactly one verdict.

VERDICTS
- aligned: work tracks the remit; continue.
- minor_drift: slightly off (style drift, small missing polish). Provide a \
correction_hint under 200 chars; the planner will re-derive its lookahead.
- major_divergence: fundamentally the wrong direction (misread remit, wrong \
milestone breakdown). Provide divergence_analysis. Use sparingly.
- milestone_complete: every user outcome of the active milestone is \
achieved and no gaps remain.

Judge outcomes, not effort. Failed tasks and escalation context weigh \
toward drift or divergence when they reveal a strategic problem, and toward \
aligned when they were mere tactical dead ends.

OUTPUT
One JSON object:
{\"verdict\": \"aligned|minor_drift|major_divergence|milestone_complete\", \
\"assessment_notes\": \"...\", \"correction_hint\": \"...\", \
\"divergence_analysis\": \"...\"}";

fn assessor_schema() -> Schema {
    Schema {
        name: "assessor_output",
        fields: vec![
            FieldSpec::required_str("verdict", 40),
            FieldSpec::optional_str("assessment_notes", 500),
            FieldSpec::optional_str("correction_hint", CORRECTION_HINT_MAX),
            FieldSpec::optional_str("divergence_analysis", 1_000),
        ],
    }
}

/// The assessor node.
pub struct AssessorNode {
    invoker: Arc<AgentInvoker>,
    budget_tokens: usize,
}

impl AssessorNode {
    pub fn new(invoker: Arc<AgentInvoker>, budget_tokens: usize) -> Self {
        Self {
            invoker,
            budget_tokens,
        }
    }

    fn build_prompt(snapshot: &WorkflowState) -> String {
        let mut parts = vec![
            format!("Remit (scope boundary): {}", snapshot.remit),
            String::new(),
        ];
        if let Some(milestone) = snapshot.active_milestone() {
            parts.push(format!(
                "Active milestone ({} of {}): {}",
                snapshot.active_milestone_index + 1,
                snapshot.milestones.len(),
                milestone.description
            ));
        }
        parts.push(format!(
            "Tasks since last review: {}",
            snapshot.tasks_since_last_review
        ));
        parts.push(format!("Urgency: {:.1}", snapshot.urgency));
        parts.push(format!(
            "Aborts this milestone: {}",
            snapshot.milestone_aborts
        ));
        parts.push(String::new());

        let recent = snapshot.recent_done(DONE_WINDOW + 3);
        if recent.is_empty() {
            parts.push("No tasks completed yet.".to_string());
        } else {
            parts.push("## Recent tasks".to_string());
            for entry in recent {
                let outcome = if entry.failed { "FAILED" } else { "ok" };
                parts.push(format!(
                    "- [{}] {} -> {}",
                    outcome,
                    clamp_chars(&entry.task_description, 80),
                    clamp_chars(&entry.result_summary, 60)
                ));
                if !entry.qa_feedback.is_empty() {
                    parts.push(format!("    QA: {}", clamp_chars(&entry.qa_feedback, 120)));
                }
            }
        }
        parts.push(String::new());

        if !snapshot.carry_forward.is_empty() {
            parts.push("## Planner carry-forward".to_string());
            for item in &snapshot.carry_forward {
                parts.push(format!("- {item}"));
            }
            parts.push(String::new());
        }

        if let Some(context) = &snapshot.escalation_context {
            parts.push("## ESCALATION (task aborted)".to_string());
            parts.push(clamp_chars(context, 500));
            parts.push(String::new());
        }

        parts.push("Weigh the recent work against the remit and output the JSON.".to_string());
        parts.join("\n")
    }
}

#[async_trait]
impl NodeHandler for AssessorNode {
    async fn run(
        &self,
        snapshot: WorkflowState,
        ctx: NodeContext,
    ) -> Result<StateUpdate, NodeError> {
        // Soft abort cap: repeated aborts in one milestone escalate without
        // consulting the model.
        let forced_divergence = snapshot.milestone_aborts >= MILESTONE_ABORT_CAP;

        let mut verdict = Verdict::Aligned;
        let mut correction_hint = String::new();
        let mut divergence_analysis = String::new();

        if forced_divergence {
            verdict = Verdict::MajorDivergence;
            divergence_analysis = format!(
                "{} aborts within the active milestone; the current breakdown is not working",
                snapshot.milestone_aborts
            );
            info!(aborts = snapshot.milestone_aborts, "abort cap reached; forcing divergence");
        } else {
            let invocation = self
                .invoker
                .invoke_structured(
                    AgentRequest {
                        agent: NodeName::Assessor,
                        role: Role::Supervisor,
                        system_prompt: ASSESSOR_SYSTEM_PROMPT.to_string(),
                        user_prompt: Self::build_prompt(&snapshot),
                        tools: Vec::new(),
                        max_input_tokens: self.budget_tokens,
                    },
                    &assessor_schema(),
                )
                .await;
            match invocation {
                Ok((output, _reply)) => {
                    verdict = Verdict::parse(output.str_field("verdict")).unwrap_or(Verdict::Aligned);
                    correction_hint = output.str_field("correction_hint").trim().to_string();
                    divergence_analysis =
                        output.str_field("divergence_analysis").trim().to_string();
                }
                Err(error) => {
                    // A failed assessment never halts the workflow: assume
                    // aligned, reset the cadence, and let work continue.
                    tracing::warn!(%error, "assessor failed; assuming aligned");
                }
            }
        }

        let mut update = StateUpdate {
            last_verdict: Field::Set(verdict),
            tasks_since_last_review: Some(0),
            urgency: Some(UrgencySignal::Reset(0.0)),
            escalation_context: Field::Clear,
            ..StateUpdate::default()
        };

        match verdict {
            Verdict::Aligned => {}
            Verdict::MinorDrift => {
                update.urgency = Some(UrgencySignal::Reset(MINOR_DRIFT_URGENCY_FLOOR));
                // The carry-forward is cleared so the planner re-derives it
                // under the hint.
                update.carry_forward = Some(Vec::new());
                if !correction_hint.is_empty() {
                    update.correction_hint =
                        Field::Set(clamp_chars(&correction_hint, CORRECTION_HINT_MAX));
                }
            }
            Verdict::MajorDivergence => {
                let analysis = if divergence_analysis.is_empty() {
                    "assessor judged the work fundamentally misaligned".to_string()
                } else {
                    divergence_analysis
                };
                update.divergence_analysis = Field::Set(analysis);
                update.prior_work = Field::Set(snapshot.rolled_up_prior_work());
            }
            Verdict::MilestoneComplete => {
                let next_index = snapshot.active_milestone_index + 1;
                if next_index < snapshot.milestones.len() {
                    ctx.emitter
                        .emit(EventPayload::Task(TaskEvent::MilestoneAdvanced {
                            index: next_index,
                            description: snapshot.milestones[next_index].description.clone(),
                        }));
                    update.active_milestone_index = Some(next_index);
                    update.carry_forward = Some(Vec::new());
                    update.attempt_count = Some(0);
                    update.milestone_aborts = Some(0);
                } else {
                    update.status = Some(Status::Complete);
                }
            }
        }

        info!(verdict = %verdict, "assessment complete");
        Ok(update)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Milestone;

    #[test]
    fn prompt_carries_escalation_context() {
        let mut state = WorkflowState::new("req", ".");
        state.remit = "the remit".into();
        state.milestones = vec![Milestone::new("m", "")];
        state.escalation_context = Some("task was impossible".into());
        let prompt = AssessorNode::build_prompt(&state);
        assert!(prompt.contains("ESCALATION"));
        assert!(prompt.contains("task was impossible"));
    }
}
