//! Scope agent: turns a user request into a remit and milestones.
//!
//! Two entry modes share one handler. The initial entry interprets the raw
//! request against the current repository. The re-plan entry — reached only
//! through a major-divergence verdict — additionally receives the rolled-up
//! prior work and the divergence analysis, keeps completed milestones
//! immutable, and may rewrite everything from the active index forward. A
//! re-plan that returns no remaining milestones means the remit is already
//! satisfied.

use async_trait::async_trait;
use miette::Diagnostic;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

use super::{NodeContext, NodeError, NodeHandler};
use crate::invoker::normaliser::{FieldSpec, Schema};
use crate::invoker::{AgentInvoker, AgentRequest, Role};
use crate::state::{clamp_chars, Milestone, WorkflowState, MILESTONE_DESC_MAX, REMIT_MAX};
use crate::tools::Tool;
use crate::types::{NodeName, Status};
use crate::update::{Field, StateUpdate};

/// Terminal failure: no usable scope could be produced.
#[derive(Debug, Error, Diagnostic)]
pub enum ScopeError {
    #[error("scope agent produced no milestones for the initial request")]
    #[diagnostic(
        code(gaffer::scope::no_milestones),
        help("The request may be empty or unintelligible; at least one milestone is required.")
    )]
    NoMilestones,

    #[error("scope agent output unusable: {message}")]
    #[diagnostic(code(gaffer::scope::unusable))]
    Unusable { message: String },
}

const SCOPE_SYSTEM_PROMPT: &str = "\
You are a scope definition agent for a software development project. You \
interpret user requests, assess the current state of the repository, and \
define milestones as user-observable outcomes.

DEFINITIONS
- Remit: a broad statement of the scope of work the user is asking for. It \
bounds the outcome, not the implementation.
- Milestone: a broad sequential step from current state to desired state. \
Self-contained, testable by the user, no smaller than a sprint. Describe \
outcomes, not implementation. Each carries a short sketch of work themes.

PROCESS
1. Interpret the request in the context of the current project; research \
with the tools when unsure.
2. Derive the explicit and implied needs (testability is always at least \
implied).
3. Produce the remit and an ordered list of milestones closing the gap.

OUTPUT
Reply with one JSON object:
{\"remit\": \"...\", \"milestones\": [{\"description\": \"...\", \"sketch\": \"...\"}]}
Milestone descriptions stay under 200 characters. Prefer logical \
completeness over strict interpretation.";

const REPLAN_GUIDANCE: &str = "\
RE-PLAN MODE
Prior work and a divergence analysis are provided. Completed milestones are \
immutable history: do not restate them. Output only the REMAINING \
milestones from here forward, revised to correct the divergence. An empty \
milestones list means the remit is already satisfied by the prior work.";

fn scope_schema() -> Schema {
    Schema {
        name: "scope_output",
        fields: vec![
            FieldSpec::required_str("remit", REMIT_MAX),
            FieldSpec::list("milestones").required(),
        ],
    }
}

/// The scope agent node.
pub struct ScopeAgentNode {
    invoker: Arc<AgentInvoker>,
    tools: Vec<Arc<dyn Tool>>,
    budget_tokens: usize,
}

impl ScopeAgentNode {
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

    fn build_prompt(snapshot: &WorkflowState) -> String {
        let mut parts = vec![
            "## USER REQUEST".to_string(),
            snapshot.user_request.clone(),
            String::new(),
            format!("## REPOSITORY ROOT: {}", snapshot.repo_root.display()),
        ];
        let replanning = snapshot.divergence_analysis.is_some();
        if replanning {
            parts.push(String::new());
            parts.push("## PRIOR WORK (completed so far)".to_string());
            match &snapshot.prior_work {
                Some(prior) if !prior.is_empty() => parts.push(prior.clone()),
                _ => parts.push("(none recorded)".to_string()),
            }
            if !snapshot.milestones.is_empty() {
                parts.push(String::new());
                parts.push("## COMPLETED MILESTONES (immutable)".to_string());
                for milestone in &snapshot.milestones[..snapshot.active_milestone_index] {
                    parts.push(format!("- {}", milestone.description));
                }
            }
            if let Some(analysis) = &snapshot.divergence_analysis {
                parts.push(String::new());
                parts.push("## DIVERGENCE ANALYSIS".to_string());
                parts.push(analysis.clone());
            }
        }
        parts.push(String::new());
        parts.push(
            "Research the codebase as needed, then output the structured JSON.".to_string(),
        );
        parts.join("\n")
    }

    fn parse_milestones(raw: &[Value]) -> Vec<Milestone> {
        let mut milestones = Vec::new();
        for item in raw {
            let description = item
                .get("description")
                .and_then(Value::as_str)
                .map(str::trim)
                .unwrap_or_default();
            if description.is_empty() {
                continue;
            }
            let sketch = item
                .get("sketch")
                .and_then(Value::as_str)
                .unwrap_or_default();
            milestones.push(Milestone {
                description: clamp_chars(description, MILESTONE_DESC_MAX),
                sketch: clamp_chars(sketch, 150),
            });
        }
        milestones
    }
}

#[async_trait]
impl NodeHandler for ScopeAgentNode {
    async fn run(
        &self,
        snapshot: WorkflowState,
        _ctx: NodeContext,
    ) -> Result<StateUpdate, NodeError> {
        if snapshot.user_request.trim().is_empty() {
            return Err(ScopeError::Unusable {
                message: "user request is empty".into(),
            }
            .into());
        }
        let replanning = snapshot.divergence_analysis.is_some();
        let system_prompt = if replanning {
            format!("{SCOPE_SYSTEM_PROMPT}\n\n{REPLAN_GUIDANCE}")
        } else {
            SCOPE_SYSTEM_PROMPT.to_string()
        };

        let (output, _reply) = self
            .invoker
            .invoke_structured(
                AgentRequest {
                    agent: NodeName::ScopeAgent,
                    role: Role::Primary,
                    system_prompt,
                    user_prompt: Self::build_prompt(&snapshot),
                    tools: self.tools.clone(),
                    max_input_tokens: self.budget_tokens,
                },
                &scope_schema(),
            )
            .await
            .map_err(|error| match error {
                // Normalisation failure of scope output is a scope failure.
                crate::invoker::StructuredInvokeError::Normalise(n) => {
                    NodeError::Scope(ScopeError::Unusable {
                        message: n.to_string(),
                    })
                }
                other => NodeError::from_structured(NodeName::ScopeAgent, other),
            })?;

        let remit = clamp_chars(output.str_field("remit"), REMIT_MAX);
        let raw_milestones = output
            .fields
            .get("milestones")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let new_milestones = Self::parse_milestones(&raw_milestones);

        if replanning {
            // Completed milestones stay; the rewrite applies from the active
            // index forward. Counters and the window reset for the new plan.
            let completed: Vec<Milestone> =
                snapshot.milestones[..snapshot.active_milestone_index].to_vec();
            let scope_complete = new_milestones.is_empty();
            let mut milestones = completed;
            milestones.extend(new_milestones);
            let active_index = if scope_complete {
                milestones.len()
            } else {
                snapshot.active_milestone_index
            };
            return Ok(StateUpdate {
                remit: Some(remit),
                milestones: Some(milestones),
                active_milestone_index: Some(active_index),
                carry_forward: Some(Vec::new()),
                tasks_since_last_review: Some(0),
                attempt_count: Some(0),
                urgency: Some(crate::update::UrgencySignal::Reset(0.0)),
                milestone_aborts: Some(0),
                divergence_analysis: Field::Clear,
                prior_work: Field::Clear,
                correction_hint: Field::Clear,
                status: scope_complete.then_some(Status::Complete),
                ..StateUpdate::default()
            });
        }

        if new_milestones.is_empty() {
            return Err(ScopeError::NoMilestones.into());
        }
        Ok(StateUpdate {
            remit: Some(remit),
            milestones: Some(new_milestones),
            active_milestone_index: Some(0),
            carry_forward: Some(Vec::new()),
            ..StateUpdate::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_skips_blank_descriptions_and_clamps() {
        let raw = vec![
            json!({"description": "", "sketch": "x"}),
            json!({"description": "a".repeat(400), "sketch": ""}),
            json!({"description": "usable outcome", "sketch": "themes"}),
        ];
        let milestones = ScopeAgentNode::parse_milestones(&raw);
        assert_eq!(milestones.len(), 2);
        assert!(milestones[0].description.chars().count() <= MILESTONE_DESC_MAX);
        assert_eq!(milestones[1].description, "usable outcome");
    }

    #[test]
    fn prompt_includes_divergence_sections_on_replan() {
        let mut state = WorkflowState::new("add titanium", ".");
        state.divergence_analysis = Some("built the wrong economy model".into());
        state.prior_work = Some("[done] task a -> ok".into());
        state.milestones = vec![Milestone::new("m0", ""), Milestone::new("m1", "")];
        state.active_milestone_index = 1;

        let prompt = ScopeAgentNode::build_prompt(&state);
        assert!(prompt.contains("DIVERGENCE ANALYSIS"));
        assert!(prompt.contains("PRIOR WORK"));
        assert!(prompt.contains("- m0"));
        assert!(!prompt.contains("- m1"));
    }
}
