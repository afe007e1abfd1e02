//! Implementor: executes the current plan with file tools.
//!
//! The implementor is the only node handed write-capable tools, which is
//! what serialises all repository writes through one place. Its final
//! answer is normalised into an [`ImplementationResult`]; any file it
//! *claims* to have modified without a recorded successful write is flagged
//! as an issue rather than taken on faith — the deterministic QA pre-step
//! then re-checks the survivors on disk.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

use super::{NodeContext, NodeError, NodeHandler};
use crate::invoker::normaliser::{FieldSpec, Schema};
use crate::invoker::{AgentInvoker, AgentRequest, Role};
use crate::state::{clamp_chars, ImplementationResult, WorkflowState, RESULT_SUMMARY_MAX};
use crate::tools::fs::WriteLog;
use crate::tools::Tool;
use crate::types::NodeName;
use crate::update::{Field, StateUpdate};

const IMPLEMENTOR_SYSTEM_PROMPT: &str = "\
You are a code implementation agent. You receive a detailed implementation \
plan and you make the changes with tools. Text descriptions of changes are \
NOT changes: you MUST call tools to create and modify files.

RULES
1. Read before you modify: use read_file or read_file_lines first.
2. New files: create_file with the full content from the plan.
3. Small edits: apply_edit with an exact, unique old_string.
4. Large rewrites: write_file with the complete new content.
5. Use repo-relative paths exactly as the plan gives them.
6. If a tool fails, continue with the remaining changes and report the \
failure in issues.

When every change is done, output one JSON object:
{\"files_modified\": [\"path/one\", \"path/two\"], \"result_summary\": \
\"what was implemented\", \"issues\": [\"problems encountered\"], \
\"success\": true}
Success is true when most changes landed; false when nothing did.";

fn implementor_schema() -> Schema {
    Schema {
        name: "implementation_result",
        fields: vec![
            FieldSpec::str_list("files_modified", 300),
            FieldSpec::required_str("result_summary", RESULT_SUMMARY_MAX),
            FieldSpec::str_list("issues", 300),
            FieldSpec::required_bool("success"),
        ],
    }
}

/// The implementor node.
pub struct ImplementorNode {
    invoker: Arc<AgentInvoker>,
    tools: Vec<Arc<dyn Tool>>,
    write_log: WriteLog,
    budget_tokens: usize,
}

impl ImplementorNode {
    pub fn new(
        invoker: Arc<AgentInvoker>,
        tools: Vec<Arc<dyn Tool>>,
        write_log: WriteLog,
        budget_tokens: usize,
    ) -> Self {
        Self {
            invoker,
            tools,
            write_log,
            budget_tokens,
        }
    }

    /// Cross-check claimed modifications against the write log.
    fn reconcile(
        claimed: Vec<String>,
        written: &[String],
        issues: &mut Vec<String>,
    ) -> Vec<String> {
        let mut verified = Vec::with_capacity(claimed.len());
        for path in claimed {
            if written.iter().any(|w| w == &path) {
                verified.push(path);
            } else {
                issues.push(format!(
                    "claimed modification of {path} without a successful write tool call"
                ));
            }
        }
        // Writes the agent forgot to report still count as modifications.
        for path in written {
            if !verified.contains(path) {
                verified.push(path.clone());
            }
        }
        verified
    }
}

#[async_trait]
impl NodeHandler for ImplementorNode {
    async fn run(
        &self,
        snapshot: WorkflowState,
        _ctx: NodeContext,
    ) -> Result<StateUpdate, NodeError> {
        let Some(plan) = snapshot.current_implementation_plan.clone() else {
            // Nothing to execute; report an unsuccessful result so QA fails
            // deterministically and the planner gets another round.
            warn!("implementor entered without a plan");
            return Ok(StateUpdate {
                current_implementation_result: Field::Set(ImplementationResult {
                    files_modified: Vec::new(),
                    result_summary: "no implementation plan was available".into(),
                    issues: vec!["missing implementation plan".into()],
                    success: false,
                }),
                ..StateUpdate::default()
            });
        };

        // Writes recorded before this task started are not ours.
        let _ = self.write_log.take();

        let user_prompt = format!(
            "Repository root: {}\n\n## IMPLEMENTATION PLAN\n{}\n\nExecute the plan with \
             the tools, then output the JSON summary.",
            snapshot.repo_root.display(),
            plan
        );

        let invocation = self
            .invoker
            .invoke_structured(
                AgentRequest {
                    agent: NodeName::Implementor,
                    role: Role::Primary,
                    system_prompt: IMPLEMENTOR_SYSTEM_PROMPT.to_string(),
                    user_prompt,
                    tools: self.tools.clone(),
                    max_input_tokens: self.budget_tokens,
                },
                &implementor_schema(),
            )
            .await;

        let written = self.write_log.take();
        let result = match invocation {
            Ok((output, reply)) => {
                let mut issues = output.str_list_field("issues");
                let files_modified = Self::reconcile(
                    output.str_list_field("files_modified"),
                    &written,
                    &mut issues,
                );
                info!(
                    files = files_modified.len(),
                    tool_calls = reply.tool_calls,
                    "implementor finished"
                );
                ImplementationResult {
                    files_modified,
                    result_summary: clamp_chars(
                        output.str_field("result_summary"),
                        RESULT_SUMMARY_MAX,
                    ),
                    issues,
                    success: output.bool_field("success"),
                }
            }
            // Budget failures join the engine's retry policy; anything else
            // degrades into a failed result with the writes that did land,
            // so QA and the planner see the truth.
            Err(crate::invoker::StructuredInvokeError::Invoke(
                crate::invoker::InvokerError::Budget(budget),
            )) => {
                return Err(NodeError::Budget(budget));
            }
            Err(error) => {
                warn!(%error, "implementor invocation failed");
                ImplementationResult {
                    files_modified: written,
                    result_summary: "implementor failed before reporting".into(),
                    issues: vec![error.to_string()],
                    success: false,
                }
            }
        };

        Ok(StateUpdate {
            current_implementation_result: Field::Set(result),
            ..StateUpdate::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reconcile_flags_unwritten_claims() {
        let written = vec!["src/a.rs".to_string()];
        let mut issues = Vec::new();
        let verified = ImplementorNode::reconcile(
            vec!["src/a.rs".into(), "src/ghost.rs".into()],
            &written,
            &mut issues,
        );
        assert_eq!(verified, vec!["src/a.rs".to_string()]);
        assert_eq!(issues.len(), 1);
        assert!(issues[0].contains("ghost"));
    }

    #[test]
    fn reconcile_recovers_unreported_writes() {
        let written = vec!["src/a.rs".to_string(), "src/b.rs".to_string()];
        let mut issues = Vec::new();
        let verified = ImplementorNode::reconcile(vec!["src/a.rs".into()], &written, &mut issues);
        assert_eq!(
            verified,
            vec!["src/a.rs".to_string(), "src/b.rs".to_string()]
        );
        assert!(issues.is_empty());
    }
}
