//! QA: two-phase validation of the implementor's output.
//!
//! Phase one is deterministic and free: every reported file path is checked
//! on disk — exists, regular file, readable, non-empty. Any failure short-
//! circuits to a failed result without spending a single LLM token.
//!
//! Phase two reads capped slices of the actual files, compares them to the
//! plan, and judges whether the task's measurable outcome is met. A failed
//! QA result is a routing outcome (back to the planner through the retry
//! ledger), never an exception.

use async_trait::async_trait;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use super::{NodeContext, NodeError, NodeHandler};
use crate::invoker::normaliser::{FieldSpec, Schema};
use crate::invoker::{AgentInvoker, AgentRequest, Role};
use crate::state::{
    clamp_chars, resolve_in_repo, QaResult, WorkflowState, QA_FEEDBACK_MAX,
};
use crate::types::NodeName;
use crate::update::{Field, StateUpdate, UrgencySignal};

/// Urgency weight a QA failure contributes.
const QA_FAIL_URGENCY: f32 = 0.3;
/// At most this many lines are read per file for the LLM phase.
const MAX_LINES_PER_FILE: usize = 50;
/// At most this many files are read for the LLM phase.
const MAX_FILES: usize = 10;
/// Total character cap on file context fed to the model.
const CONTEXT_MAX_CHARS: usize = 8_192;

const QA_SYSTEM_PROMPT: &str = "\
You are a QA agent for a software development project. Verify that the \
implemented changes satisfy the task's measurable outcome.

PROCESS
1. Compare the actual file content against the plan.
2. Check whether the implementation is complete or has missing pieces.
3. Judge whether the code plausibly works for its intended purpose.

Focus on functional requirements. Set passed=true only when the measurable \
outcome is satisfied.

OUTPUT
One JSON object:
{\"passed\": true, \"feedback\": \"assessment under 500 chars\", \
\"issues\": [\"specific issue\"]}";

fn qa_schema() -> Schema {
    Schema {
        name: "qa_result",
        fields: vec![
            FieldSpec::required_bool("passed"),
            FieldSpec::required_str("feedback", QA_FEEDBACK_MAX),
            FieldSpec::str_list("issues", 300),
        ],
    }
}

/// Outcome of the deterministic pre-step.
struct PreCheck {
    failures: Vec<String>,
}

impl PreCheck {
    fn passed(&self) -> bool {
        self.failures.is_empty()
    }
}

/// The QA node.
pub struct QaNode {
    invoker: Arc<AgentInvoker>,
    budget_tokens: usize,
}

impl QaNode {
    pub fn new(invoker: Arc<AgentInvoker>, budget_tokens: usize) -> Self {
        Self {
            invoker,
            budget_tokens,
        }
    }

    /// Deterministic file verification; no LLM tokens are spent here.
    fn pre_check(repo_root: &Path, files: &[String]) -> PreCheck {
        let mut failures = Vec::new();
        if files.is_empty() {
            failures.push("implementor reported no modified files".to_string());
            return PreCheck { failures };
        }
        for path in files {
            let Some(full) = resolve_in_repo(repo_root, path) else {
                failures.push(format!("{path}: escapes the repository root"));
                continue;
            };
            if !full.exists() {
                failures.push(format!("{path}: does not exist"));
                continue;
            }
            if !full.is_file() {
                failures.push(format!("{path}: not a regular file"));
                continue;
            }
            match fs::metadata(&full) {
                Ok(metadata) if metadata.len() == 0 => {
                    failures.push(format!("{path}: file is empty"));
                }
                Ok(_) => {
                    if fs::File::open(&full).is_err() {
                        failures.push(format!("{path}: not readable"));
                    }
                }
                Err(error) => failures.push(format!("{path}: unreadable metadata ({error})")),
            }
        }
        PreCheck { failures }
    }

    /// Build the capped file-content context for the LLM phase.
    fn implementation_context(repo_root: &Path, files: &[String]) -> String {
        let mut sections = Vec::new();
        let mut used = 0usize;
        for path in files.iter().take(MAX_FILES) {
            let Some(full) = resolve_in_repo(repo_root, path) else {
                continue;
            };
            let Ok(content) = fs::read_to_string(&full) else {
                sections.push(format!("--- {path} ---\n(unreadable)"));
                continue;
            };
            let line_count = content.lines().count();
            if used >= CONTEXT_MAX_CHARS {
                sections.push(format!("--- {path} --- ({line_count} lines, content omitted)"));
                continue;
            }
            let mut slice: String = content
                .lines()
                .take(MAX_LINES_PER_FILE)
                .collect::<Vec<_>>()
                .join("\n");
            if line_count > MAX_LINES_PER_FILE {
                slice.push_str(&format!("\n... (truncated, {line_count} lines total)"));
            }
            let block = format!("--- {path} ---\n{slice}");
            if used + block.len() > CONTEXT_MAX_CHARS {
                sections.push(format!("--- {path} --- ({line_count} lines, content omitted)"));
            } else {
                used += block.len();
                sections.push(block);
            }
        }
        sections.join("\n\n")
    }

    fn fail_update(feedback: String, issues: Vec<String>) -> StateUpdate {
        StateUpdate {
            current_qa_result: Field::Set(QaResult {
                passed: false,
                feedback: clamp_chars(&feedback, QA_FEEDBACK_MAX),
                issues,
            }),
            urgency: Some(UrgencySignal::Add(QA_FAIL_URGENCY)),
            ..StateUpdate::default()
        }
    }
}

#[async_trait]
impl NodeHandler for QaNode {
    async fn run(
        &self,
        snapshot: WorkflowState,
        _ctx: NodeContext,
    ) -> Result<StateUpdate, NodeError> {
        let Some(result) = snapshot.current_implementation_result.clone() else {
            return Ok(Self::fail_update(
                "no implementation result to verify".into(),
                vec!["implementor produced no result".into()],
            ));
        };

        // Phase 1: deterministic checks, no LLM.
        let pre = Self::pre_check(&snapshot.repo_root, &result.files_modified);
        if !pre.passed() {
            info!(failures = pre.failures.len(), "qa pre-step failed");
            return Ok(Self::fail_update(
                format!(
                    "file verification failed: {}",
                    pre.failures.join("; ")
                ),
                pre.failures,
            ));
        }
        if !result.success {
            return Ok(Self::fail_update(
                format!(
                    "implementor reported failure: {}",
                    result.result_summary
                ),
                result.issues.clone(),
            ));
        }

        // Phase 2: LLM assessment of actual content against the plan.
        let plan = snapshot
            .current_implementation_plan
            .as_deref()
            .unwrap_or("(no plan recorded)");
        let task = snapshot
            .current_task_description
            .as_deref()
            .unwrap_or("(no task description)");
        let context = Self::implementation_context(&snapshot.repo_root, &result.files_modified);
        let user_prompt = format!(
            "## TASK\n{task}\n\n## PLAN\n{plan}\n\n## IMPLEMENTOR SUMMARY\n{}\n\n\
             ## ACTUAL IMPLEMENTATION (read from disk)\n{context}\n\n\
             Judge whether the measurable outcome is met and output the JSON.",
            result.result_summary
        );

        let invocation = self
            .invoker
            .invoke_structured(
                AgentRequest {
                    agent: NodeName::Qa,
                    role: Role::Primary,
                    system_prompt: QA_SYSTEM_PROMPT.to_string(),
                    user_prompt,
                    tools: Vec::new(),
                    max_input_tokens: self.budget_tokens,
                },
                &qa_schema(),
            )
            .await;

        match invocation {
            Ok((output, _reply)) => {
                let passed = output.bool_field("passed");
                let update = if passed {
                    StateUpdate {
                        current_qa_result: Field::Set(QaResult {
                            passed: true,
                            feedback: clamp_chars(output.str_field("feedback"), QA_FEEDBACK_MAX),
                            issues: output.str_list_field("issues"),
                        }),
                        ..StateUpdate::default()
                    }
                } else {
                    Self::fail_update(
                        output.str_field("feedback").to_string(),
                        output.str_list_field("issues"),
                    )
                };
                info!(passed, "qa assessment complete");
                Ok(update)
            }
            Err(crate::invoker::StructuredInvokeError::Invoke(
                crate::invoker::InvokerError::Budget(budget),
            )) => Err(NodeError::Budget(budget)),
            // An unassessable implementation is a failed assessment.
            Err(error) => Ok(Self::fail_update(
                format!("qa assessment failed: {error}"),
                vec![error.to_string()],
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pre_check_fails_on_missing_and_empty_files() {
        let repo = tempfile::tempdir().unwrap();
        fs::write(repo.path().join("ok.rs"), "fn f() {}").unwrap();
        fs::write(repo.path().join("empty.rs"), "").unwrap();

        let pre = QaNode::pre_check(
            repo.path(),
            &[
                "ok.rs".to_string(),
                "empty.rs".to_string(),
                "missing.rs".to_string(),
            ],
        );
        assert_eq!(pre.failures.len(), 2);
        assert!(pre.failures.iter().any(|f| f.contains("empty.rs")));
        assert!(pre.failures.iter().any(|f| f.contains("missing.rs")));
    }

    #[test]
    fn pre_check_fails_on_no_files() {
        let repo = tempfile::tempdir().unwrap();
        let pre = QaNode::pre_check(repo.path(), &[]);
        assert!(!pre.passed());
    }

    #[test]
    fn context_caps_lines_per_file() {
        let repo = tempfile::tempdir().unwrap();
        let long: String = (0..200).map(|i| format!("line {i}\n")).collect();
        fs::write(repo.path().join("long.rs"), long).unwrap();

        let context = QaNode::implementation_context(repo.path(), &["long.rs".to_string()]);
        assert!(context.contains("line 49"));
        assert!(!context.contains("line 51\n"));
        assert!(context.contains("truncated, 200 lines total"));
    }
}
