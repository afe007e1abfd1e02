//! Reporter: the terminal narrative summary.
//!
//! Runs exactly once, after the router returns the report node, and always
//! produces a `work_report` — a deterministic assembly of the done list and
//! terminal status, optionally polished by the summariser role. A
//! summariser failure falls back to the deterministic text; the reporter
//! never fails the workflow.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::warn;

use super::{NodeContext, NodeError, NodeHandler};
use crate::events::{EventPayload, TaskEvent};
use crate::invoker::{AgentInvoker, AgentRequest, Role};
use crate::state::WorkflowState;
use crate::types::{NodeName, Status};
use crate::update::StateUpdate;

const REPORT_SYSTEM_PROMPT: &str = "\
You write the final report of an autonomous development workflow. Rewrite \
the factual digest below into a short narrative for the requesting user: \
what was asked, what was achieved, what failed or remains. Keep every \
concrete fact; invent nothing. A few paragraphs at most.";

/// The reporter node.
pub struct ReportNode {
    invoker: Arc<AgentInvoker>,
}

impl ReportNode {
    pub fn new(invoker: Arc<AgentInvoker>) -> Self {
        Self { invoker }
    }

    /// Deterministic digest used both as LLM input and as the fallback.
    fn digest(snapshot: &WorkflowState) -> String {
        let mut parts = vec![
            format!("Request: {}", snapshot.user_request),
            format!("Status: {}", snapshot.status),
        ];
        if let Some(error) = &snapshot.error {
            parts.push(format!("Error: {error}"));
        }
        if !snapshot.remit.is_empty() {
            parts.push(format!("Remit: {}", snapshot.remit));
        }
        let completed = snapshot.done_list.iter().filter(|e| !e.failed).count();
        let failed = snapshot.done_list.len() - completed;
        parts.push(format!(
            "Tasks: {completed} completed, {failed} failed, across {} milestone(s)",
            snapshot.milestones.len()
        ));
        for entry in &snapshot.done_list {
            let outcome = if entry.failed { "FAILED" } else { "done" };
            parts.push(format!(
                "- [{outcome}] (milestone {}) {}: {}",
                entry.milestone_index, entry.task_description, entry.result_summary
            ));
        }
        parts.join("\n")
    }
}

#[async_trait]
impl NodeHandler for ReportNode {
    async fn run(
        &self,
        snapshot: WorkflowState,
        ctx: NodeContext,
    ) -> Result<StateUpdate, NodeError> {
        let digest = Self::digest(&snapshot);
        let narrative = match self
            .invoker
            .invoke(AgentRequest {
                agent: NodeName::Report,
                role: Role::Summarizer,
                system_prompt: REPORT_SYSTEM_PROMPT.to_string(),
                user_prompt: digest.clone(),
                tools: Vec::new(),
                max_input_tokens: 5_000,
            })
            .await
        {
            Ok(reply) if !reply.text.trim().is_empty() => reply.text,
            Ok(_) => digest.clone(),
            Err(error) => {
                warn!(%error, "report narrative failed; using deterministic digest");
                digest.clone()
            }
        };

        // A workflow that reached the reporter while still nominally
        // running finished its scope without a terminal marker; that is
        // completion.
        let status = if snapshot.status == Status::Running {
            Some(Status::Complete)
        } else {
            None
        };
        ctx.emitter
            .emit(EventPayload::Task(TaskEvent::WorkflowEnded {
                status: status.unwrap_or(snapshot.status),
            }));

        Ok(StateUpdate {
            work_report: Some(narrative),
            status,
            ..StateUpdate::default()
        })
    }
}
