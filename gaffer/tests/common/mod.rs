//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::Arc;

use gaffer::invoker::chat::{
    ChatError, ChatModel, ChatRequest, ChatResponse, ToolCallRequest,
};
use gaffer::state::{Milestone, WorkflowState};

/// Deterministic chat model replaying canned responses in order, recording
/// every request it saw for later assertions.
pub struct ScriptedModel {
    name: &'static str,
    replies: Mutex<VecDeque<ChatResponse>>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedModel {
    pub fn new(name: &'static str, replies: Vec<ChatResponse>) -> Arc<Self> {
        Arc::new(Self {
            name,
            replies: Mutex::new(replies.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    /// All user prompts this model received, in call order.
    pub fn user_prompts(&self) -> Vec<String> {
        self.requests
            .lock()
            .iter()
            .filter_map(|request| {
                request
                    .messages
                    .iter()
                    .find(|m| m.role == "user")
                    .map(|m| m.content.clone())
            })
            .collect()
    }

    pub fn remaining(&self) -> usize {
        self.replies.lock().len()
    }
}

#[async_trait]
impl ChatModel for ScriptedModel {
    fn label(&self) -> String {
        format!("scripted:{}", self.name)
    }

    async fn complete(&self, request: ChatRequest) -> Result<ChatResponse, ChatError> {
        self.requests.lock().push(request);
        self.replies.lock().pop_front().ok_or(ChatError::Exhausted)
    }
}

/// A plain text reply (no tool calls).
pub fn text_reply(text: impl Into<String>) -> ChatResponse {
    ChatResponse {
        content: text.into(),
        tool_calls: Vec::new(),
    }
}

/// A reply that only requests tool calls.
pub fn tool_reply(calls: Vec<(&str, serde_json::Value)>) -> ChatResponse {
    ChatResponse {
        content: String::new(),
        tool_calls: calls
            .into_iter()
            .enumerate()
            .map(|(i, (name, arguments))| ToolCallRequest {
                id: format!("call_{i}"),
                name: name.to_string(),
                arguments,
            })
            .collect(),
    }
}

/// Scope output with one milestone per description given.
pub fn scope_reply(remit: &str, milestones: &[(&str, &str)]) -> ChatResponse {
    let items: Vec<_> = milestones
        .iter()
        .map(|(description, sketch)| json!({"description": description, "sketch": sketch}))
        .collect();
    text_reply(json!({"remit": remit, "milestones": items}).to_string())
}

/// Planner `implement` with a plan long enough to survive the thin-plan
/// demotion.
pub fn planner_implement(task: &str, plan_detail: &str) -> ChatResponse {
    let plan = format!(
        "# Implementation Plan: {task}\n\n## Changes\n{plan_detail}\n\n\
         The steps above are exhaustive; apply them exactly as written."
    );
    text_reply(
        json!({
            "action": "implement",
            "task_description": task,
            "implementation_plan": plan,
            "carry_forward": [],
        })
        .to_string(),
    )
}

pub fn planner_milestone_done() -> ChatResponse {
    text_reply(json!({"action": "milestone_done", "carry_forward": []}).to_string())
}

pub fn planner_abort(context: &str) -> ChatResponse {
    text_reply(
        json!({
            "action": "abort",
            "task_description": "infeasible task",
            "escalation_context": context,
            "carry_forward": [],
        })
        .to_string(),
    )
}

/// Implementor final summary claiming the given files.
pub fn implementor_summary(files: &[&str], summary: &str) -> ChatResponse {
    text_reply(
        json!({
            "files_modified": files,
            "result_summary": summary,
            "issues": [],
            "success": true,
        })
        .to_string(),
    )
}

pub fn qa_pass(feedback: &str) -> ChatResponse {
    text_reply(json!({"passed": true, "feedback": feedback, "issues": []}).to_string())
}

pub fn qa_fail(feedback: &str, issues: &[&str]) -> ChatResponse {
    text_reply(json!({"passed": false, "feedback": feedback, "issues": issues}).to_string())
}

pub fn assessor_verdict(verdict: &str, notes: &str) -> ChatResponse {
    text_reply(
        json!({"verdict": verdict, "assessment_notes": notes}).to_string(),
    )
}

pub fn assessor_divergence(analysis: &str) -> ChatResponse {
    text_reply(
        json!({
            "verdict": "major_divergence",
            "divergence_analysis": analysis,
        })
        .to_string(),
    )
}

/// A minimal running state with the given number of milestones.
pub fn state_with_milestones(count: usize) -> WorkflowState {
    let mut state = WorkflowState::new("test request", ".");
    state.milestones = (0..count)
        .map(|i| Milestone::new(format!("outcome {i}"), ""))
        .collect();
    state
}
