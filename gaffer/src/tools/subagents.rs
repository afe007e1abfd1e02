//! Subagent tools: self-contained LLM loops exposed as tools.
//!
//! `explain_code` and `ask` are not graph nodes. They are modelled as
//! synchronous call/return capabilities that happen to run their own
//! research-role conversation internally — the trade of debug visibility
//! for flexibility noted in the design. Nested invocations emit message and
//! tool events but never node-lifecycle events.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;

use super::{required_str, Tool, ToolError};
use crate::invoker::{AgentInvoker, AgentRequest, Role};
use crate::types::NodeName;

/// Input budget for a research subagent invocation, in tokens.
const RESEARCH_BUDGET_TOKENS: usize = 8_000;

const EXPLAIN_CODE_SYSTEM_PROMPT: &str = "\
You are a codebase research agent. Answer the query by reading the actual \
code with the tools provided: search for candidate files, read the relevant \
ranges, then explain how the code works. Cite file paths and line numbers. \
If nothing relevant exists, say so plainly.";

const ASK_SYSTEM_PROMPT: &str = "\
You are a quick factual lookup agent for a codebase. Use the tools to check \
whether the asked-about thing exists and where. Answer in a few sentences; \
cite file paths. Do not speculate beyond what the tools showed you.";

/// Deep codebase research: "How does X work?", "What exists for Y?".
pub struct ExplainCode {
    invoker: Arc<AgentInvoker>,
    research_tools: Vec<Arc<dyn Tool>>,
    attribution: NodeName,
}

impl ExplainCode {
    pub fn new(
        invoker: Arc<AgentInvoker>,
        research_tools: Vec<Arc<dyn Tool>>,
        attribution: NodeName,
    ) -> Self {
        Self {
            invoker,
            research_tools,
            attribution,
        }
    }
}

#[async_trait]
impl Tool for ExplainCode {
    fn name(&self) -> &str {
        "explain_code"
    }
    fn description(&self) -> &str {
        "Deep codebase research: explains how something works, with file/line citations"
    }
    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {"query": {"type": "string"}},
            "required": ["query"]
        })
    }
    async fn call(&self, args: Value) -> Result<Value, ToolError> {
        let query = required_str(&args, "query", self.name())?;
        let reply = self
            .invoker
            .invoke(AgentRequest {
                agent: self.attribution,
                role: Role::Research,
                system_prompt: EXPLAIN_CODE_SYSTEM_PROMPT.into(),
                user_prompt: query.to_string(),
                tools: self.research_tools.clone(),
                max_input_tokens: RESEARCH_BUDGET_TOKENS,
            })
            .await
            .map_err(|error| ToolError::Failed {
                tool: self.name().into(),
                message: error.to_string(),
            })?;
        Ok(json!({"query": query, "explanation": reply.text}))
    }
}

/// Quick factual lookup: "Does X exist?", "Where is Y defined?".
pub struct Ask {
    invoker: Arc<AgentInvoker>,
    research_tools: Vec<Arc<dyn Tool>>,
    attribution: NodeName,
}

impl Ask {
    pub fn new(
        invoker: Arc<AgentInvoker>,
        research_tools: Vec<Arc<dyn Tool>>,
        attribution: NodeName,
    ) -> Self {
        Self {
            invoker,
            research_tools,
            attribution,
        }
    }
}

#[async_trait]
impl Tool for Ask {
    fn name(&self) -> &str {
        "ask"
    }
    fn description(&self) -> &str {
        "Quick factual codebase lookup; answers in a few cited sentences"
    }
    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {"query": {"type": "string"}},
            "required": ["query"]
        })
    }
    async fn call(&self, args: Value) -> Result<Value, ToolError> {
        let query = required_str(&args, "query", self.name())?;
        let reply = self
            .invoker
            .invoke(AgentRequest {
                agent: self.attribution,
                role: Role::Research,
                system_prompt: ASK_SYSTEM_PROMPT.into(),
                user_prompt: query.to_string(),
                tools: self.research_tools.clone(),
                max_input_tokens: RESEARCH_BUDGET_TOKENS,
            })
            .await
            .map_err(|error| ToolError::Failed {
                tool: self.name().into(),
                message: error.to_string(),
            })?;
        Ok(json!({"query": query, "answer": reply.text}))
    }
}
