//! Agent invocation: role binding, budgets, and the tool-call loop.
//!
//! The [`AgentInvoker`] is the only place the engine touches an LLM. It
//! binds a role-tagged model (primary / summarizer / research / supervisor),
//! advertises a declared tool set, drives the function-calling loop until
//! the model answers in text, and enforces the per-agent input budget with
//! the compressive [`SummarizationMiddleware`] as the soft edge and
//! [`BudgetError`] as the hard one.
//!
//! Degradation rules, in order of preference:
//!
//! - a non-primary role model that is unreachable falls back to primary
//!   (once per invocation);
//! - a failing tool is retried once, then its error is surfaced into the
//!   conversation as structured text — never swallowed;
//! - a conversation over the threshold is compressed; a conversation still
//!   over the agent budget after compression raises [`BudgetError`].

pub mod chat;
pub mod middleware;
pub mod normaliser;

use miette::Diagnostic;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use crate::events::{classify_segments, EventEmitter, EventPayload, MessageKind, ToolLifecycle};
use crate::tools::{call_with_retry, Tool};
use crate::types::NodeName;
use chat::{
    estimate_conversation_tokens, ChatError, ChatMessage, ChatModel, ChatRequest, ChatResponse,
    ToolSpec,
};
use middleware::SummarizationMiddleware;
use normaliser::{Normaliser, Normalised, NormaliserError, Schema};

pub use chat::OpenAiCompatClient;

/// Capability tag an agent invocation is addressed to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Role {
    /// The main reasoning model; also the universal fallback.
    Primary,
    /// Digest and compression work.
    Summarizer,
    /// Codebase and web research subagents.
    Research,
    /// Assessment and oversight.
    Supervisor,
}

/// Role-to-model binding, resolved at construction: roles without a
/// configured model are bound to primary.
#[derive(Clone)]
pub struct RoleModels {
    primary: Arc<dyn ChatModel>,
    summarizer: Arc<dyn ChatModel>,
    research: Arc<dyn ChatModel>,
    supervisor: Arc<dyn ChatModel>,
}

impl RoleModels {
    pub fn resolve(
        primary: Arc<dyn ChatModel>,
        summarizer: Option<Arc<dyn ChatModel>>,
        research: Option<Arc<dyn ChatModel>>,
        supervisor: Option<Arc<dyn ChatModel>>,
    ) -> Self {
        Self {
            summarizer: summarizer.unwrap_or_else(|| Arc::clone(&primary)),
            research: research.unwrap_or_else(|| Arc::clone(&primary)),
            supervisor: supervisor.unwrap_or_else(|| Arc::clone(&primary)),
            primary,
        }
    }

    #[must_use]
    pub fn for_role(&self, role: Role) -> &Arc<dyn ChatModel> {
        match role {
            Role::Primary => &self.primary,
            Role::Summarizer => &self.summarizer,
            Role::Research => &self.research,
            Role::Supervisor => &self.supervisor,
        }
    }
}

/// Hard budget violation after the soft recovery failed.
#[derive(Debug, Error, Diagnostic)]
#[error("{agent}: input of ~{estimated_tokens} tokens exceeds the {budget_tokens}-token budget")]
#[diagnostic(
    code(gaffer::invoker::budget),
    help("The conversation stayed over budget even after summarisation; the engine routes this to the retry path.")
)]
pub struct BudgetError {
    pub agent: NodeName,
    pub estimated_tokens: usize,
    pub budget_tokens: usize,
}

/// Errors surfaced by an agent invocation.
#[derive(Debug, Error, Diagnostic)]
pub enum InvokerError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Budget(#[from] BudgetError),

    #[error(transparent)]
    #[diagnostic(code(gaffer::invoker::chat))]
    Chat(#[from] ChatError),

    #[error("{agent}: tool loop exceeded {rounds} rounds without a final answer")]
    #[diagnostic(code(gaffer::invoker::tool_loop))]
    ToolLoopExceeded { agent: NodeName, rounds: usize },
}

/// One agent invocation.
pub struct AgentRequest {
    /// Which node this invocation belongs to (event attribution, budgets).
    pub agent: NodeName,
    pub role: Role,
    pub system_prompt: String,
    pub user_prompt: String,
    pub tools: Vec<Arc<dyn Tool>>,
    /// Advisory input budget in tokens for this agent.
    pub max_input_tokens: usize,
}

/// The final text an agent produced, with loop statistics.
#[derive(Clone, Debug)]
pub struct AgentReply {
    pub text: String,
    pub rounds: usize,
    pub tool_calls: usize,
}

/// Invokes agents by role with bound tools and enforced budgets.
pub struct AgentInvoker {
    models: RoleModels,
    middleware: SummarizationMiddleware,
    normaliser: Normaliser,
    emitter: EventEmitter,
    max_tool_rounds: usize,
}

impl AgentInvoker {
    pub fn new(
        models: RoleModels,
        emitter: EventEmitter,
        summarize_threshold_tokens: usize,
    ) -> Self {
        let summarizer = Arc::clone(models.for_role(Role::Summarizer));
        Self {
            middleware: SummarizationMiddleware::new(
                Arc::clone(&summarizer),
                summarize_threshold_tokens,
            ),
            normaliser: Normaliser::new(Some(summarizer)),
            models,
            emitter,
            max_tool_rounds: 12,
        }
    }

    /// The shared normaliser, wired with the summariser role.
    #[must_use]
    pub fn normaliser(&self) -> &Normaliser {
        &self.normaliser
    }

    /// Invoke an agent and normalise its final answer against a schema.
    pub async fn invoke_structured(
        &self,
        request: AgentRequest,
        schema: &Schema,
    ) -> Result<(Normalised, AgentReply), StructuredInvokeError> {
        let reply = self.invoke(request).await?;
        let normalised = self.normaliser.normalise(&reply.text, schema).await?;
        Ok((normalised, reply))
    }

    /// Invoke an agent: drive the tool loop to a final text answer.
    pub async fn invoke(&self, request: AgentRequest) -> Result<AgentReply, InvokerError> {
        let emitter = self.emitter.for_node(request.agent);
        let mut messages = vec![
            ChatMessage::system(request.system_prompt.clone()),
            ChatMessage::user(request.user_prompt.clone()),
        ];
        self.enforce_budget(&request, &mut messages).await?;

        let specs: Vec<ToolSpec> = request
            .tools
            .iter()
            .map(|tool| ToolSpec {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                parameters: tool.parameters(),
            })
            .collect();

        let mut total_tool_calls = 0usize;
        for round in 0..self.max_tool_rounds {
            if self.middleware.over_threshold(&messages) {
                self.middleware.compress(&mut messages).await;
                self.enforce_budget(&request, &mut messages).await?;
            }

            let response = self
                .complete_with_fallback(request.role, request.agent, &messages, &specs)
                .await?;

            if !response.content.trim().is_empty() {
                for (kind, text) in classify_segments(&response.content) {
                    emitter.emit(EventPayload::Message { kind, text });
                }
            }

            if response.tool_calls.is_empty() {
                return Ok(AgentReply {
                    text: response.content,
                    rounds: round + 1,
                    tool_calls: total_tool_calls,
                });
            }

            messages.push(ChatMessage {
                role: ChatMessage::ASSISTANT.into(),
                content: response.content.clone(),
                tool_calls: response.tool_calls.clone(),
                tool_call_id: None,
            });

            for call in &response.tool_calls {
                total_tool_calls += 1;
                emitter.emit(EventPayload::Tool(ToolLifecycle::Start {
                    name: call.name.clone(),
                    args: compact(&call.arguments, 240),
                }));
                let outcome = self.run_tool(&request.tools, &call.name, &call.arguments).await;
                let (content, ok) = match outcome {
                    Ok(value) => (value.to_string(), true),
                    Err(message) => (message, false),
                };
                emitter.emit(EventPayload::Tool(ToolLifecycle::End {
                    name: call.name.clone(),
                    output: compact_str(&content, 240),
                    ok,
                }));
                emitter.emit(EventPayload::Message {
                    kind: MessageKind::ToolResult,
                    text: compact_str(&content, 480),
                });
                messages.push(ChatMessage::tool_result(call.id.clone(), content));
            }
        }

        Err(InvokerError::ToolLoopExceeded {
            agent: request.agent,
            rounds: self.max_tool_rounds,
        })
    }

    /// Budget enforcement: advisory until summarisation has had its one
    /// attempt, hard afterwards.
    async fn enforce_budget(
        &self,
        request: &AgentRequest,
        messages: &mut Vec<ChatMessage>,
    ) -> Result<(), InvokerError> {
        let estimated = estimate_conversation_tokens(messages);
        if estimated <= request.max_input_tokens {
            return Ok(());
        }
        debug!(
            agent = %request.agent,
            estimated,
            budget = request.max_input_tokens,
            "input over budget; attempting compression"
        );
        self.middleware.compress(messages).await;
        let estimated = estimate_conversation_tokens(messages);
        if estimated > request.max_input_tokens * 2 {
            return Err(InvokerError::Budget(BudgetError {
                agent: request.agent,
                estimated_tokens: estimated,
                budget_tokens: request.max_input_tokens,
            }));
        }
        Ok(())
    }

    async fn complete_with_fallback(
        &self,
        role: Role,
        agent: NodeName,
        messages: &[ChatMessage],
        specs: &[ToolSpec],
    ) -> Result<ChatResponse, InvokerError> {
        let request = ChatRequest {
            messages: messages.to_vec(),
            tools: specs.to_vec(),
            max_tokens: 16_384,
        };
        let model = self.models.for_role(role);
        match model.complete(request.clone()).await {
            Ok(response) => Ok(response),
            Err(error) if role != Role::Primary && error.is_unavailable() => {
                warn!(
                    agent = %agent,
                    model = model.label(),
                    %error,
                    "role model unavailable; falling back to primary"
                );
                let fallback = self.models.for_role(Role::Primary);
                Ok(fallback.complete(request).await?)
            }
            Err(error) => Err(error.into()),
        }
    }

    async fn run_tool(
        &self,
        tools: &[Arc<dyn Tool>],
        name: &str,
        arguments: &Value,
    ) -> Result<Value, String> {
        let Some(tool) = tools.iter().find(|tool| tool.name() == name) else {
            return Err(format!("ERROR: unknown tool `{name}`"));
        };
        call_with_retry(tool.as_ref(), arguments.clone())
            .await
            .map_err(|error| format!("ERROR: {error}"))
    }
}

/// Either half of a structured invocation can fail; callers convert both
/// into their node-specific failure.
#[derive(Debug, Error, Diagnostic)]
pub enum StructuredInvokeError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Invoke(#[from] InvokerError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Normalise(#[from] NormaliserError),
}

fn compact(value: &Value, limit: usize) -> String {
    compact_str(&value.to_string(), limit)
}

fn compact_str(text: &str, limit: usize) -> String {
    let squashed: String = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if squashed.chars().count() > limit {
        let cut: String = squashed.chars().take(limit.saturating_sub(3)).collect();
        format!("{cut}...")
    } else {
        squashed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::chat::ToolCallRequest;
    use crate::events::StreamDispatcher;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::collections::VecDeque;

    /// Deterministic model replaying canned responses.
    pub struct ScriptedModel {
        replies: Mutex<VecDeque<ChatResponse>>,
    }

    impl ScriptedModel {
        pub fn new(replies: Vec<ChatResponse>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
            }
        }
    }

    #[async_trait]
    impl ChatModel for ScriptedModel {
        fn label(&self) -> String {
            "scripted".into()
        }
        async fn complete(&self, _request: ChatRequest) -> Result<ChatResponse, ChatError> {
            self.replies.lock().pop_front().ok_or(ChatError::Exhausted)
        }
    }

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "echoes its arguments"
        }
        fn parameters(&self) -> Value {
            json!({"type": "object"})
        }
        async fn call(&self, args: Value) -> Result<Value, crate::tools::ToolError> {
            Ok(json!({"echoed": args}))
        }
    }

    fn invoker_with(replies: Vec<ChatResponse>) -> AgentInvoker {
        let model: Arc<dyn ChatModel> = Arc::new(ScriptedModel::new(replies));
        let models = RoleModels::resolve(model, None, None, None);
        let dispatcher = StreamDispatcher::new();
        AgentInvoker::new(models, EventEmitter::new(dispatcher), 30_000)
    }

    fn request(tools: Vec<Arc<dyn Tool>>) -> AgentRequest {
        AgentRequest {
            agent: NodeName::TaskPlanner,
            role: Role::Primary,
            system_prompt: "system".into(),
            user_prompt: "user".into(),
            tools,
            max_input_tokens: 12_000,
        }
    }

    #[tokio::test]
    async fn plain_answer_returns_without_tools() {
        let invoker = invoker_with(vec![ChatResponse {
            content: "done".into(),
            tool_calls: Vec::new(),
        }]);
        let reply = invoker.invoke(request(Vec::new())).await.unwrap();
        assert_eq!(reply.text, "done");
        assert_eq!(reply.rounds, 1);
        assert_eq!(reply.tool_calls, 0);
    }

    #[tokio::test]
    async fn tool_loop_executes_and_feeds_back() {
        let invoker = invoker_with(vec![
            ChatResponse {
                content: String::new(),
                tool_calls: vec![ToolCallRequest {
                    id: "call_1".into(),
                    name: "echo".into(),
                    arguments: json!({"x": 1}),
                }],
            },
            ChatResponse {
                content: "finished".into(),
                tool_calls: Vec::new(),
            },
        ]);
        let reply = invoker
            .invoke(request(vec![Arc::new(EchoTool)]))
            .await
            .unwrap();
        assert_eq!(reply.text, "finished");
        assert_eq!(reply.rounds, 2);
        assert_eq!(reply.tool_calls, 1);
    }

    #[tokio::test]
    async fn unknown_tool_is_surfaced_not_swallowed() {
        let invoker = invoker_with(vec![
            ChatResponse {
                content: String::new(),
                tool_calls: vec![ToolCallRequest {
                    id: "call_1".into(),
                    name: "nonexistent".into(),
                    arguments: json!({}),
                }],
            },
            ChatResponse {
                content: "recovered".into(),
                tool_calls: Vec::new(),
            },
        ]);
        let reply = invoker.invoke(request(Vec::new())).await.unwrap();
        assert_eq!(reply.text, "recovered");
    }

    #[tokio::test]
    async fn hard_budget_exceed_raises() {
        let invoker = invoker_with(vec![]);
        let mut req = request(Vec::new());
        req.max_input_tokens = 10;
        req.user_prompt = "x".repeat(400);
        let err = invoker.invoke(req).await.unwrap_err();
        assert!(matches!(err, InvokerError::Budget(_)));
    }
}
