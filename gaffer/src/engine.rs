//! The driver loop: select node → invoke → apply → emit → route.
//!
//! The engine owns the [`StateStore`] exclusively and runs one node at a
//! time. Everything observable leaves through the [`StreamDispatcher`];
//! everything durable arrives as a [`StateUpdate`] patch. Cancellation is
//! cooperative (checked at node boundaries) and the planner-round cap
//! guarantees termination despite the graph's two legitimate cycles.
//!
//! # Failure policy
//!
//! The engine never panics and a node error never escapes raw:
//!
//! | failing node | policy |
//! |---|---|
//! | scope        | terminal: status=failed, [`EngineError::Scope`] |
//! | planner      | synthetic abort with escalation context |
//! | implementor  | failed implementation result; QA pre-step catches it |
//! | qa           | failed QA result; retry ledger routes it |
//! | assessor     | aligned verdict, counters reset, work continues |
//! | bookkeeping / report | terminal failure (these are deterministic) |

use miette::Diagnostic;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, instrument, warn};

use crate::config::EngineConfig;
use crate::events::{EventEmitter, EventPayload, NodeLifecycle, StreamDispatcher, TaskEvent};
use crate::invoker::chat::ChatModel;
use crate::invoker::{AgentInvoker, OpenAiCompatClient, Role, RoleModels};
use crate::nodes::{
    AssessorNode, ImplementorNode, IncrementAttemptNode, MarkCompleteNode, MarkFailedNode,
    NodeContext, NodeError, NodeHandler, QaNode, ReportNode, ScopeAgentNode, ScopeError,
    TaskPlannerNode,
};
use crate::router;
use crate::state::{
    Directive, DirectiveKind, DirectivePriority, ImplementationResult, QaResult, WorkflowState,
};
use crate::store::{StateStore, StoreError};
use crate::tools::fs::{
    ApplyEdit, CreateFile, FindFilesByName, ListDirectory, ReadFile, ReadFileLines, SearchFiles,
    WriteFile, WriteLog,
};
use crate::tools::retrieval::{DisabledWebSearch, RagSearch, Retriever, WebSearch, WebSearchBackend};
use crate::tools::subagents::{Ask, ExplainCode};
use crate::tools::Tool;
use crate::types::{Next, NodeName, PlannerAction, Status};
use crate::update::{Field, StateUpdate, UrgencySignal};

/// Hook called with a state snapshot after every task boundary
/// (`mark_complete` / `mark_failed`); external persistence plugs in here.
pub type CheckpointHook = Box<dyn Fn(&WorkflowState) + Send + Sync>;

/// Unrecoverable engine failures (exit code 2 territory).
#[derive(Debug, Error, Diagnostic)]
pub enum EngineError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Scope(ScopeError),

    #[error("node {node} is not registered")]
    #[diagnostic(code(gaffer::engine::missing_node))]
    MissingNode { node: NodeName },

    #[error("deterministic node {node} failed: {message}")]
    #[diagnostic(code(gaffer::engine::deterministic))]
    Deterministic { node: NodeName, message: String },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),
}

/// Handle external supervisors use to queue directives for the planner.
///
/// Submissions are drained into the workflow state at the next planner
/// boundary; ids are assigned here and stay stable through consumption.
#[derive(Clone, Default)]
pub struct DirectiveQueue {
    inner: Arc<Mutex<DirectiveQueueInner>>,
}

#[derive(Default)]
struct DirectiveQueueInner {
    next_id: u64,
    pending: Vec<Directive>,
}

impl DirectiveQueue {
    /// Queue a directive; returns its assigned id.
    pub fn submit(
        &self,
        kind: DirectiveKind,
        priority: DirectivePriority,
        source: impl Into<String>,
        description: impl Into<String>,
        rationale: impl Into<String>,
    ) -> u64 {
        let mut inner = self.inner.lock();
        inner.next_id += 1;
        let id = inner.next_id;
        inner.pending.push(Directive {
            id,
            kind,
            source: source.into(),
            description: description.into(),
            rationale: rationale.into(),
            priority,
        });
        id
    }

    fn drain(&self) -> Vec<Directive> {
        std::mem::take(&mut self.inner.lock().pending)
    }
}

/// The workflow engine.
pub struct Engine {
    store: StateStore,
    nodes: FxHashMap<NodeName, Arc<dyn NodeHandler>>,
    dispatcher: Arc<StreamDispatcher>,
    emitter: EventEmitter,
    cancel: Arc<AtomicBool>,
    checkpoint: Option<CheckpointHook>,
    max_iterations: Option<u64>,
    directives: DirectiveQueue,
}

impl Engine {
    /// Start building an engine for one request against one repository.
    pub fn builder(
        user_request: impl Into<String>,
        repo_root: impl Into<PathBuf>,
    ) -> EngineBuilder {
        EngineBuilder::new(user_request, repo_root)
    }

    /// Cooperative cancellation flag; set it from a signal handler.
    #[must_use]
    pub fn cancellation_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Queue handle for external supervisors.
    #[must_use]
    pub fn directive_queue(&self) -> DirectiveQueue {
        self.directives.clone()
    }

    /// The dispatcher, for attaching subscribers before `run`.
    #[must_use]
    pub fn dispatcher(&self) -> Arc<StreamDispatcher> {
        Arc::clone(&self.dispatcher)
    }

    /// Drive the graph to a terminal state and return it.
    #[instrument(skip(self), fields(request = %self.store.state().user_request))]
    pub async fn run(mut self) -> Result<WorkflowState, EngineError> {
        let mut current = NodeName::ScopeAgent;
        let mut step: u64 = 0;

        loop {
            step += 1;
            if self.cancel.load(Ordering::SeqCst) {
                warn!("cancellation requested; stopping at node boundary");
                self.apply_silent(StateUpdate::failed("cancelled by user"));
                self.emitter
                    .emit(EventPayload::Task(TaskEvent::WorkflowEnded {
                        status: Status::Failed,
                    }));
                return Ok(self.store.snapshot());
            }

            if current == NodeName::TaskPlanner {
                if let Some(cap) = self.max_iterations {
                    if self.store.state().planner_rounds >= cap {
                        warn!(cap, "planner round cap exhausted");
                        self.apply_silent(StateUpdate::failed(format!(
                            "planner round cap of {cap} exhausted before the scope was satisfied"
                        )));
                        current = NodeName::Report;
                        continue;
                    }
                }
                let queued = self.directives.drain();
                if !queued.is_empty() {
                    info!(count = queued.len(), "draining supervisor directives");
                    self.apply_silent(StateUpdate {
                        push_directives: queued,
                        ..StateUpdate::default()
                    });
                }
            }

            let handler = self
                .nodes
                .get(&current)
                .cloned()
                .ok_or(EngineError::MissingNode { node: current })?;
            let node_emitter = self.emitter.for_node(current);
            node_emitter.emit(EventPayload::Node(NodeLifecycle::Start));

            let snapshot = self.store.snapshot();
            let ctx = NodeContext {
                node: current,
                step,
                emitter: node_emitter.clone(),
            };
            let outcome = handler.run(snapshot, ctx).await;

            match outcome {
                Ok(update) => {
                    let touched = match self.store.apply(update) {
                        Ok(touched) => touched,
                        Err(store_error) => {
                            error!(node = %current, %store_error, "update rejected");
                            node_emitter.emit(EventPayload::Node(NodeLifecycle::Error {
                                error: store_error.to_string(),
                            }));
                            self.handle_node_failure(
                                current,
                                NodeError::Internal {
                                    node: current,
                                    message: store_error.to_string(),
                                },
                            )?;
                            self.route_and_continue(&mut current)?;
                            continue;
                        }
                    };
                    node_emitter.emit(EventPayload::Node(NodeLifecycle::End {
                        summary: touched.join(","),
                    }));
                }
                Err(node_error) => {
                    error!(node = %current, %node_error, "node failed");
                    node_emitter.emit(EventPayload::Node(NodeLifecycle::Error {
                        error: node_error.to_string(),
                    }));
                    self.handle_node_failure(current, node_error)?;
                }
            }

            if matches!(current, NodeName::MarkComplete | NodeName::MarkFailed) {
                if let Some(hook) = &self.checkpoint {
                    hook(self.store.state());
                }
            }
            if current == NodeName::Report {
                break;
            }
            self.route_and_continue(&mut current)?;
        }

        let final_state = self.store.snapshot();
        info!(status = %final_state.status, tasks = final_state.done_list.len(), "workflow ended");
        Ok(final_state)
    }

    fn route_and_continue(&self, current: &mut NodeName) -> Result<(), EngineError> {
        match router::next(*current, self.store.state()) {
            Next::Node(next) => {
                *current = next;
                Ok(())
            }
            // Only the reporter routes to End, and the loop breaks before
            // routing it; a different End here is a graph defect.
            Next::End => Err(EngineError::Deterministic {
                node: *current,
                message: "unexpected END before the reporter ran".into(),
            }),
        }
    }

    /// Apply the per-node failure policy. Returns an error only for the
    /// terminal cases.
    fn handle_node_failure(
        &mut self,
        node: NodeName,
        node_error: NodeError,
    ) -> Result<(), EngineError> {
        match node {
            NodeName::ScopeAgent => {
                self.apply_silent(StateUpdate::failed(node_error.to_string()));
                self.emitter
                    .emit(EventPayload::Task(TaskEvent::WorkflowEnded {
                        status: Status::Failed,
                    }));
                Err(EngineError::Scope(match node_error {
                    NodeError::Scope(scope) => scope,
                    other => ScopeError::Unusable {
                        message: other.to_string(),
                    },
                }))
            }
            NodeName::TaskPlanner => {
                // Planner failure is an abort with synthetic escalation.
                let rounds = self.store.state().planner_rounds + 1;
                self.apply_silent(StateUpdate {
                    task_planner_action: Field::Set(PlannerAction::Abort),
                    escalation_context: Field::Set(format!(
                        "planner failed to produce an action: {node_error}"
                    )),
                    urgency: Some(UrgencySignal::Add(1.0)),
                    planner_rounds: Some(rounds),
                    ..StateUpdate::default()
                });
                Ok(())
            }
            NodeName::Implementor => {
                // A failed result lets the QA pre-step fail deterministically
                // and the retry ledger take over.
                self.apply_silent(StateUpdate {
                    current_implementation_result: Field::Set(ImplementationResult {
                        files_modified: Vec::new(),
                        result_summary: format!("implementor failed: {node_error}"),
                        issues: vec![node_error.to_string()],
                        success: false,
                    }),
                    ..StateUpdate::default()
                });
                Ok(())
            }
            NodeName::Qa => {
                self.apply_silent(StateUpdate {
                    current_qa_result: Field::Set(QaResult {
                        passed: false,
                        feedback: format!("qa could not assess: {node_error}"),
                        issues: vec![node_error.to_string()],
                    }),
                    urgency: Some(UrgencySignal::Add(0.3)),
                    ..StateUpdate::default()
                });
                Ok(())
            }
            NodeName::Assessor => {
                // Assessment failure must not halt work; assume aligned.
                self.apply_silent(StateUpdate {
                    last_verdict: Field::Set(crate::types::Verdict::Aligned),
                    tasks_since_last_review: Some(0),
                    urgency: Some(UrgencySignal::Reset(0.0)),
                    escalation_context: Field::Clear,
                    ..StateUpdate::default()
                });
                Ok(())
            }
            NodeName::MarkComplete
            | NodeName::MarkFailed
            | NodeName::IncrementAttempt
            | NodeName::Report => {
                self.apply_silent(StateUpdate::failed(node_error.to_string()));
                Err(EngineError::Deterministic {
                    node,
                    message: node_error.to_string(),
                })
            }
        }
    }

    /// Apply an engine-synthesised update; these are built to satisfy the
    /// invariants, so rejection is a programming error worth logging loudly
    /// but not worth crashing over.
    fn apply_silent(&mut self, update: StateUpdate) {
        if let Err(store_error) = self.store.apply(update) {
            error!(%store_error, "engine-synthesised update rejected");
        }
    }
}

/// Assembles an [`Engine`] with its invoker, tools, and node registry.
pub struct EngineBuilder {
    user_request: String,
    repo_root: PathBuf,
    config: EngineConfig,
    primary: Option<Arc<dyn ChatModel>>,
    summarizer: Option<Arc<dyn ChatModel>>,
    research: Option<Arc<dyn ChatModel>>,
    supervisor: Option<Arc<dyn ChatModel>>,
    retriever: Option<Arc<dyn Retriever>>,
    web_search: Option<Arc<dyn WebSearchBackend>>,
    dispatcher: Option<Arc<StreamDispatcher>>,
    checkpoint: Option<CheckpointHook>,
}

impl EngineBuilder {
    pub fn new(user_request: impl Into<String>, repo_root: impl Into<PathBuf>) -> Self {
        Self {
            user_request: user_request.into(),
            repo_root: repo_root.into(),
            config: EngineConfig::local_default(),
            primary: None,
            summarizer: None,
            research: None,
            supervisor: None,
            retriever: None,
            web_search: None,
            dispatcher: None,
            checkpoint: None,
        }
    }

    #[must_use]
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Inject a model for a role, overriding the configured endpoint.
    #[must_use]
    pub fn with_model(mut self, role: Role, model: Arc<dyn ChatModel>) -> Self {
        match role {
            Role::Primary => self.primary = Some(model),
            Role::Summarizer => self.summarizer = Some(model),
            Role::Research => self.research = Some(model),
            Role::Supervisor => self.supervisor = Some(model),
        }
        self
    }

    #[must_use]
    pub fn with_retriever(mut self, retriever: Arc<dyn Retriever>) -> Self {
        self.retriever = Some(retriever);
        self
    }

    #[must_use]
    pub fn with_web_search(mut self, backend: Arc<dyn WebSearchBackend>) -> Self {
        self.web_search = Some(backend);
        self
    }

    #[must_use]
    pub fn with_dispatcher(mut self, dispatcher: Arc<StreamDispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    #[must_use]
    pub fn with_checkpoint_hook(mut self, hook: CheckpointHook) -> Self {
        self.checkpoint = Some(hook);
        self
    }

    /// Wire everything and produce a runnable engine.
    #[must_use]
    pub fn build(self) -> Engine {
        let config = self.config;
        let dispatcher = self.dispatcher.unwrap_or_else(StreamDispatcher::new);
        let emitter = EventEmitter::new(Arc::clone(&dispatcher));

        let primary: Arc<dyn ChatModel> = self
            .primary
            .unwrap_or_else(|| Arc::new(OpenAiCompatClient::new(config.roles.primary.clone())));
        let endpoint_model = |endpoint: &Option<crate::config::ModelEndpoint>| {
            endpoint
                .as_ref()
                .map(|e| Arc::new(OpenAiCompatClient::new(e.clone())) as Arc<dyn ChatModel>)
        };
        let models = RoleModels::resolve(
            Arc::clone(&primary),
            self.summarizer.or_else(|| endpoint_model(&config.roles.summarizer)),
            self.research.or_else(|| endpoint_model(&config.roles.research)),
            self.supervisor.or_else(|| endpoint_model(&config.roles.supervisor)),
        );
        let invoker = Arc::new(AgentInvoker::new(
            models,
            emitter.clone(),
            config.summarize_threshold_tokens,
        ));

        let repo_root = &self.repo_root;
        let write_log = WriteLog::new();

        // Read-only research surface shared by the subagents.
        let mut research_tools: Vec<Arc<dyn Tool>> = vec![
            Arc::new(ReadFile::new(repo_root)),
            Arc::new(ReadFileLines::new(repo_root)),
            Arc::new(ListDirectory::new(repo_root)),
            Arc::new(FindFilesByName::new(repo_root)),
            Arc::new(SearchFiles::new(repo_root)),
        ];
        if let Some(retriever) = &self.retriever {
            research_tools.push(Arc::new(RagSearch::new(Arc::clone(retriever))));
        }
        let web_backend = self
            .web_search
            .unwrap_or_else(|| Arc::new(DisabledWebSearch));

        let scope_tools: Vec<Arc<dyn Tool>> = vec![
            Arc::new(ExplainCode::new(
                Arc::clone(&invoker),
                research_tools.clone(),
                NodeName::ScopeAgent,
            )),
            Arc::new(Ask::new(
                Arc::clone(&invoker),
                research_tools.clone(),
                NodeName::ScopeAgent,
            )),
            Arc::new(WebSearch::new(Arc::clone(&web_backend))),
            Arc::new(ListDirectory::new(repo_root)),
        ];

        let mut planner_tools: Vec<Arc<dyn Tool>> = vec![
            Arc::new(ExplainCode::new(
                Arc::clone(&invoker),
                research_tools.clone(),
                NodeName::TaskPlanner,
            )),
            Arc::new(Ask::new(
                Arc::clone(&invoker),
                research_tools.clone(),
                NodeName::TaskPlanner,
            )),
            Arc::new(WebSearch::new(web_backend)),
            Arc::new(FindFilesByName::new(repo_root)),
            Arc::new(ReadFileLines::new(repo_root)),
            Arc::new(SearchFiles::new(repo_root)),
        ];
        if let Some(retriever) = &self.retriever {
            planner_tools.push(Arc::new(RagSearch::new(Arc::clone(retriever))));
        }

        let implementor_tools: Vec<Arc<dyn Tool>> = vec![
            Arc::new(ReadFile::new(repo_root)),
            Arc::new(ReadFileLines::new(repo_root)),
            Arc::new(WriteFile::new(repo_root, write_log.clone())),
            Arc::new(ApplyEdit::new(repo_root, write_log.clone())),
            Arc::new(CreateFile::new(repo_root, write_log.clone())),
            Arc::new(FindFilesByName::new(repo_root)),
            Arc::new(SearchFiles::new(repo_root)),
        ];

        let budgets = config.budgets;
        let mut nodes: FxHashMap<NodeName, Arc<dyn NodeHandler>> = FxHashMap::default();
        nodes.insert(
            NodeName::ScopeAgent,
            Arc::new(ScopeAgentNode::new(
                Arc::clone(&invoker),
                scope_tools,
                budgets.for_agent(NodeName::ScopeAgent),
            )),
        );
        nodes.insert(
            NodeName::TaskPlanner,
            Arc::new(TaskPlannerNode::new(
                Arc::clone(&invoker),
                planner_tools,
                budgets.for_agent(NodeName::TaskPlanner),
            )),
        );
        nodes.insert(
            NodeName::Implementor,
            Arc::new(ImplementorNode::new(
                Arc::clone(&invoker),
                implementor_tools,
                write_log,
                budgets.for_agent(NodeName::Implementor),
            )),
        );
        nodes.insert(
            NodeName::Qa,
            Arc::new(QaNode::new(
                Arc::clone(&invoker),
                budgets.for_agent(NodeName::Qa),
            )),
        );
        nodes.insert(
            NodeName::Assessor,
            Arc::new(AssessorNode::new(
                Arc::clone(&invoker),
                budgets.for_agent(NodeName::Assessor),
            )),
        );
        nodes.insert(NodeName::MarkComplete, Arc::new(MarkCompleteNode));
        nodes.insert(NodeName::MarkFailed, Arc::new(MarkFailedNode));
        nodes.insert(NodeName::IncrementAttempt, Arc::new(IncrementAttemptNode));
        nodes.insert(NodeName::Report, Arc::new(ReportNode::new(invoker)));

        let mut state = WorkflowState::new(self.user_request, self.repo_root);
        state.review_interval = config.review_interval;
        state.max_attempts = config.max_attempts;

        Engine {
            store: StateStore::new(state),
            nodes,
            dispatcher,
            emitter,
            cancel: Arc::new(AtomicBool::new(false)),
            checkpoint: self.checkpoint,
            max_iterations: config.max_iterations,
            directives: DirectiveQueue::default(),
        }
    }
}
