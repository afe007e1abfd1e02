//! End-to-end workflow scenarios against scripted models.
//!
//! Each scenario wires the real engine — real tools against a temp repo,
//! real reducers, real router — with deterministic chat models, and asserts
//! the literal behaviour the state machine promises.

mod common;

use common::*;
use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;

use gaffer::events::{EventPayload, StreamKind, TaskEvent};
use gaffer::invoker::Role;
use gaffer::{Engine, Status, WorkflowState};

struct Scenario {
    primary: Arc<ScriptedModel>,
    supervisor: Arc<ScriptedModel>,
    summarizer: Arc<ScriptedModel>,
    repo: tempfile::TempDir,
    checkpoints: Arc<Mutex<Vec<WorkflowState>>>,
}

impl Scenario {
    fn new(
        primary: Vec<gaffer::invoker::chat::ChatResponse>,
        supervisor: Vec<gaffer::invoker::chat::ChatResponse>,
    ) -> Self {
        Self {
            primary: ScriptedModel::new("primary", primary),
            supervisor: ScriptedModel::new("supervisor", supervisor),
            summarizer: ScriptedModel::new(
                "summarizer",
                vec![text_reply("Work finished as requested.")],
            ),
            repo: tempfile::tempdir().unwrap(),
            checkpoints: Arc::new(Mutex::new(Vec::new())),
        }
    }

    async fn run(&self) -> WorkflowState {
        let checkpoints = Arc::clone(&self.checkpoints);
        let engine = Engine::builder("test request", self.repo.path())
            .with_model(Role::Primary, self.primary.clone())
            .with_model(Role::Supervisor, self.supervisor.clone())
            .with_model(Role::Summarizer, self.summarizer.clone())
            .with_checkpoint_hook(Box::new(move |state| {
                checkpoints.lock().push(state.clone());
            }))
            .build();
        engine.run().await.expect("workflow should not error")
    }
}

/// One implement round: tool-call reply writing `path`, then the summary.
fn implement_round(
    task: &str,
    path: &str,
) -> Vec<gaffer::invoker::chat::ChatResponse> {
    vec![
        planner_implement(task, &format!("### Create: `{path}`\nwrite the module")),
        tool_reply(vec![(
            "write_file",
            json!({"path": path, "content": "pub fn titanium() -> u32 { 22 }\n"}),
        )]),
        implementor_summary(&[path], "implemented the change"),
    ]
}

#[tokio::test]
async fn trivial_path_completes_in_one_task() {
    let mut primary = vec![scope_reply(
        "add a titanium resource usable by the player",
        &[("titanium resource usable by player", "resource registry")],
    )];
    primary.push(planner_implement(
        "register titanium resource",
        "### Create: `src/resources/titanium.rs`\nregister it\n### Modify: `src/economy.rs`\nwire it in",
    ));
    primary.push(tool_reply(vec![
        (
            "write_file",
            json!({"path": "src/resources/titanium.rs", "content": "pub struct Titanium;\n"}),
        ),
        (
            "write_file",
            json!({"path": "src/economy.rs", "content": "pub mod registry;\n"}),
        ),
    ]));
    primary.push(implementor_summary(
        &["src/resources/titanium.rs", "src/economy.rs"],
        "registered titanium in the economy",
    ));
    primary.push(qa_pass("titanium is registered and wired"));
    primary.push(planner_milestone_done());

    let scenario = Scenario::new(
        primary,
        vec![assessor_verdict("milestone_complete", "all outcomes met")],
    );
    let state = scenario.run().await;

    assert_eq!(state.status, Status::Complete);
    assert_eq!(state.done_list.len(), 1);
    assert!(!state.done_list[0].failed);

    // At the task boundary the review counter was 1; the assessor reset it.
    let checkpoints = scenario.checkpoints.lock();
    assert_eq!(checkpoints.len(), 1);
    assert_eq!(checkpoints[0].tasks_since_last_review, 1);
    assert_eq!(state.tasks_since_last_review, 0);

    // Ephemeral task fields are cleared at the boundary.
    assert!(checkpoints[0].current_task_description.is_none());
    assert!(checkpoints[0].current_implementation_plan.is_none());
    assert!(checkpoints[0].current_implementation_result.is_none());
    assert!(checkpoints[0].current_qa_result.is_none());

    // Both files really exist in the repo.
    assert!(scenario.repo.path().join("src/resources/titanium.rs").is_file());
    assert!(scenario.repo.path().join("src/economy.rs").is_file());
    assert_eq!(scenario.primary.remaining(), 0);
}

#[tokio::test]
async fn retry_then_success_feeds_qa_feedback_to_planner() {
    let mut primary = vec![scope_reply(
        "add titanium",
        &[("titanium resource usable by player", "")],
    )];
    // First round: implemented but QA rejects it.
    primary.extend(implement_round("register titanium", "src/titanium.rs"));
    primary.push(qa_fail("registration is missing", &["missing registration"]));
    // Retry round.
    primary.extend(implement_round("register titanium properly", "src/titanium.rs"));
    primary.push(qa_pass("registration present"));
    primary.push(planner_milestone_done());

    let scenario = Scenario::new(
        primary,
        vec![assessor_verdict("milestone_complete", "done")],
    );
    let state = scenario.run().await;

    assert_eq!(state.status, Status::Complete);
    assert_eq!(state.done_list.len(), 1);
    assert!(!state.done_list[0].failed);
    assert_eq!(state.attempt_count, 0);
    // Initial round, retry round, milestone_done round.
    assert_eq!(state.planner_rounds, 3);

    // The retry round saw the QA feedback.
    let prompts = scenario.primary.user_prompts();
    assert!(prompts
        .iter()
        .any(|p| p.contains("RETRY CONTEXT") && p.contains("missing registration")));
}

#[tokio::test]
async fn retry_exhaustion_fails_task_and_invokes_assessor() {
    let mut primary = vec![scope_reply(
        "add titanium",
        &[("titanium resource usable by player", "")],
    )];
    for round in 0..3 {
        primary.push(planner_implement(
            &format!("attempt {round}"),
            "### Modify: `src/titanium.rs`\ntry again with the registration wiring",
        ));
        primary.push(tool_reply(vec![(
            "write_file",
            json!({"path": "src/titanium.rs", "content": "pub struct Titanium;\n"}),
        )]));
        primary.push(implementor_summary(&["src/titanium.rs"], "attempted"));
        primary.push(qa_fail("still missing registration", &["missing registration"]));
    }
    primary.push(planner_milestone_done());

    let scenario = Scenario::new(
        primary,
        vec![
            // Either verdict is legitimate after exhaustion; this run
            // continues within the milestone.
            assessor_verdict("aligned", "tactical dead end, plan on"),
            assessor_verdict("milestone_complete", "done"),
        ],
    );
    let state = scenario.run().await;

    assert_eq!(state.status, Status::Complete);
    assert_eq!(state.done_list.len(), 1);
    assert!(state.done_list[0].failed);

    // The failed-task checkpoint carries the accumulated urgency:
    // three QA failures at 0.3 each.
    let checkpoints = scenario.checkpoints.lock();
    assert_eq!(checkpoints.len(), 1);
    assert!(checkpoints[0].urgency >= 0.9 - f32::EPSILON);
    // Retries were capped at the ledger: initial attempt plus two retries.
    assert!(checkpoints[0].attempt_count <= checkpoints[0].max_attempts);
    // The assessor ran and reset the urgency.
    assert_eq!(state.urgency, 0.0);
}

#[tokio::test]
async fn periodic_review_triggers_after_review_interval_tasks() {
    let mut primary = vec![scope_reply(
        "five improvements",
        &[("improvements applied", "")],
    )];
    for i in 0..5 {
        primary.extend(implement_round(
            &format!("task {i}"),
            &format!("src/task_{i}.rs"),
        ));
        primary.push(qa_pass("fine"));
    }
    primary.push(planner_milestone_done());

    let scenario = Scenario::new(
        primary,
        vec![
            assessor_verdict("aligned", "periodic review"),
            assessor_verdict("milestone_complete", "done"),
        ],
    );
    let state = scenario.run().await;

    assert_eq!(state.status, Status::Complete);
    assert_eq!(state.done_list.len(), 5);

    let checkpoints = scenario.checkpoints.lock();
    assert_eq!(checkpoints.len(), 5);
    // The fifth completion reached the review interval...
    assert_eq!(checkpoints[4].tasks_since_last_review, 5);
    // ...and the assessor reset both counters.
    assert_eq!(state.tasks_since_last_review, 0);
    assert_eq!(state.urgency, 0.0);

    // The done list only ever grows.
    for pair in checkpoints.windows(2) {
        assert!(pair[0].done_list.len() <= pair[1].done_list.len());
        assert_eq!(pair[1].done_list[..pair[0].done_list.len()], pair[0].done_list[..]);
    }
}

#[tokio::test]
async fn milestone_advance_resets_window_and_counters() {
    let primary = vec![
        scope_reply(
            "two stage delivery",
            &[("stage one shipped", ""), ("stage two shipped", "")],
        ),
        planner_milestone_done(),
        planner_milestone_done(),
    ];
    let scenario = Scenario::new(
        primary,
        vec![
            assessor_verdict("milestone_complete", "stage one done"),
            assessor_verdict("milestone_complete", "stage two done"),
        ],
    );

    // Observe the advance on the task stream.
    let checkpoints = Arc::clone(&scenario.checkpoints);
    let engine = Engine::builder("test request", scenario.repo.path())
        .with_model(Role::Primary, scenario.primary.clone())
        .with_model(Role::Supervisor, scenario.supervisor.clone())
        .with_model(Role::Summarizer, scenario.summarizer.clone())
        .with_checkpoint_hook(Box::new(move |state| {
            checkpoints.lock().push(state.clone());
        }))
        .build();
    let task_events = engine.dispatcher().subscribe_channel(StreamKind::Task);
    let state = engine.run().await.unwrap();

    assert_eq!(state.status, Status::Complete);
    assert_eq!(state.active_milestone_index, 1);
    assert!(state.carry_forward.is_empty());
    assert_eq!(state.tasks_since_last_review, 0);

    let advances: Vec<(usize, String)> = task_events
        .drain()
        .filter_map(|event| match event.payload {
            EventPayload::Task(TaskEvent::MilestoneAdvanced { index, description }) => {
                Some((index, description))
            }
            _ => None,
        })
        .collect();
    assert_eq!(advances.len(), 1);
    assert_eq!(advances[0], (1, "stage two shipped".to_string()));
}

#[tokio::test]
async fn major_divergence_replans_from_active_milestone_forward() {
    let mut primary = vec![scope_reply(
        "two stage delivery",
        &[("stage one shipped", ""), ("stage two shipped", "")],
    )];
    // Finish milestone 0 with one real task so the done list has history.
    primary.extend(implement_round("stage one work", "src/stage_one.rs"));
    primary.push(qa_pass("fine"));
    primary.push(planner_milestone_done());
    // On milestone 1 the planner aborts, the assessor escalates, and the
    // scope agent re-plans the remainder.
    primary.push(planner_abort("stage two conflicts with the actual architecture"));
    primary.push(scope_reply(
        "two stage delivery, stage two revised",
        &[("stage two shipped via the adapter layer", "")],
    ));
    primary.push(planner_milestone_done());

    let scenario = Scenario::new(
        primary,
        vec![
            assessor_verdict("milestone_complete", "stage one done"),
            assessor_divergence("stage two was planned against the wrong architecture"),
            assessor_verdict("milestone_complete", "revised stage two done"),
        ],
    );
    let state = scenario.run().await;

    assert_eq!(state.status, Status::Complete);
    // Milestone 0 survived the re-plan untouched; milestone 1 was rewritten.
    assert_eq!(state.milestones.len(), 2);
    assert_eq!(state.milestones[0].description, "stage one shipped");
    assert_eq!(
        state.milestones[1].description,
        "stage two shipped via the adapter layer"
    );
    // The milestone-0 entry is still in the done list.
    assert!(state
        .done_list
        .iter()
        .any(|e| e.milestone_index == 0 && !e.failed));

    // The scope re-plan saw the prior work and the divergence analysis.
    let prompts = scenario.primary.user_prompts();
    assert!(prompts
        .iter()
        .any(|p| p.contains("DIVERGENCE ANALYSIS") && p.contains("PRIOR WORK")));
}
