//! The workflow state record and its component types.
//!
//! A single [`WorkflowState`] record flows through the whole graph. Nodes
//! never mutate it directly: they return [`StateUpdate`](crate::update::StateUpdate)
//! patches that the [`StateStore`](crate::store::StateStore) applies through
//! declared reducers. Subscribers and node handlers only ever see cloned
//! snapshots.
//!
//! The record groups into:
//!
//! - **Immutable inputs**: `user_request`, `repo_root`
//! - **Scope**: `remit`, `milestones`, `active_milestone_index`
//! - **Sliding window**: `done_list` (append-only), per-milestone rollup
//!   paragraphs, `carry_forward`
//! - **Current task** (ephemeral, cleared on task boundary)
//! - **Routing controls**: planner action, verdict, escalation context,
//!   correction hint
//! - **Counters**: review cadence, retry ledger, urgency
//! - **Directives**: supervisory input to the planner
//! - **Status**: lifecycle, error, final work report
//!
//! # Examples
//!
//! ```rust
//! use gaffer::state::{Milestone, WorkflowState};
//!
//! let mut state = WorkflowState::new("add titanium resource", ".");
//! state.milestones = vec![Milestone::new("titanium resource usable by player", "")];
//! assert!(state.check_invariants().is_ok());
//! assert!(state.active_milestone().is_some());
//! ```

use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::types::{PlannerAction, Status, Verdict};

/// Maximum length of the remit, in characters.
pub const REMIT_MAX: usize = 1_000;
/// Maximum length of a milestone description, in characters.
pub const MILESTONE_DESC_MAX: usize = 200;
/// Maximum length of a done-entry result summary, in characters.
pub const RESULT_SUMMARY_MAX: usize = 300;
/// Maximum length of QA feedback, in characters.
pub const QA_FEEDBACK_MAX: usize = 500;
/// Maximum length of a single carry-forward item, in characters.
pub const CARRY_ITEM_MAX: usize = 100;
/// Maximum number of carry-forward items held between planner rounds.
pub const CARRY_MAX: usize = 10;
/// Maximum length of a correction hint, in characters.
pub const CORRECTION_HINT_MAX: usize = 200;
/// Number of done-list entries the planner sees in full; older entries are
/// folded into the per-milestone rollup paragraph.
pub const DONE_WINDOW: usize = 7;

/// A user-observable interim outcome, not an implementation step.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Milestone {
    /// User-testable outcome, at most [`MILESTONE_DESC_MAX`] chars.
    pub description: String,
    /// Rough, non-binding work themes ("data models", "state integration").
    pub sketch: String,
}

impl Milestone {
    pub fn new(description: impl Into<String>, sketch: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            sketch: sketch.into(),
        }
    }
}

/// One entry of the monotonic done list.
///
/// An entry is appended exactly once per task boundary (complete or failed)
/// and never mutated or removed afterwards.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DoneEntry {
    pub task_description: String,
    /// What happened, at most [`RESULT_SUMMARY_MAX`] chars.
    pub result_summary: String,
    /// QA feedback or escalation context, at most [`QA_FEEDBACK_MAX`] chars.
    pub qa_feedback: String,
    /// Which milestone the task belonged to.
    pub milestone_index: usize,
    /// `true` when the task was abandoned rather than completed.
    pub failed: bool,
    pub when: DateTime<Utc>,
}

/// Rolling compaction of done-list entries older than the window, one per
/// milestone. `covered` counts how many of that milestone's entries the
/// paragraph already folds in, so compaction stays incremental.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MilestoneRollup {
    pub paragraph: String,
    pub covered: usize,
}

/// Whether a directive changes behaviour or tidies up after it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DirectiveKind {
    /// Prepends to the planner's carry-forward.
    Functional,
    /// Appends to the planner's carry-forward.
    Cleanup,
}

/// Directive priority. Critical directives interrupt the planner's own
/// ordering and must be addressed first.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DirectivePriority {
    Critical,
    #[default]
    Normal,
}

/// A supervisory instruction queued for the planner.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Directive {
    /// Queue-assigned identifier; used to track in-flight consumption.
    pub id: u64,
    pub kind: DirectiveKind,
    /// Who issued the directive (an external supervisor name).
    pub source: String,
    pub description: String,
    pub rationale: String,
    pub priority: DirectivePriority,
}

/// The implementor's report for the current task.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImplementationResult {
    /// Repo-relative paths the implementor claims to have modified.
    pub files_modified: Vec<String>,
    pub result_summary: String,
    pub issues: Vec<String>,
    pub success: bool,
}

/// The QA node's result for the current task. A failed QA result is a
/// routing outcome, not an error.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QaResult {
    pub passed: bool,
    /// Assessment text handed to the planner on retry, ≤ [`QA_FEEDBACK_MAX`].
    pub feedback: String,
    pub issues: Vec<String>,
}

/// Why an invariant check refused a state.
#[derive(Clone, Debug, PartialEq, thiserror::Error, miette::Diagnostic)]
pub enum InvariantViolation {
    #[error("active milestone index {index} out of range ({count} milestones) while running")]
    #[diagnostic(code(gaffer::state::milestone_index))]
    MilestoneIndex { index: usize, count: usize },

    #[error("attempt count {attempts} exceeds max attempts {max}")]
    #[diagnostic(code(gaffer::state::attempts))]
    AttemptOverflow { attempts: u32, max: u32 },

    #[error("urgency {0} is negative")]
    #[diagnostic(code(gaffer::state::urgency))]
    NegativeUrgency(f32),
}

/// The single record mutated by successive node updates.
///
/// Owned exclusively by the engine; everything else sees clones. See the
/// module docs for the field groups and what each one means.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkflowState {
    // Immutable inputs
    pub user_request: String,
    pub repo_root: PathBuf,

    // Scope
    pub remit: String,
    pub milestones: Vec<Milestone>,
    pub active_milestone_index: usize,

    // Sliding window
    /// Monotonic log of completed and failed tasks. Append-only.
    pub done_list: Vec<DoneEntry>,
    /// Rolling compaction paragraph per milestone index, maintained by the
    /// planner for entries older than [`DONE_WINDOW`].
    pub done_rollup: FxHashMap<usize, MilestoneRollup>,
    /// Rough task sketches passed between planner rounds; every item is
    /// reconsidered each round.
    pub carry_forward: Vec<String>,

    // Current task (ephemeral)
    pub current_task_description: Option<String>,
    pub current_implementation_plan: Option<String>,
    pub current_implementation_result: Option<ImplementationResult>,
    pub current_qa_result: Option<QaResult>,

    // Routing controls
    pub task_planner_action: Option<PlannerAction>,
    pub escalation_context: Option<String>,
    pub correction_hint: Option<String>,
    pub divergence_analysis: Option<String>,
    /// Rolled-up done list handed to the scope agent on re-plan.
    pub prior_work: Option<String>,
    pub last_verdict: Option<Verdict>,

    // Counters
    pub tasks_since_last_review: u32,
    pub review_interval: u32,
    /// Retries consumed for the current task.
    pub attempt_count: u32,
    /// Total attempts allowed per task (initial attempt plus retries).
    pub max_attempts: u32,
    /// Accumulating failure-signal scalar; pulls the next review forward.
    pub urgency: f32,
    /// Aborts within the active milestone; ≥ 2 forces escalation to scope.
    pub milestone_aborts: u32,
    /// Planner rounds so far, capped by `--max-iterations`.
    pub planner_rounds: u64,

    // Directives
    pub pending_directives: Vec<Directive>,
    /// Directives consumed by the current task; dropped at the task boundary.
    pub directives_in_flight: Vec<Directive>,

    // Status
    pub status: Status,
    pub error: Option<String>,
    pub work_report: Option<String>,

    /// Store-maintained version, bumped once per applied update.
    pub version: u64,
}

impl WorkflowState {
    /// Create a fresh running state for a user request against a repository.
    pub fn new(user_request: impl Into<String>, repo_root: impl Into<PathBuf>) -> Self {
        Self {
            user_request: user_request.into(),
            repo_root: repo_root.into(),
            remit: String::new(),
            milestones: Vec::new(),
            active_milestone_index: 0,
            done_list: Vec::new(),
            done_rollup: FxHashMap::default(),
            carry_forward: Vec::new(),
            current_task_description: None,
            current_implementation_plan: None,
            current_implementation_result: None,
            current_qa_result: None,
            task_planner_action: None,
            escalation_context: None,
            correction_hint: None,
            divergence_analysis: None,
            prior_work: None,
            last_verdict: None,
            tasks_since_last_review: 0,
            review_interval: 5,
            attempt_count: 0,
            max_attempts: 3,
            urgency: 0.0,
            milestone_aborts: 0,
            planner_rounds: 0,
            pending_directives: Vec::new(),
            directives_in_flight: Vec::new(),
            status: Status::Running,
            error: None,
            work_report: None,
            version: 0,
        }
    }

    /// The milestone currently being worked, if any.
    #[must_use]
    pub fn active_milestone(&self) -> Option<&Milestone> {
        self.milestones.get(self.active_milestone_index)
    }

    /// The last `n` done-list entries, most recent last.
    #[must_use]
    pub fn recent_done(&self, n: usize) -> &[DoneEntry] {
        let start = self.done_list.len().saturating_sub(n);
        &self.done_list[start..]
    }

    /// Done entries for the active milestone since the window start.
    #[must_use]
    pub fn done_for_milestone(&self, index: usize) -> Vec<&DoneEntry> {
        self.done_list
            .iter()
            .filter(|e| e.milestone_index == index)
            .collect()
    }

    /// Rollup for a milestone, if the planner has produced one.
    #[must_use]
    pub fn rollup_for(&self, index: usize) -> Option<&MilestoneRollup> {
        self.done_rollup.get(&index)
    }

    /// QA feedback for the retry path, present only while a failed QA result
    /// is waiting for the planner.
    #[must_use]
    pub fn last_qa_feedback(&self) -> Option<&QaResult> {
        match &self.current_qa_result {
            Some(qa) if !qa.passed => Some(qa),
            _ => None,
        }
    }

    /// Whether the per-task retry budget still allows another attempt.
    ///
    /// `attempt_count` counts retries consumed, so a task with
    /// `max_attempts = 3` runs at most three times: the initial attempt plus
    /// two retries.
    #[must_use]
    pub fn retry_available(&self) -> bool {
        self.attempt_count + 1 < self.max_attempts
    }

    /// Flatten the done list into a short rolled-up paragraph for the scope
    /// agent's re-plan entry.
    #[must_use]
    pub fn rolled_up_prior_work(&self) -> String {
        let mut parts: Vec<String> = Vec::new();
        let mut rollups: Vec<_> = self.done_rollup.iter().collect();
        rollups.sort_by_key(|(index, _)| **index);
        for (index, rollup) in rollups {
            parts.push(format!("milestone {index}: {}", rollup.paragraph));
        }
        for entry in self.recent_done(DONE_WINDOW) {
            let outcome = if entry.failed { "failed" } else { "done" };
            parts.push(format!(
                "[{outcome}] {} -> {}",
                entry.task_description, entry.result_summary
            ));
        }
        parts.join("\n")
    }

    /// Structural invariants checked after every applied update.
    pub fn check_invariants(&self) -> Result<(), InvariantViolation> {
        if self.status == Status::Running
            && !self.milestones.is_empty()
            && self.active_milestone_index >= self.milestones.len()
        {
            return Err(InvariantViolation::MilestoneIndex {
                index: self.active_milestone_index,
                count: self.milestones.len(),
            });
        }
        if self.attempt_count > self.max_attempts {
            return Err(InvariantViolation::AttemptOverflow {
                attempts: self.attempt_count,
                max: self.max_attempts,
            });
        }
        if self.urgency < 0.0 {
            return Err(InvariantViolation::NegativeUrgency(self.urgency));
        }
        Ok(())
    }
}

/// Truncate a string to a character budget, preferring a sentence boundary
/// when one exists in the second half of the budget.
#[must_use]
pub fn clamp_chars(text: &str, max_chars: usize) -> String {
    let count = text.chars().count();
    if count <= max_chars {
        return text.to_string();
    }
    let hard: String = text.chars().take(max_chars).collect();
    let floor = max_chars / 3;
    for boundary in [". ", "! ", "? ", "\n"] {
        if let Some(pos) = hard.rfind(boundary) {
            if pos >= floor {
                return hard[..pos + 1].trim_end().to_string();
            }
        }
    }
    hard
}

/// Resolve a repo-relative path against a root, rejecting escapes.
pub fn resolve_in_repo(repo_root: &Path, relative: &str) -> Option<PathBuf> {
    let candidate = Path::new(relative);
    if candidate.is_absolute() {
        return None;
    }
    let mut depth: i32 = 0;
    for component in candidate.components() {
        match component {
            std::path::Component::ParentDir => {
                depth -= 1;
                if depth < 0 {
                    return None;
                }
            }
            std::path::Component::Normal(_) => depth += 1,
            std::path::Component::CurDir => {}
            _ => return None,
        }
    }
    Some(repo_root.join(candidate))
}
