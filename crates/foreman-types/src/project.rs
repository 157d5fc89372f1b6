// Run and task model
// Core type definitions shared by the graph, engine, and persistence layer.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

// ============================================================================
// Run configuration
// ============================================================================

/// Configuration for an orchestration run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Maximum tasks executed concurrently
    pub parallel_tasks: usize,
    /// Per-task overall timeout in seconds
    pub task_timeout_secs: u64,
    /// Default attempts per task before it fails terminally
    pub max_attempts: u32,
    /// Block dependents when a prerequisite fails
    pub fail_fast: bool,
    /// Commit the working tree after each completed task
    pub auto_commit: bool,
    /// Push the feature branch during finalization
    pub push_to_remote: bool,
    /// Open a pull request during finalization
    pub create_pr: bool,
    /// Base branch for the pull request
    pub pr_base_branch: String,
    /// Maximum wall-clock runtime in hours
    pub max_runtime_hours: f64,
    /// Ceiling on total task attempts across the run
    pub max_total_iterations: u32,
    /// Agent id used for the planning phase
    pub planner_agent: String,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            parallel_tasks: 2,
            task_timeout_secs: 600,
            max_attempts: 3,
            fail_fast: true,
            auto_commit: true,
            push_to_remote: false,
            create_pr: false,
            pr_base_branch: "main".to_string(),
            max_runtime_hours: 4.0,
            max_total_iterations: 50,
            planner_agent: "architect".to_string(),
        }
    }
}

// ============================================================================
// Run state
// ============================================================================

/// State of an orchestration run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// Run created, nothing started yet
    Intake,
    /// Planner agent is generating the task list
    Planning,
    /// Plan parsed and validated, ready to execute
    PlanReady,
    /// Executing tasks
    Executing,
    /// Running quality gates
    Verifying,
    /// No task is ready but non-terminal tasks remain
    Blocked,
    /// Paused by the caller; resume-state has been persisted
    Paused,
    /// Cancelled by the caller
    Cancelled,
    /// All tasks terminal, finalization finished
    Done,
    /// Terminated with an error
    Failed,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Intake => "intake",
            Self::Planning => "planning",
            Self::PlanReady => "plan_ready",
            Self::Executing => "executing",
            Self::Verifying => "verifying",
            Self::Blocked => "blocked",
            Self::Paused => "paused",
            Self::Cancelled => "cancelled",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "intake" => Self::Intake,
            "planning" => Self::Planning,
            "plan_ready" => Self::PlanReady,
            "executing" => Self::Executing,
            "verifying" => Self::Verifying,
            "blocked" => Self::Blocked,
            "paused" => Self::Paused,
            "cancelled" => Self::Cancelled,
            "done" => Self::Done,
            "failed" => Self::Failed,
            _ => return None,
        })
    }
}

/// A complete orchestration run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    /// Opaque run identifier
    pub id: String,
    /// Human-readable name, used for branch and PR titles
    pub name: String,
    /// The original development request
    pub original_prompt: String,
    /// Workspace directory the run operates in
    pub workspace_path: String,
    pub config: RunConfig,
    pub state: RunState,
    /// Raw plan JSON as returned by the planner (persisted verbatim)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_json: Option<String>,
    /// Serialized graph snapshot for resume
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub graph_snapshot: Option<String>,
    /// Resume-state key; must be set before the run is paused
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Total task attempts consumed so far
    pub total_iterations: u32,
    pub created_at: chrono::DateTime<chrono::Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paused_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl Run {
    pub fn new(name: String, original_prompt: String, workspace_path: String, config: RunConfig) -> Self {
        Self {
            id: crate::short_id(),
            name,
            original_prompt,
            workspace_path,
            config,
            state: RunState::Intake,
            plan_json: None,
            graph_snapshot: None,
            resume_state: None,
            branch_name: None,
            pr_url: None,
            error: None,
            total_iterations: 0,
            created_at: chrono::Utc::now(),
            started_at: None,
            paused_at: None,
            completed_at: None,
        }
    }
}

// ============================================================================
// Task state
// ============================================================================

/// Status of a task node in the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting on prerequisites
    Pending,
    /// Every prerequisite completed; eligible for scheduling
    Ready,
    /// Agent is executing
    Running,
    /// Running quality gates
    Verifying,
    /// Completed successfully
    Completed,
    /// Failed after exhausting attempts
    Failed,
    /// Skipped intentionally
    Skipped,
    /// A prerequisite failed or was skipped
    Blocked,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Verifying => "verifying",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Blocked => "blocked",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => Self::Pending,
            "ready" => Self::Ready,
            "running" => Self::Running,
            "verifying" => Self::Verifying,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            "skipped" => Self::Skipped,
            "blocked" => Self::Blocked,
            _ => return None,
        })
    }
}

// ============================================================================
// Quality gates
// ============================================================================

/// The closed set of quality gates a task may declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateKind {
    TestsPass,
    ReviewApproved,
    LintClean,
    TypeCheck,
    BuildSuccess,
}

impl GateKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TestsPass => "tests_pass",
            Self::ReviewApproved => "review_approved",
            Self::LintClean => "lint_clean",
            Self::TypeCheck => "type_check",
            Self::BuildSuccess => "build_success",
        }
    }

    /// Unknown gate names are dropped at plan parse, so this returns Option.
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "tests_pass" => Self::TestsPass,
            "review_approved" => Self::ReviewApproved,
            "lint_clean" => Self::LintClean,
            "type_check" => Self::TypeCheck,
            "build_success" => Self::BuildSuccess,
            _ => return None,
        })
    }
}

/// A quality gate attached to a task, with its latest outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityGate {
    pub kind: GateKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passed: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checked_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl QualityGate {
    pub fn new(kind: GateKind) -> Self {
        Self {
            kind,
            passed: None,
            error: None,
            checked_at: None,
        }
    }
}

/// Outcome of a single gate within an attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateResult {
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ============================================================================
// Attempts
// ============================================================================

/// One execution of a task: agent run plus one pass through its gates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attempt {
    pub number: u32,
    pub started_at: chrono::DateTime<chrono::Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
    pub success: bool,
    pub agent_response: String,
    /// Per-gate outcomes keyed by gate name
    #[serde(default)]
    pub gate_results: HashMap<String, GateResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_ref: Option<String>,
    /// Feedback for the next attempt, derived from the first failing gate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
}

impl Attempt {
    pub fn new(number: u32) -> Self {
        Self {
            number,
            started_at: chrono::Utc::now(),
            completed_at: None,
            success: false,
            agent_response: String::new(),
            gate_results: HashMap::new(),
            commit_ref: None,
            feedback: None,
        }
    }
}

// ============================================================================
// Tasks
// ============================================================================

/// A single task in the run's dependency graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub run_id: String,
    pub title: String,
    pub description: String,
    /// Agent designated to execute this task
    pub agent_id: String,
    /// Prerequisite task ids, in declared order
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Gates checked in declared order after each attempt
    #[serde(default)]
    pub quality_gates: Vec<QualityGate>,
    /// Advisory list of files the task is expected to touch
    #[serde(default)]
    pub target_files: Vec<String>,
    pub priority: i32,
    pub max_attempts: u32,
    /// With fail-fast off, a failed skippable task does not block dependents
    #[serde(default)]
    pub skippable: bool,
    pub status: TaskStatus,
    #[serde(default)]
    pub attempts: Vec<Attempt>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_commit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl Task {
    pub fn new(run_id: String, title: String, description: String, agent_id: String) -> Self {
        Self {
            id: crate::short_id(),
            run_id,
            title,
            description,
            agent_id,
            depends_on: Vec::new(),
            quality_gates: Vec::new(),
            target_files: Vec::new(),
            priority: 0,
            max_attempts: 3,
            skippable: false,
            status: TaskStatus::Pending,
            attempts: Vec::new(),
            final_commit: None,
            error: None,
            created_at: chrono::Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn current_attempt(&self) -> u32 {
        self.attempts.len() as u32
    }
}

// ============================================================================
// Artifacts
// ============================================================================

/// A named output produced by a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub id: String,
    pub run_id: String,
    pub task_id: String,
    /// Logical name, e.g. "dockerfile" or "api_schema"
    pub name: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Inline content, or None when only the hash is kept for large values
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    pub produced_by: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_state_round_trips_through_strings() {
        for state in [
            RunState::Intake,
            RunState::Planning,
            RunState::PlanReady,
            RunState::Executing,
            RunState::Verifying,
            RunState::Blocked,
            RunState::Paused,
            RunState::Cancelled,
            RunState::Done,
            RunState::Failed,
        ] {
            assert_eq!(RunState::parse(state.as_str()), Some(state));
        }
        assert_eq!(RunState::parse("bogus"), None);
    }

    #[test]
    fn terminal_states() {
        assert!(RunState::Done.is_terminal());
        assert!(RunState::Failed.is_terminal());
        assert!(RunState::Cancelled.is_terminal());
        assert!(!RunState::Paused.is_terminal());

        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Skipped.is_terminal());
        assert!(!TaskStatus::Blocked.is_terminal());
    }

    #[test]
    fn gate_kind_parse_drops_unknown() {
        assert_eq!(GateKind::parse("tests_pass"), Some(GateKind::TestsPass));
        assert_eq!(GateKind::parse("vibe_check"), None);
    }

    #[test]
    fn serde_uses_snake_case() {
        let json = serde_json::to_string(&TaskStatus::Ready).unwrap();
        assert_eq!(json, "\"ready\"");
        let json = serde_json::to_string(&GateKind::ReviewApproved).unwrap();
        assert_eq!(json, "\"review_approved\"");
    }

    #[test]
    fn short_ids_are_eight_chars() {
        let id = crate::short_id();
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
