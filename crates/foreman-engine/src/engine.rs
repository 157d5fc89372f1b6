// Orchestration engine
// Run state machine: intake -> planning -> plan_ready -> executing ->
// (verifying <-> executing)* -> done, with side transitions to paused,
// cancelled, and failed. Every transition is persisted before the loop
// moves on, so an interrupted run can resume after a process restart.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use serde_json::json;
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use foreman_guard::{
    ApprovalManager, AuditContext, AuditSink, GuardrailsEnforcer, PolicyRegistry,
};
use foreman_store::{
    ArtifactRepository, LogRepository, RunRepository, StoreError, TaskRepository,
};
use foreman_tools::{ToolInterpreter, ToolRegistry};
use foreman_types::{
    Attempt, EventKind, GateResult, OrchestratorEvent, Run, RunState, Task, TaskStatus,
};

use crate::agents::{AgentError, AgentRegistry, ChatMessage};
use crate::gates::{fix_feedback, GateConfig, GateRunner};
use crate::git::{sanitize_branch_name, GitOps};
use crate::graph::{GraphError, GraphSnapshot, NodeSnapshot, TaskGraph};
use crate::planner;
use crate::recovery::{backoff_delay, classify_error, FailureContext, FailureLog, RecoveryConfig};
use crate::runner::run_agent_with_tools;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("planning failed: {0}")]
    Planning(String),
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error("storage failure: {0}")]
    Store(#[from] StoreError),
    #[error(transparent)]
    Agent(#[from] AgentError),
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
}

/// Collaborators the engine consumes. No process-wide singletons: everything
/// is passed in explicitly.
pub struct EngineDeps {
    pub agents: AgentRegistry,
    /// Tools the interpreter executes on behalf of agents
    pub tools: ToolRegistry,
    /// Agent policies; the engine builds a fresh enforcer per agent turn
    pub policies: PolicyRegistry,
    pub approvals: Arc<ApprovalManager>,
    pub runs: RunRepository,
    pub tasks: TaskRepository,
    pub logs: LogRepository,
    pub artifacts: ArtifactRepository,
    pub audit: Arc<dyn AuditSink>,
    pub gate_config: GateConfig,
    pub recovery: RecoveryConfig,
}

/// Bound on each per-task event queue before emission is shed.
const TASK_QUEUE_CAPACITY: usize = 256;

enum LoopOutcome {
    Completed,
    Cancelled,
    Failed(String),
}

/// The orchestration engine for one run.
#[derive(Clone)]
pub struct Orchestrator {
    run_id: String,
    run: Arc<RwLock<Run>>,
    graph: Arc<RwLock<Option<TaskGraph>>>,
    deps: Arc<EngineDeps>,
    git: Arc<GitOps>,
    gates: Arc<GateRunner>,
    event_tx: mpsc::UnboundedSender<OrchestratorEvent>,
    cancel: CancellationToken,
    paused: Arc<RwLock<bool>>,
    started: Arc<RwLock<Option<Instant>>>,
    failures: Arc<FailureLog>,
}

impl Orchestrator {
    pub fn new(
        run: Run,
        deps: Arc<EngineDeps>,
        event_tx: mpsc::UnboundedSender<OrchestratorEvent>,
    ) -> Self {
        let workspace = PathBuf::from(&run.workspace_path);
        let gates = Arc::new(GateRunner::new(
            deps.agents.clone(),
            workspace.clone(),
            deps.gate_config.clone(),
        ));
        Self {
            run_id: run.id.clone(),
            run: Arc::new(RwLock::new(run)),
            graph: Arc::new(RwLock::new(None)),
            deps,
            git: Arc::new(GitOps::new(workspace)),
            gates,
            event_tx,
            cancel: CancellationToken::new(),
            paused: Arc::new(RwLock::new(false)),
            started: Arc::new(RwLock::new(None)),
            failures: Arc::new(FailureLog::default()),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn failure_log(&self) -> &FailureLog {
        &self.failures
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Drive a fresh run end to end: persist intake, plan, execute,
    /// finalize. Errors in planning or storage terminate the run as failed.
    pub async fn start(&self) -> Result<(), EngineError> {
        *self.started.write().await = Some(Instant::now());
        {
            let mut run = self.run.write().await;
            run.started_at = Some(chrono::Utc::now());
        }
        self.deps.runs.create(&self.run_snapshot().await)?;
        let name = self.run.read().await.name.clone();
        self.emit(EventKind::ProjectStarted, json!({ "name": name }));

        if let Err(e) = self.run_planning().await {
            self.handle_failure(&e.to_string()).await?;
            return Err(e);
        }

        if self.cancel.is_cancelled() {
            return self.handle_cancellation().await;
        }

        self.prepare_git().await?;
        self.set_state(RunState::Executing, None).await?;
        self.execute_and_finish().await
    }

    /// Continue a run reloaded from the store: the execution loop picks up
    /// where the persisted graph left off.
    pub async fn resume(&self) -> Result<(), EngineError> {
        {
            let run = self.run.read().await;
            if run.state.is_terminal() {
                return Err(EngineError::InvalidOperation(format!(
                    "run {} is already terminal",
                    run.id
                )));
            }
            if self.graph.read().await.is_none() {
                return Err(EngineError::InvalidOperation(
                    "run has no graph to resume".to_string(),
                ));
            }
        }
        *self.started.write().await = Some(Instant::now());
        *self.paused.write().await = false;
        self.set_state(RunState::Executing, None).await?;
        self.emit(EventKind::Resumed, json!({}));
        self.execute_and_finish().await
    }

    /// Request a cooperative pause; the loop persists the paused state at
    /// its next checkpoint.
    pub async fn pause(&self) {
        *self.paused.write().await = true;
    }

    /// Clear the pause flag; the waiting loop transitions back to executing.
    pub async fn unpause(&self) -> Result<(), EngineError> {
        let mut paused = self.paused.write().await;
        if !*paused {
            return Err(EngineError::InvalidOperation(
                "run is not paused".to_string(),
            ));
        }
        *paused = false;
        Ok(())
    }

    /// Cooperative cancellation: observed at loop heads and awaited
    /// operations.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Reset a failed task to ready and unblock its dependents, so the next
    /// execution pass retries it.
    pub async fn retry_task(&self, task_id: &str) -> Result<(), EngineError> {
        self.with_graph_mut(|graph| {
            graph.retry(task_id)?;
            graph.unblock_dependents(task_id);
            Ok::<(), GraphError>(())
        })
        .await??;
        self.deps
            .tasks
            .update_status(task_id, TaskStatus::Ready, None)?;
        self.persist_snapshot().await
    }

    // ========================================================================
    // Planning phase
    // ========================================================================

    async fn run_planning(&self) -> Result<(), EngineError> {
        self.set_state(RunState::Planning, None).await?;
        self.emit(EventKind::PlanningStarted, json!({}));

        let (planner_id, run_clone) = {
            let run = self.run.read().await;
            (run.config.planner_agent.clone(), run.clone())
        };

        self.emit(
            EventKind::ModelSelected,
            json!({ "phase": "planning", "agent": planner_id }),
        );

        let prompt = planner::build_planning_prompt(&run_clone);
        let timeout = std::time::Duration::from_secs(run_clone.config.task_timeout_secs);
        let response = self
            .invoke_agent(&planner_id, None, &prompt, timeout)
            .await
            .map_err(EngineError::Planning)?;

        if self.cancel.is_cancelled() {
            return Ok(());
        }

        let tasks = planner::parse_task_list(&response, &run_clone);
        let plan_json = serde_json::to_string(&tasks).unwrap_or_default();

        self.deps.tasks.create_many(&tasks)?;
        for task in &tasks {
            self.emit(
                EventKind::TaskCreated,
                json!({ "task_id": task.id, "title": task.title, "agent": task.agent_id }),
            );
        }

        // A cycle here is fatal to the run.
        let graph = TaskGraph::build(
            run_clone.id.clone(),
            tasks.clone(),
            run_clone.config.fail_fast,
        )?;
        *self.graph.write().await = Some(graph);

        {
            let mut run = self.run.write().await;
            run.plan_json = Some(plan_json);
        }
        self.set_state(RunState::PlanReady, None).await?;
        self.emit(
            EventKind::PlanningCompleted,
            json!({ "task_count": tasks.len() }),
        );
        Ok(())
    }

    async fn prepare_git(&self) -> Result<(), EngineError> {
        if !self.git.is_repo().await {
            self.git.init().await;
        }
        let (auto_commit, run_id, name) = {
            let run = self.run.read().await;
            (run.config.auto_commit, run.id.clone(), run.name.clone())
        };
        if auto_commit {
            let branch = format!("auto/{}-{}", run_id, sanitize_branch_name(&name));
            if self.git.create_branch(&branch).await {
                let mut run = self.run.write().await;
                run.branch_name = Some(branch);
            }
        }
        Ok(())
    }

    // ========================================================================
    // Execution loop
    // ========================================================================

    async fn execute_and_finish(&self) -> Result<(), EngineError> {
        match self.run_execution_loop().await? {
            LoopOutcome::Cancelled => Ok(()),
            LoopOutcome::Failed(reason) => self.handle_failure(&reason).await,
            LoopOutcome::Completed => {
                let has_failures = self
                    .with_graph(|graph| graph.has_failures() || !graph.all_terminal())
                    .await?;
                if has_failures {
                    self.handle_failure("One or more tasks failed").await
                } else {
                    self.finalize().await?;
                    self.set_state(RunState::Done, None).await?;
                    let pr_url = self.run.read().await.pr_url.clone();
                    self.emit(EventKind::ProjectCompleted, json!({ "pr_url": pr_url }));
                    Ok(())
                }
            }
        }
    }

    async fn run_execution_loop(&self) -> Result<LoopOutcome, EngineError> {
        let (parallel, max_iterations, max_runtime_hours) = {
            let run = self.run.read().await;
            (
                run.config.parallel_tasks.max(1),
                run.config.max_total_iterations,
                run.config.max_runtime_hours,
            )
        };
        let mut blocked_spins = 0u32;

        loop {
            if self.cancel.is_cancelled() {
                self.handle_cancellation().await?;
                return Ok(LoopOutcome::Cancelled);
            }

            if *self.paused.read().await {
                self.persist_pause().await?;
                self.emit(EventKind::Paused, json!({}));
                while *self.paused.read().await {
                    if self.cancel.is_cancelled() {
                        self.handle_cancellation().await?;
                        return Ok(LoopOutcome::Cancelled);
                    }
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                }
                self.set_state(RunState::Executing, None).await?;
                self.emit(EventKind::Resumed, json!({}));
            }

            // Global stop conditions.
            let total_iterations = self.run.read().await.total_iterations;
            if total_iterations >= max_iterations {
                return Ok(LoopOutcome::Failed(format!(
                    "Max total iterations ({}) exceeded",
                    max_iterations
                )));
            }
            let elapsed_hours = self
                .started
                .read()
                .await
                .map(|t| t.elapsed().as_secs_f64() / 3600.0)
                .unwrap_or(0.0);
            if elapsed_hours >= max_runtime_hours {
                self.emit(
                    EventKind::Timeout,
                    json!({ "elapsed_hours": elapsed_hours }),
                );
                return Ok(LoopOutcome::Failed(format!(
                    "Max runtime ({} hours) exceeded",
                    max_runtime_hours
                )));
            }

            let ready = self.with_graph(|graph| graph.ready_tasks()).await?;
            if ready.is_empty() {
                let complete = self.with_graph(|graph| graph.is_complete()).await?;
                if complete {
                    return Ok(LoopOutcome::Completed);
                }
                // Another task may still transition; give it two passes
                // before declaring deadlock.
                blocked_spins += 1;
                if blocked_spins > 2 {
                    return Ok(LoopOutcome::Failed(
                        "Deadlock detected - tasks blocked with no runnable work".to_string(),
                    ));
                }
                self.set_state(RunState::Blocked, None).await?;
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                continue;
            }
            blocked_spins = 0;

            let batch: Vec<String> = ready.into_iter().take(parallel).collect();
            self.run_batch(batch).await?;
        }
    }

    /// Run a batch of ready tasks concurrently. Each task yields events into
    /// its own queue; the engine drains the queues round-robin into the
    /// unified stream, so per-task ordering holds while cross-task ordering
    /// does not.
    async fn run_batch(&self, task_ids: Vec<String>) -> Result<(), EngineError> {
        let mut join: JoinSet<Result<(), EngineError>> = JoinSet::new();
        let mut queues: Vec<mpsc::Receiver<OrchestratorEvent>> = Vec::new();

        for task_id in task_ids {
            let (tx, rx) = mpsc::channel(TASK_QUEUE_CAPACITY);
            queues.push(rx);
            let engine = self.clone();
            join.spawn(async move { engine.run_task_with_feedback(task_id, tx).await });
        }

        while !join.is_empty() {
            for queue in queues.iter_mut() {
                while let Ok(event) = queue.try_recv() {
                    let _ = self.event_tx.send(event);
                }
            }
            tokio::select! {
                joined = join.join_next() => {
                    match joined {
                        Some(Ok(Ok(()))) => {}
                        Some(Ok(Err(e))) => tracing::error!("task execution error: {}", e),
                        Some(Err(e)) => tracing::error!("task join error: {}", e),
                        None => break,
                    }
                }
                _ = tokio::time::sleep(std::time::Duration::from_millis(20)) => {}
            }
        }
        for queue in queues.iter_mut() {
            while let Ok(event) = queue.try_recv() {
                let _ = self.event_tx.send(event);
            }
        }
        Ok(())
    }

    // ========================================================================
    // Per-task feedback loop
    // ========================================================================

    async fn run_task_with_feedback(
        &self,
        task_id: String,
        events: mpsc::Sender<OrchestratorEvent>,
    ) -> Result<(), EngineError> {
        let task = self
            .with_graph(|graph| graph.node(&task_id).map(|n| n.task.clone()))
            .await?
            .ok_or_else(|| EngineError::InvalidOperation(format!("unknown task {}", task_id)))?;
        let max_attempts = task.max_attempts.max(1);
        let task_timeout = {
            let run = self.run.read().await;
            std::time::Duration::from_secs(run.config.task_timeout_secs)
        };
        let mut feedback: Option<String> = None;

        for _ in 0..max_attempts {
            if self.cancel.is_cancelled() {
                return Ok(());
            }

            // Every attempt counts against the run-wide iteration ceiling.
            let over_budget = {
                let mut run = self.run.write().await;
                run.total_iterations += 1;
                run.total_iterations > run.config.max_total_iterations
            };
            if over_budget {
                let error = "Max total iterations exceeded";
                self.with_graph_mut(|graph| graph.mark_failed(&task_id, error))
                    .await??;
                self.deps
                    .tasks
                    .update_status(&task_id, TaskStatus::Failed, Some(error))?;
                self.persist_snapshot().await?;
                self.emit_to(
                    &events,
                    EventKind::TaskFailed,
                    json!({ "task_id": task_id, "reason": error }),
                );
                return Ok(());
            }

            self.with_graph_mut(|graph| {
                let status = graph
                    .node(&task_id)
                    .map(|n| n.status())
                    .unwrap_or(TaskStatus::Ready);
                if status == TaskStatus::Ready {
                    graph.mark_running(&task_id)
                } else {
                    graph.mark_retrying_in_place(&task_id)
                }
            })
            .await??;
            let attempt_number = self
                .with_graph(|graph| graph.node(&task_id).map(|n| n.attempt).unwrap_or(0))
                .await?;
            self.deps
                .tasks
                .update_status(&task_id, TaskStatus::Running, None)?;
            self.persist_snapshot().await?;

            self.emit_to(
                &events,
                EventKind::TaskStarted,
                json!({
                    "task_id": task_id,
                    "title": task.title,
                    "agent": task.agent_id,
                    "attempt": attempt_number,
                }),
            );
            self.emit_to(
                &events,
                EventKind::ModelSelected,
                json!({ "task_id": task_id, "agent": task.agent_id }),
            );

            let mut attempt = Attempt::new(attempt_number);
            let prompt = self.build_task_prompt(&task, feedback.as_deref());

            let invocation = self
                .invoke_agent(&task.agent_id, Some(&task_id), &prompt, task_timeout)
                .await;
            let response = match invocation {
                Ok(response) => response,
                Err(error_text) => {
                    let (kind, _) = classify_error(&error_text);
                    self.failures.record(FailureContext {
                        task_id: task_id.clone(),
                        agent_id: task.agent_id.clone(),
                        task_description: task.description.clone(),
                        failure_kind: kind,
                        error_message: error_text.clone(),
                        attempt: attempt_number,
                        max_attempts,
                        started_at: attempt.started_at,
                        failed_at: chrono::Utc::now(),
                        duration_seconds: (chrono::Utc::now() - attempt.started_at)
                            .num_milliseconds() as f64
                            / 1000.0,
                        last_checkpoint: None,
                        goals_completed: 0,
                        goals_total: 0,
                        response_so_far: None,
                    });
                    feedback = Some(format!("Agent error: {}", error_text));
                    attempt.completed_at = Some(chrono::Utc::now());
                    attempt.feedback = feedback.clone();
                    self.deps.tasks.record_attempt(&task_id, &attempt)?;
                    self.emit_to(
                        &events,
                        EventKind::Error,
                        json!({ "task_id": task_id, "error": error_text }),
                    );
                    if attempt_number < max_attempts {
                        let delay = backoff_delay(attempt_number, &self.deps.recovery);
                        tokio::time::sleep(delay).await;
                    }
                    continue;
                }
            };

            attempt.agent_response = response.clone();
            self.deps
                .logs
                .append(&self.run_id, &task_id, "agent response collected", None)?;
            self.emit_to(
                &events,
                EventKind::TaskAgentOutput,
                json!({
                    "task_id": task_id,
                    "output": response.chars().take(2000).collect::<String>(),
                }),
            );
            for marker in crate::agents::parse_markers(&response) {
                self.emit_to(
                    &events,
                    EventKind::TaskProgress,
                    json!({ "task_id": task_id, "marker": format!("{:?}", marker) }),
                );
            }

            self.with_graph_mut(|graph| graph.mark_verifying(&task_id))
                .await??;
            self.deps
                .tasks
                .update_status(&task_id, TaskStatus::Verifying, None)?;
            self.persist_snapshot().await?;

            // Gates run in declared order; the first failure short-circuits.
            let mut all_passed = true;
            for gate in &task.quality_gates {
                if self.cancel.is_cancelled() {
                    return Ok(());
                }
                let gate_name = gate.kind.as_str();
                self.emit_to(
                    &events,
                    EventKind::QualityGateCheck,
                    json!({ "task_id": task_id, "gate_type": gate_name }),
                );

                let (passed, error) = self.gates.check(&task, gate.kind, &response).await;
                attempt.gate_results.insert(
                    gate_name.to_string(),
                    GateResult {
                        passed,
                        error: error.clone(),
                    },
                );
                self.with_graph_mut(|graph| {
                    if let Some(node) = graph.node_mut(&task_id) {
                        node.verification.insert(gate_name.to_string(), passed);
                    }
                })
                .await?;

                if passed {
                    self.emit_to(
                        &events,
                        EventKind::QualityGatePassed,
                        json!({ "task_id": task_id, "gate_type": gate_name }),
                    );
                } else {
                    self.emit_to(
                        &events,
                        EventKind::QualityGateFailed,
                        json!({ "task_id": task_id, "gate_type": gate_name, "error": error }),
                    );
                    feedback = Some(fix_feedback(gate.kind, error.as_deref()));
                    attempt.feedback = feedback.clone();
                    all_passed = false;
                    break;
                }
            }

            attempt.completed_at = Some(chrono::Utc::now());
            attempt.success = all_passed;

            if all_passed {
                let auto_commit = self.run.read().await.config.auto_commit;
                if auto_commit && self.git.has_changes().await {
                    self.git.add_all().await;
                    let message = format!("feat: {}", task.title);
                    if self.git.commit(&message).await {
                        if let Some(sha) = self.git.last_commit().await {
                            attempt.commit_ref = Some(sha.clone());
                            self.deps.tasks.set_final_commit(&task_id, &sha)?;
                            self.emit_to(
                                &events,
                                EventKind::GitCommit,
                                json!({ "task_id": task_id, "sha": sha, "message": message }),
                            );
                        }
                    }
                }

                self.deps.tasks.record_attempt(&task_id, &attempt)?;
                self.with_graph_mut(|graph| graph.mark_completed(&task_id, Some(response)))
                    .await??;
                self.deps
                    .tasks
                    .update_status(&task_id, TaskStatus::Completed, None)?;

                // Named outputs recorded on the node become durable artifacts.
                let node_artifacts = self
                    .with_graph(|graph| {
                        graph
                            .node(&task_id)
                            .map(|n| n.artifacts.clone())
                            .unwrap_or_default()
                    })
                    .await?;
                for (artifact_name, value) in node_artifacts {
                    let content = value.to_string();
                    self.deps.artifacts.create(&foreman_types::Artifact {
                        id: uuid::Uuid::new_v4().to_string(),
                        run_id: self.run_id.clone(),
                        task_id: task_id.clone(),
                        name: artifact_name,
                        kind: "output".to_string(),
                        path: None,
                        content_hash: Some(foreman_guard::hash_content(&content)),
                        content: Some(content),
                        produced_by: task.agent_id.clone(),
                        created_at: chrono::Utc::now(),
                    })?;
                }
                self.persist_snapshot().await?;
                self.emit_to(
                    &events,
                    EventKind::TaskCompleted,
                    json!({
                        "task_id": task_id,
                        "attempts": attempt_number,
                        "commit_sha": attempt.commit_ref,
                    }),
                );
                return Ok(());
            }

            self.deps.tasks.record_attempt(&task_id, &attempt)?;
            self.persist_snapshot().await?;
            self.emit_to(
                &events,
                EventKind::TaskFixing,
                json!({
                    "task_id": task_id,
                    "attempt": attempt_number,
                    "feedback": feedback
                        .as_deref()
                        .unwrap_or("")
                        .chars()
                        .take(500)
                        .collect::<String>(),
                }),
            );
        }

        // Attempts exhausted.
        let error = format!("Failed after {} attempts", max_attempts);
        self.with_graph_mut(|graph| graph.mark_failed(&task_id, &error))
            .await??;
        self.deps
            .tasks
            .update_status(&task_id, TaskStatus::Failed, Some(&error))?;
        self.persist_blocked_statuses().await?;
        self.persist_snapshot().await?;
        self.emit_to(
            &events,
            EventKind::TaskFailed,
            json!({ "task_id": task_id, "reason": error, "attempts": max_attempts }),
        );
        Ok(())
    }

    fn build_task_prompt(&self, task: &Task, feedback: Option<&str>) -> String {
        let workspace = self.git.workspace().display().to_string();
        let files = if task.target_files.is_empty() {
            "Determine appropriate files".to_string()
        } else {
            task.target_files.join(", ")
        };
        let mut prompt = format!(
            "## Task\n{}\n\n## Description\n{}\n\n## Workspace\n{}\n\n## Target Files\n{}\n",
            task.title, task.description, workspace, files
        );
        if let Some(feedback) = feedback {
            prompt.push_str(&format!(
                "\n## Previous Attempt Feedback\n\
                 The previous attempt failed quality checks. Here's what needs to be fixed:\n{}\n\n\
                 Please address these issues in your implementation.\n",
                feedback
            ));
        }
        prompt.push_str(
            "\n## Instructions\n\
             1. Implement the task according to the description\n\
             2. Ensure code is clean and follows best practices\n\
             3. Include appropriate error handling\n\
             4. Add comments where helpful\n\n\
             Proceed with the implementation.\n",
        );
        prompt
    }

    /// Invoke an agent with the per-task timeout. The turn runs through the
    /// tool loop: tool-call blocks in the response execute via the
    /// interpreter under a fresh enforcer scoped to this agent, and results
    /// feed back until the agent answers without invocations. Errors come
    /// back as text so the attempt loop can classify and retry them.
    async fn invoke_agent(
        &self,
        agent_id: &str,
        task_id: Option<&str>,
        prompt: &str,
        timeout: std::time::Duration,
    ) -> Result<String, String> {
        let Some(agent) = self.deps.agents.get(agent_id).await else {
            return Err(format!("Agent not found: {}", agent_id));
        };
        let ctx = AuditContext::new(Some(&self.run_id), task_id, Some(agent_id));
        if let Err(e) = self.deps.audit.log_llm_exchange("request", prompt, &ctx) {
            tracing::warn!("llm audit logging failed: {}", e);
        }

        let enforcer = Arc::new(GuardrailsEnforcer::for_agent(
            &self.deps.policies,
            agent_id,
            Some(&self.run_id),
            task_id,
            self.deps.approvals.clone(),
            self.deps.audit.clone(),
        ));
        let mut interpreter = ToolInterpreter::new(self.deps.tools.clone(), enforcer);

        let workspace = self.git.workspace().display().to_string();
        let messages = vec![ChatMessage::user(prompt.to_string())];
        let context = json!({ "workspace": workspace });
        let work = run_agent_with_tools(agent.as_ref(), &mut interpreter, messages, context);

        let result = match tokio::time::timeout(timeout, work).await {
            Ok(Ok(outcome)) => Ok(outcome.response),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("Task timed out after {:?}", timeout)),
        };
        if let Ok(response) = &result {
            if let Err(e) = self.deps.audit.log_llm_exchange("response", response, &ctx) {
                tracing::warn!("llm audit logging failed: {}", e);
            }
        }
        result
    }

    // ========================================================================
    // Finalization
    // ========================================================================

    async fn finalize(&self) -> Result<(), EngineError> {
        let (push_to_remote, create_pr, pr_base, branch, name) = {
            let run = self.run.read().await;
            (
                run.config.push_to_remote,
                run.config.create_pr,
                run.config.pr_base_branch.clone(),
                run.branch_name.clone(),
                run.name.clone(),
            )
        };

        if push_to_remote && self.git.has_remote().await {
            if let Some(branch) = &branch {
                if self.git.push(branch, true).await {
                    self.emit(EventKind::GitPush, json!({ "branch": branch }));
                }
            }
        }

        if create_pr {
            if let Some(branch) = &branch {
                let body = self.generate_pr_body().await?;
                if let Some(url) = self
                    .git
                    .create_pull_request(&format!("[Auto] {}", name), &body, &pr_base, branch)
                    .await
                {
                    {
                        let mut run = self.run.write().await;
                        run.pr_url = Some(url.clone());
                    }
                    self.emit(EventKind::GitPrCreated, json!({ "url": url }));
                }
            }
        }
        Ok(())
    }

    async fn generate_pr_body(&self) -> Result<String, EngineError> {
        let (name, prompt, total_iterations) = {
            let run = self.run.read().await;
            (
                run.name.clone(),
                run.original_prompt.chars().take(500).collect::<String>(),
                run.total_iterations,
            )
        };
        self.with_graph(|graph| {
            let mut completed = Vec::new();
            let mut failed = Vec::new();
            for id in graph.topological_order() {
                if let Some(node) = graph.node(&id) {
                    match node.status() {
                        TaskStatus::Completed => completed.push(node.task.clone()),
                        TaskStatus::Failed => failed.push(node.task.clone()),
                        _ => {}
                    }
                }
            }

            let mut body = format!(
                "## Summary\nAuto-generated PR for: {}\n\n### Original Request\n{}\n\n\
                 ### Tasks Completed ({})\n",
                name,
                prompt,
                completed.len()
            );
            for task in &completed {
                body.push_str(&format!("- [x] {}", task.title));
                if let Some(sha) = &task.final_commit {
                    body.push_str(&format!(" ({})", sha));
                }
                body.push('\n');
            }
            if !failed.is_empty() {
                body.push_str(&format!("\n### Tasks Failed ({})\n", failed.len()));
                for task in &failed {
                    body.push_str(&format!(
                        "- [ ] {}: {}\n",
                        task.title,
                        task.error.as_deref().unwrap_or("Unknown error")
                    ));
                }
            }
            body.push_str(&format!(
                "\n### Statistics\n- Total iterations: {}\n- Tasks completed: {}/{}\n",
                total_iterations,
                completed.len(),
                graph.len()
            ));
            body
        })
        .await
    }

    // ========================================================================
    // Terminal handlers
    // ========================================================================

    /// Sweep every non-terminal task to skipped. Runs before any terminal
    /// run state lands, so a terminal run only contains terminal tasks.
    async fn skip_remaining_tasks(&self, reason: &str) {
        let to_skip = self
            .with_graph(|graph| {
                graph
                    .topological_order()
                    .into_iter()
                    .filter(|id| {
                        graph
                            .node(id)
                            .map(|n| !n.is_terminal())
                            .unwrap_or(false)
                    })
                    .collect::<Vec<_>>()
            })
            .await
            .unwrap_or_default();
        for id in to_skip {
            let _ = self
                .with_graph_mut(|graph| graph.mark_skipped(&id, reason))
                .await;
            let _ = self
                .deps
                .tasks
                .update_status(&id, TaskStatus::Skipped, Some(reason));
        }
    }

    /// Terminate the run as failed.
    async fn handle_failure(&self, reason: &str) -> Result<(), EngineError> {
        self.skip_remaining_tasks("Run failed before execution").await;
        let _ = self.persist_snapshot().await;
        self.set_state(RunState::Failed, Some(reason.to_string()))
            .await?;
        self.emit(EventKind::ProjectFailed, json!({ "error": reason }));
        Ok(())
    }

    /// Terminate the run as cancelled. Tasks interrupted mid-flight (running,
    /// ready, pending, or blocked) are skipped before the terminal state
    /// lands.
    async fn handle_cancellation(&self) -> Result<(), EngineError> {
        {
            let run = self.run.read().await;
            if run.state == RunState::Cancelled {
                return Ok(());
            }
        }
        self.skip_remaining_tasks("Run cancelled").await;
        let _ = self.persist_snapshot().await;
        self.set_state(RunState::Cancelled, None).await?;
        Ok(())
    }

    async fn persist_pause(&self) -> Result<(), EngineError> {
        let snapshot_json = self
            .with_graph(|graph| graph.snapshot_json())
            .await
            .unwrap_or_default();
        let snapshot = {
            let mut run = self.run.write().await;
            // Resume-state is set before the paused state lands.
            run.resume_state = Some(format!("paused:{}", chrono::Utc::now().to_rfc3339()));
            run.graph_snapshot = Some(snapshot_json);
            run.state = RunState::Paused;
            run.paused_at = Some(chrono::Utc::now());
            run.clone()
        };
        self.deps.runs.save(&snapshot)?;
        Ok(())
    }

    // ========================================================================
    // Persistence helpers
    // ========================================================================

    async fn set_state(&self, state: RunState, error: Option<String>) -> Result<(), EngineError> {
        let snapshot = {
            let mut run = self.run.write().await;
            run.state = state;
            if let Some(error) = error {
                run.error = Some(error);
            }
            match state {
                RunState::Paused => run.paused_at = Some(chrono::Utc::now()),
                s if s.is_terminal() => run.completed_at = Some(chrono::Utc::now()),
                _ => {}
            }
            run.clone()
        };
        self.deps.runs.save(&snapshot)?;
        Ok(())
    }

    async fn persist_snapshot(&self) -> Result<(), EngineError> {
        let snapshot_json = self.with_graph(|graph| graph.snapshot_json()).await?;
        let snapshot = {
            let mut run = self.run.write().await;
            run.graph_snapshot = Some(snapshot_json);
            run.clone()
        };
        self.deps.runs.save(&snapshot)?;
        Ok(())
    }

    /// Mirror graph-side blocked statuses into the durable task rows.
    async fn persist_blocked_statuses(&self) -> Result<(), EngineError> {
        let blocked = self
            .with_graph(|graph| {
                graph
                    .topological_order()
                    .into_iter()
                    .filter_map(|id| {
                        graph.node(&id).and_then(|n| {
                            if n.status() == TaskStatus::Blocked {
                                Some((id, n.error.clone()))
                            } else {
                                None
                            }
                        })
                    })
                    .collect::<Vec<_>>()
            })
            .await?;
        for (id, error) in blocked {
            self.deps
                .tasks
                .update_status(&id, TaskStatus::Blocked, error.as_deref())?;
        }
        Ok(())
    }

    async fn run_snapshot(&self) -> Run {
        self.run.read().await.clone()
    }

    pub async fn state(&self) -> RunState {
        self.run.read().await.state
    }

    pub async fn graph_summary(&self) -> Option<std::collections::HashMap<&'static str, usize>> {
        self.graph.read().await.as_ref().map(|g| g.status_summary())
    }

    async fn with_graph<T>(
        &self,
        f: impl FnOnce(&TaskGraph) -> T,
    ) -> Result<T, EngineError> {
        let guard = self.graph.read().await;
        let graph = guard
            .as_ref()
            .ok_or_else(|| EngineError::InvalidOperation("graph not built".to_string()))?;
        Ok(f(graph))
    }

    async fn with_graph_mut<T>(
        &self,
        f: impl FnOnce(&mut TaskGraph) -> T,
    ) -> Result<T, EngineError> {
        let mut guard = self.graph.write().await;
        let graph = guard
            .as_mut()
            .ok_or_else(|| EngineError::InvalidOperation("graph not built".to_string()))?;
        Ok(f(graph))
    }

    fn emit(&self, kind: EventKind, data: serde_json::Value) {
        let _ = self
            .event_tx
            .send(OrchestratorEvent::new(kind, self.run_id.clone(), data));
    }

    /// Per-task queues are bounded; a full queue pauses event emission for
    /// that task without pausing the task itself.
    fn emit_to(
        &self,
        events: &mpsc::Sender<OrchestratorEvent>,
        kind: EventKind,
        data: serde_json::Value,
    ) {
        if events
            .try_send(OrchestratorEvent::new(kind, self.run_id.clone(), data))
            .is_err()
        {
            tracing::warn!("task event queue full; dropping event for run {}", self.run_id);
        }
    }
}

// ============================================================================
// Resume protocol
// ============================================================================

/// Runs whose state is non-terminal; candidates for resumption at startup.
pub fn list_active_runs(deps: &EngineDeps) -> Result<Vec<Run>, EngineError> {
    Ok(deps.runs.list_active()?)
}

/// Reload a persisted run: rebuild the graph from the stored plan, overlay
/// the snapshot, and roll interrupted tasks back to ready with their attempt
/// counters intact. The caller then drives `resume()`.
pub async fn load_run(
    run_id: &str,
    deps: Arc<EngineDeps>,
    event_tx: mpsc::UnboundedSender<OrchestratorEvent>,
) -> Result<Orchestrator, EngineError> {
    let mut run = deps.runs.get(run_id)?;
    let stored_tasks = deps.tasks.get_by_run(run_id)?;
    if stored_tasks.is_empty() {
        return Err(EngineError::InvalidOperation(format!(
            "run {} has no persisted tasks to resume",
            run_id
        )));
    }

    // The graph is rebuilt pending and then overlaid with persisted state.
    let mut plan_tasks = stored_tasks.clone();
    for task in &mut plan_tasks {
        task.status = TaskStatus::Pending;
    }
    let mut graph = TaskGraph::build(run.id.clone(), plan_tasks, run.config.fail_fast)?;

    match run.graph_snapshot.as_deref() {
        Some(snapshot_json) => graph.restore_json(snapshot_json)?,
        None => {
            // No snapshot persisted: derive node state from the task rows.
            let snapshot = GraphSnapshot {
                plan_id: run.id.clone(),
                nodes: stored_tasks
                    .iter()
                    .map(|task| {
                        (
                            task.id.clone(),
                            NodeSnapshot {
                                status: task.status,
                                result: None,
                                error: task.error.clone(),
                                logs: Vec::new(),
                                artifacts: Default::default(),
                                attempt: task.current_attempt(),
                                started_at: task.started_at,
                                completed_at: task.completed_at,
                                verification: Default::default(),
                            },
                        )
                    })
                    .collect(),
            };
            graph.restore(&snapshot);
        }
    }

    let interrupted = graph.recover_interrupted();
    for task_id in &interrupted {
        deps.tasks.update_status(task_id, TaskStatus::Ready, None)?;
        tracing::warn!("rolled back interrupted task {} to ready", task_id);
    }

    run.resume_state = Some(format!("resumed:{}", chrono::Utc::now().to_rfc3339()));
    deps.runs.save(&run)?;

    let engine = Orchestrator::new(run, deps, event_tx);
    *engine.graph.write().await = Some(graph);
    Ok(engine)
}
