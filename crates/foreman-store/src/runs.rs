// Run, task, log, and artifact repositories
// Every state transition in the engine is followed by a write here. Writes
// that touch multiple rows run inside a transaction.

use chrono::{DateTime, Utc};
use rusqlite::{params, Row};

use foreman_types::{
    Artifact, Attempt, Run, RunConfig, RunState, Task, TaskStatus,
};

use crate::db::{Database, StoreError};
use crate::Result;

// ============================================================================
// Runs
// ============================================================================

#[derive(Clone)]
pub struct RunRepository {
    db: Database,
}

impl RunRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn create(&self, run: &Run) -> Result<()> {
        let config_json = serde_json::to_string(&run.config)?;
        self.db.conn().execute(
            "INSERT INTO runs (id, name, original_prompt, workspace_path, config_json, state,
                               plan_json, graph_snapshot, resume_state, branch_name, pr_url,
                               error, total_iterations, created_at, started_at, paused_at,
                               completed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
            params![
                run.id,
                run.name,
                run.original_prompt,
                run.workspace_path,
                config_json,
                run.state.as_str(),
                run.plan_json,
                run.graph_snapshot,
                run.resume_state,
                run.branch_name,
                run.pr_url,
                run.error,
                run.total_iterations,
                run.created_at,
                run.started_at,
                run.paused_at,
                run.completed_at,
            ],
        )?;
        Ok(())
    }

    /// Persist the full run row. The engine calls this after every state
    /// transition.
    pub fn save(&self, run: &Run) -> Result<()> {
        let config_json = serde_json::to_string(&run.config)?;
        let updated = self.db.conn().execute(
            "UPDATE runs SET name = ?2, original_prompt = ?3, workspace_path = ?4,
                             config_json = ?5, state = ?6, plan_json = ?7, graph_snapshot = ?8,
                             resume_state = ?9, branch_name = ?10, pr_url = ?11, error = ?12,
                             total_iterations = ?13, started_at = ?14, paused_at = ?15,
                             completed_at = ?16
             WHERE id = ?1",
            params![
                run.id,
                run.name,
                run.original_prompt,
                run.workspace_path,
                config_json,
                run.state.as_str(),
                run.plan_json,
                run.graph_snapshot,
                run.resume_state,
                run.branch_name,
                run.pr_url,
                run.error,
                run.total_iterations,
                run.started_at,
                run.paused_at,
                run.completed_at,
            ],
        )?;
        if updated == 0 {
            return Err(StoreError::NotFound(format!("run {}", run.id)));
        }
        Ok(())
    }

    pub fn get(&self, run_id: &str) -> Result<Run> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare(
            "SELECT id, name, original_prompt, workspace_path, config_json, state, plan_json,
                    graph_snapshot, resume_state, branch_name, pr_url, error, total_iterations,
                    created_at, started_at, paused_at, completed_at
             FROM runs WHERE id = ?1",
        )?;
        let run = stmt
            .query_row(params![run_id], run_from_row)
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => {
                    StoreError::NotFound(format!("run {}", run_id))
                }
                other => StoreError::Sqlite(other),
            })?;
        Ok(run)
    }

    pub fn update_state(&self, run_id: &str, state: RunState, error: Option<&str>) -> Result<()> {
        let now = Utc::now();
        let (paused_at, completed_at): (Option<DateTime<Utc>>, Option<DateTime<Utc>>) =
            match state {
                RunState::Paused => (Some(now), None),
                s if s.is_terminal() => (None, Some(now)),
                _ => (None, None),
            };
        let updated = self.db.conn().execute(
            "UPDATE runs SET state = ?2,
                             error = COALESCE(?3, error),
                             paused_at = COALESCE(?4, paused_at),
                             completed_at = COALESCE(?5, completed_at),
                             started_at = CASE WHEN ?2 = 'executing' AND started_at IS NULL
                                               THEN ?6 ELSE started_at END
             WHERE id = ?1",
            params![run_id, state.as_str(), error, paused_at, completed_at, now],
        )?;
        if updated == 0 {
            return Err(StoreError::NotFound(format!("run {}", run_id)));
        }
        Ok(())
    }

    pub fn list(&self, state: Option<RunState>, limit: usize) -> Result<Vec<Run>> {
        let conn = self.db.conn();
        let mut runs = Vec::new();
        match state {
            Some(state) => {
                let mut stmt = conn.prepare(
                    "SELECT id, name, original_prompt, workspace_path, config_json, state,
                            plan_json, graph_snapshot, resume_state, branch_name, pr_url, error,
                            total_iterations, created_at, started_at, paused_at, completed_at
                     FROM runs WHERE state = ?1 ORDER BY created_at DESC LIMIT ?2",
                )?;
                let rows = stmt.query_map(params![state.as_str(), limit], run_from_row)?;
                for row in rows {
                    runs.push(row?);
                }
            }
            None => {
                let mut stmt = conn.prepare(
                    "SELECT id, name, original_prompt, workspace_path, config_json, state,
                            plan_json, graph_snapshot, resume_state, branch_name, pr_url, error,
                            total_iterations, created_at, started_at, paused_at, completed_at
                     FROM runs ORDER BY created_at DESC LIMIT ?1",
                )?;
                let rows = stmt.query_map(params![limit], run_from_row)?;
                for row in rows {
                    runs.push(row?);
                }
            }
        }
        Ok(runs)
    }

    /// Runs whose state is non-terminal; the resume protocol starts here.
    pub fn list_active(&self) -> Result<Vec<Run>> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare(
            "SELECT id, name, original_prompt, workspace_path, config_json, state, plan_json,
                    graph_snapshot, resume_state, branch_name, pr_url, error, total_iterations,
                    created_at, started_at, paused_at, completed_at
             FROM runs WHERE state NOT IN ('done', 'failed', 'cancelled')
             ORDER BY created_at ASC",
        )?;
        let rows = stmt.query_map([], run_from_row)?;
        let mut runs = Vec::new();
        for row in rows {
            runs.push(row?);
        }
        Ok(runs)
    }
}

fn run_from_row(row: &Row<'_>) -> rusqlite::Result<Run> {
    let config_json: String = row.get(4)?;
    let config: RunConfig = serde_json::from_str(&config_json).unwrap_or_default();
    let state_str: String = row.get(5)?;
    Ok(Run {
        id: row.get(0)?,
        name: row.get(1)?,
        original_prompt: row.get(2)?,
        workspace_path: row.get(3)?,
        config,
        state: RunState::parse(&state_str).unwrap_or(RunState::Failed),
        plan_json: row.get(6)?,
        graph_snapshot: row.get(7)?,
        resume_state: row.get(8)?,
        branch_name: row.get(9)?,
        pr_url: row.get(10)?,
        error: row.get(11)?,
        total_iterations: row.get(12)?,
        created_at: row.get(13)?,
        started_at: row.get(14)?,
        paused_at: row.get(15)?,
        completed_at: row.get(16)?,
    })
}

// ============================================================================
// Tasks
// ============================================================================

#[derive(Clone)]
pub struct TaskRepository {
    db: Database,
}

impl TaskRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert all planned tasks in one transaction.
    pub fn create_many(&self, tasks: &[Task]) -> Result<()> {
        let mut conn = self.db.conn();
        let tx = conn.transaction()?;
        for task in tasks {
            tx.execute(
                "INSERT INTO tasks (id, run_id, title, description, agent_id, depends_on_json,
                                    quality_gates_json, target_files_json, priority, max_attempts,
                                    skippable, status, final_commit, error, created_at,
                                    started_at, completed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
                params![
                    task.id,
                    task.run_id,
                    task.title,
                    task.description,
                    task.agent_id,
                    serde_json::to_string(&task.depends_on)?,
                    serde_json::to_string(&task.quality_gates)?,
                    serde_json::to_string(&task.target_files)?,
                    task.priority,
                    task.max_attempts,
                    task.skippable,
                    task.status.as_str(),
                    task.final_commit,
                    task.error,
                    task.created_at,
                    task.started_at,
                    task.completed_at,
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn save(&self, task: &Task) -> Result<()> {
        let updated = self.db.conn().execute(
            "UPDATE tasks SET title = ?2, description = ?3, agent_id = ?4, depends_on_json = ?5,
                              quality_gates_json = ?6, target_files_json = ?7, priority = ?8,
                              max_attempts = ?9, skippable = ?10, status = ?11,
                              final_commit = ?12, error = ?13, started_at = ?14,
                              completed_at = ?15
             WHERE id = ?1",
            params![
                task.id,
                task.title,
                task.description,
                task.agent_id,
                serde_json::to_string(&task.depends_on)?,
                serde_json::to_string(&task.quality_gates)?,
                serde_json::to_string(&task.target_files)?,
                task.priority,
                task.max_attempts,
                task.skippable,
                task.status.as_str(),
                task.final_commit,
                task.error,
                task.started_at,
                task.completed_at,
            ],
        )?;
        if updated == 0 {
            return Err(StoreError::NotFound(format!("task {}", task.id)));
        }
        Ok(())
    }

    pub fn update_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let now = Utc::now();
        let completed_at = if status.is_terminal() { Some(now) } else { None };
        let updated = self.db.conn().execute(
            "UPDATE tasks SET status = ?2,
                              error = COALESCE(?3, error),
                              started_at = CASE WHEN ?2 = 'running' AND started_at IS NULL
                                                THEN ?4 ELSE started_at END,
                              completed_at = COALESCE(?5, completed_at)
             WHERE id = ?1",
            params![task_id, status.as_str(), error, now, completed_at],
        )?;
        if updated == 0 {
            return Err(StoreError::NotFound(format!("task {}", task_id)));
        }
        Ok(())
    }

    pub fn set_final_commit(&self, task_id: &str, commit: &str) -> Result<()> {
        let updated = self.db.conn().execute(
            "UPDATE tasks SET final_commit = ?2 WHERE id = ?1",
            params![task_id, commit],
        )?;
        if updated == 0 {
            return Err(StoreError::NotFound(format!("task {}", task_id)));
        }
        Ok(())
    }

    pub fn record_attempt(&self, task_id: &str, attempt: &Attempt) -> Result<()> {
        self.db.conn().execute(
            "INSERT INTO attempts (id, task_id, number, started_at, completed_at, success,
                                   agent_response, gate_results_json, commit_ref, feedback,
                                   created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                uuid::Uuid::new_v4().to_string(),
                task_id,
                attempt.number,
                attempt.started_at,
                attempt.completed_at,
                attempt.success,
                attempt.agent_response,
                serde_json::to_string(&attempt.gate_results)?,
                attempt.commit_ref,
                attempt.feedback,
                Utc::now(),
            ],
        )?;
        Ok(())
    }

    pub fn get(&self, task_id: &str) -> Result<Task> {
        let mut task = {
            let conn = self.db.conn();
            let mut stmt = conn.prepare(
                "SELECT id, run_id, title, description, agent_id, depends_on_json,
                        quality_gates_json, target_files_json, priority, max_attempts, skippable,
                        status, final_commit, error, created_at, started_at, completed_at
                 FROM tasks WHERE id = ?1",
            )?;
            stmt.query_row(params![task_id], task_from_row)
                .map_err(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => {
                        StoreError::NotFound(format!("task {}", task_id))
                    }
                    other => StoreError::Sqlite(other),
                })?
        };
        task.attempts = self.attempts_for(task_id)?;
        Ok(task)
    }

    pub fn get_by_run(&self, run_id: &str) -> Result<Vec<Task>> {
        let mut tasks = {
            let conn = self.db.conn();
            let mut stmt = conn.prepare(
                "SELECT id, run_id, title, description, agent_id, depends_on_json,
                        quality_gates_json, target_files_json, priority, max_attempts, skippable,
                        status, final_commit, error, created_at, started_at, completed_at
                 FROM tasks WHERE run_id = ?1 ORDER BY created_at ASC",
            )?;
            let rows = stmt.query_map(params![run_id], task_from_row)?;
            let mut tasks = Vec::new();
            for row in rows {
                tasks.push(row?);
            }
            tasks
        };
        for task in &mut tasks {
            task.attempts = self.attempts_for(&task.id)?;
        }
        Ok(tasks)
    }

    fn attempts_for(&self, task_id: &str) -> Result<Vec<Attempt>> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare(
            "SELECT number, started_at, completed_at, success, agent_response,
                    gate_results_json, commit_ref, feedback
             FROM attempts WHERE task_id = ?1 ORDER BY number ASC",
        )?;
        let rows = stmt.query_map(params![task_id], |row| {
            let gate_results_json: String = row.get(5)?;
            Ok(Attempt {
                number: row.get(0)?,
                started_at: row.get(1)?,
                completed_at: row.get(2)?,
                success: row.get(3)?,
                agent_response: row.get(4)?,
                gate_results: serde_json::from_str(&gate_results_json).unwrap_or_default(),
                commit_ref: row.get(6)?,
                feedback: row.get(7)?,
            })
        })?;
        let mut attempts = Vec::new();
        for row in rows {
            attempts.push(row?);
        }
        Ok(attempts)
    }
}

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<Task> {
    let depends_on_json: String = row.get(5)?;
    let gates_json: String = row.get(6)?;
    let files_json: String = row.get(7)?;
    let status_str: String = row.get(11)?;
    Ok(Task {
        id: row.get(0)?,
        run_id: row.get(1)?,
        title: row.get(2)?,
        description: row.get(3)?,
        agent_id: row.get(4)?,
        depends_on: serde_json::from_str(&depends_on_json).unwrap_or_default(),
        quality_gates: serde_json::from_str(&gates_json).unwrap_or_default(),
        target_files: serde_json::from_str(&files_json).unwrap_or_default(),
        priority: row.get(8)?,
        max_attempts: row.get(9)?,
        skippable: row.get(10)?,
        status: TaskStatus::parse(&status_str).unwrap_or(TaskStatus::Failed),
        attempts: Vec::new(),
        final_commit: row.get(12)?,
        error: row.get(13)?,
        created_at: row.get(14)?,
        started_at: row.get(15)?,
        completed_at: row.get(16)?,
    })
}

// ============================================================================
// Task logs
// ============================================================================

#[derive(Clone)]
pub struct LogRepository {
    db: Database,
}

impl LogRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn append(
        &self,
        run_id: &str,
        task_id: &str,
        message: &str,
        tool_invocation: Option<&serde_json::Value>,
    ) -> Result<()> {
        self.db.conn().execute(
            "INSERT INTO task_logs (id, run_id, task_id, message, tool_invocation_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                uuid::Uuid::new_v4().to_string(),
                run_id,
                task_id,
                message,
                tool_invocation.map(|v| v.to_string()),
                Utc::now(),
            ],
        )?;
        Ok(())
    }

    pub fn get_by_task(&self, task_id: &str, limit: usize) -> Result<Vec<(String, DateTime<Utc>)>> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare(
            "SELECT message, created_at FROM task_logs
             WHERE task_id = ?1 ORDER BY created_at ASC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![task_id, limit], |row| {
            Ok((row.get(0)?, row.get(1)?))
        })?;
        let mut logs = Vec::new();
        for row in rows {
            logs.push(row?);
        }
        Ok(logs)
    }
}

// ============================================================================
// Artifacts
// ============================================================================

#[derive(Clone)]
pub struct ArtifactRepository {
    db: Database,
}

impl ArtifactRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn create(&self, artifact: &Artifact) -> Result<()> {
        self.db.conn().execute(
            "INSERT INTO artifacts (id, run_id, task_id, name, kind, path, content, content_hash,
                                    produced_by, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                artifact.id,
                artifact.run_id,
                artifact.task_id,
                artifact.name,
                artifact.kind,
                artifact.path,
                artifact.content,
                artifact.content_hash,
                artifact.produced_by,
                artifact.created_at,
            ],
        )?;
        Ok(())
    }

    pub fn get_by_run(&self, run_id: &str) -> Result<Vec<Artifact>> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare(
            "SELECT id, run_id, task_id, name, kind, path, content, content_hash, produced_by,
                    created_at
             FROM artifacts WHERE run_id = ?1 ORDER BY created_at ASC",
        )?;
        let rows = stmt.query_map(params![run_id], |row| {
            Ok(Artifact {
                id: row.get(0)?,
                run_id: row.get(1)?,
                task_id: row.get(2)?,
                name: row.get(3)?,
                kind: row.get(4)?,
                path: row.get(5)?,
                content: row.get(6)?,
                content_hash: row.get(7)?,
                produced_by: row.get(8)?,
                created_at: row.get(9)?,
            })
        })?;
        let mut artifacts = Vec::new();
        for row in rows {
            artifacts.push(row?);
        }
        Ok(artifacts)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use foreman_types::{GateKind, QualityGate};

    fn repos() -> (RunRepository, TaskRepository, LogRepository, ArtifactRepository) {
        let db = Database::open_in_memory().unwrap();
        (
            RunRepository::new(db.clone()),
            TaskRepository::new(db.clone()),
            LogRepository::new(db.clone()),
            ArtifactRepository::new(db),
        )
    }

    fn sample_run() -> Run {
        Run::new(
            "demo".to_string(),
            "Build a thing".to_string(),
            "/tmp/ws".to_string(),
            RunConfig::default(),
        )
    }

    #[test]
    fn create_and_reload_run() {
        let (runs, _, _, _) = repos();
        let run = sample_run();
        runs.create(&run).unwrap();

        let loaded = runs.get(&run.id).unwrap();
        assert_eq!(loaded.original_prompt, "Build a thing");
        assert_eq!(loaded.state, RunState::Intake);
        assert_eq!(loaded.config.parallel_tasks, 2);
    }

    #[test]
    fn state_transitions_stamp_timestamps() {
        let (runs, _, _, _) = repos();
        let run = sample_run();
        runs.create(&run).unwrap();

        runs.update_state(&run.id, RunState::Executing, None).unwrap();
        let executing = runs.get(&run.id).unwrap();
        assert!(executing.started_at.is_some());
        assert!(executing.completed_at.is_none());

        runs.update_state(&run.id, RunState::Done, None).unwrap();
        let done = runs.get(&run.id).unwrap();
        assert!(done.completed_at.is_some());
    }

    #[test]
    fn list_active_excludes_terminal() {
        let (runs, _, _, _) = repos();
        let active = sample_run();
        let finished = sample_run();
        runs.create(&active).unwrap();
        runs.create(&finished).unwrap();
        runs.update_state(&active.id, RunState::Executing, None).unwrap();
        runs.update_state(&finished.id, RunState::Done, None).unwrap();

        let listed = runs.list_active().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, active.id);
    }

    #[test]
    fn missing_run_is_not_found() {
        let (runs, _, _, _) = repos();
        assert!(matches!(runs.get("nope"), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn tasks_round_trip_with_attempts() {
        let (runs, tasks, _, _) = repos();
        let run = sample_run();
        runs.create(&run).unwrap();

        let mut task = Task::new(
            run.id.clone(),
            "Write file".to_string(),
            "Write the file".to_string(),
            "coder".to_string(),
        );
        task.quality_gates.push(QualityGate::new(GateKind::TestsPass));
        task.depends_on.push("other".to_string());
        tasks.create_many(std::slice::from_ref(&task)).unwrap();

        let mut attempt = Attempt::new(1);
        attempt.agent_response = "done".to_string();
        attempt.success = true;
        tasks.record_attempt(&task.id, &attempt).unwrap();
        tasks.update_status(&task.id, TaskStatus::Completed, None).unwrap();

        let loaded = tasks.get_by_run(&run.id).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].status, TaskStatus::Completed);
        assert_eq!(loaded[0].attempts.len(), 1);
        assert_eq!(loaded[0].attempts[0].agent_response, "done");
        assert_eq!(loaded[0].quality_gates[0].kind, GateKind::TestsPass);
        assert!(loaded[0].completed_at.is_some());
    }

    #[test]
    fn logs_and_artifacts() {
        let (runs, _, logs, artifacts) = repos();
        let run = sample_run();
        runs.create(&run).unwrap();

        logs.append(&run.id, "t1", "started", None).unwrap();
        logs.append(
            &run.id,
            "t1",
            "tool call",
            Some(&serde_json::json!({ "tool": "filesystem" })),
        )
        .unwrap();
        let fetched = logs.get_by_task("t1", 10).unwrap();
        assert_eq!(fetched.len(), 2);
        assert_eq!(fetched[0].0, "started");

        let artifact = Artifact {
            id: uuid::Uuid::new_v4().to_string(),
            run_id: run.id.clone(),
            task_id: "t1".to_string(),
            name: "dockerfile".to_string(),
            kind: "file".to_string(),
            path: Some("Dockerfile".to_string()),
            content: Some("FROM scratch".to_string()),
            content_hash: None,
            produced_by: "devops".to_string(),
            created_at: Utc::now(),
        };
        artifacts.create(&artifact).unwrap();
        let fetched = artifacts.get_by_run(&run.id).unwrap();
        assert_eq!(fetched.len(), 1);
        assert_eq!(fetched[0].name, "dockerfile");
    }
}
