// Task graph
// DAG of tasks with dependency tracking, execution ordering, cycle
// detection, and a serializable snapshot for resume. Index-keyed maps plus
// two adjacency maps; no pointer cycles.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use foreman_types::{Task, TaskStatus};

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("task graph is empty")]
    Empty,
    #[error("task '{task_id}' has unknown dependency '{dependency_id}'")]
    UnknownDependency {
        task_id: String,
        dependency_id: String,
    },
    #[error("duplicate task id '{0}'")]
    DuplicateTaskId(String),
    #[error("task graph contains a cycle through '{0}'")]
    Cycle(String),
    #[error("unknown task '{0}'")]
    UnknownTask(String),
    #[error("cannot {action} task '{task_id}' in status {status:?}")]
    InvalidTransition {
        task_id: String,
        status: TaskStatus,
        action: &'static str,
    },
    #[error("snapshot error: {0}")]
    Snapshot(String),
}

// ============================================================================
// Nodes
// ============================================================================

/// A task plus its execution-time state.
#[derive(Debug, Clone)]
pub struct TaskNode {
    pub task: Task,
    pub result: Option<String>,
    pub error: Option<String>,
    pub logs: Vec<String>,
    pub artifacts: HashMap<String, serde_json::Value>,
    pub attempt: u32,
    pub verification: HashMap<String, bool>,
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl TaskNode {
    fn new(task: Task) -> Self {
        Self {
            task,
            result: None,
            error: None,
            logs: Vec::new(),
            artifacts: HashMap::new(),
            attempt: 0,
            verification: HashMap::new(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn status(&self) -> TaskStatus {
        self.task.status
    }

    pub fn is_terminal(&self) -> bool {
        self.task.status.is_terminal()
    }

    fn log(&mut self, message: impl Into<String>) {
        self.logs
            .push(format!("[{}] {}", chrono::Utc::now().to_rfc3339(), message.into()));
    }
}

// ============================================================================
// Snapshot
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSnapshot {
    pub status: TaskStatus,
    pub result: Option<String>,
    pub error: Option<String>,
    #[serde(default)]
    pub logs: Vec<String>,
    #[serde(default)]
    pub artifacts: HashMap<String, serde_json::Value>,
    pub attempt: u32,
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    pub verification: HashMap<String, bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphSnapshot {
    pub plan_id: String,
    pub nodes: HashMap<String, NodeSnapshot>,
}

// ============================================================================
// Graph
// ============================================================================

#[derive(Debug)]
pub struct TaskGraph {
    plan_id: String,
    nodes: HashMap<String, TaskNode>,
    /// dependency -> dependents
    forward: HashMap<String, HashSet<String>>,
    /// task -> dependencies
    reverse: HashMap<String, HashSet<String>>,
    fail_fast: bool,
}

impl TaskGraph {
    /// Build and validate the graph: every dependency must resolve, ids must
    /// be unique, and the graph must be acyclic. Root tasks become ready
    /// immediately.
    pub fn build(
        plan_id: impl Into<String>,
        tasks: Vec<Task>,
        fail_fast: bool,
    ) -> Result<Self, GraphError> {
        if tasks.is_empty() {
            return Err(GraphError::Empty);
        }

        let mut nodes: HashMap<String, TaskNode> = HashMap::new();
        for task in tasks {
            if nodes.contains_key(&task.id) {
                return Err(GraphError::DuplicateTaskId(task.id));
            }
            nodes.insert(task.id.clone(), TaskNode::new(task));
        }

        let mut forward: HashMap<String, HashSet<String>> = HashMap::new();
        let mut reverse: HashMap<String, HashSet<String>> = HashMap::new();
        for node in nodes.values() {
            for dep in &node.task.depends_on {
                if !nodes.contains_key(dep) {
                    return Err(GraphError::UnknownDependency {
                        task_id: node.task.id.clone(),
                        dependency_id: dep.clone(),
                    });
                }
                forward
                    .entry(dep.clone())
                    .or_default()
                    .insert(node.task.id.clone());
                reverse
                    .entry(node.task.id.clone())
                    .or_default()
                    .insert(dep.clone());
            }
        }

        let mut graph = Self {
            plan_id: plan_id.into(),
            nodes,
            forward,
            reverse,
            fail_fast,
        };
        graph.check_cycles()?;
        graph.update_ready();
        Ok(graph)
    }

    /// Three-colour depth-first search: a gray-to-gray edge is a back edge,
    /// which means a cycle.
    fn check_cycles(&self) -> Result<(), GraphError> {
        #[derive(Clone, Copy, PartialEq)]
        enum Color {
            White,
            Gray,
            Black,
        }

        fn dfs(
            node: &str,
            forward: &HashMap<String, HashSet<String>>,
            color: &mut HashMap<String, Color>,
        ) -> Option<String> {
            color.insert(node.to_string(), Color::Gray);
            if let Some(dependents) = forward.get(node) {
                for next in dependents {
                    match color.get(next.as_str()).copied().unwrap_or(Color::White) {
                        Color::Gray => return Some(next.clone()),
                        Color::White => {
                            if let Some(hit) = dfs(next, forward, color) {
                                return Some(hit);
                            }
                        }
                        Color::Black => {}
                    }
                }
            }
            color.insert(node.to_string(), Color::Black);
            None
        }

        let mut color: HashMap<String, Color> = HashMap::new();
        let ids: Vec<String> = self.nodes.keys().cloned().collect();
        for id in ids {
            if color.get(&id).copied().unwrap_or(Color::White) == Color::White {
                if let Some(hit) = dfs(&id, &self.forward, &mut color) {
                    return Err(GraphError::Cycle(hit));
                }
            }
        }
        Ok(())
    }

    fn deps_of(&self, id: &str) -> impl Iterator<Item = &String> {
        self.reverse.get(id).into_iter().flatten()
    }

    /// A dependency counts as satisfied when completed, or, with fail-fast
    /// off, when it was a skippable task that ended failed or skipped.
    fn dep_satisfied(&self, dep_id: &str) -> bool {
        let Some(dep) = self.nodes.get(dep_id) else {
            return false;
        };
        match dep.status() {
            TaskStatus::Completed => true,
            TaskStatus::Failed | TaskStatus::Skipped => !self.fail_fast && dep.task.skippable,
            _ => false,
        }
    }

    fn update_ready(&mut self) {
        let promotable: Vec<String> = self
            .nodes
            .values()
            .filter(|n| n.status() == TaskStatus::Pending)
            .filter(|n| self.deps_of(&n.task.id).all(|d| self.dep_satisfied(d)))
            .map(|n| n.task.id.clone())
            .collect();
        for id in promotable {
            if let Some(node) = self.nodes.get_mut(&id) {
                node.task.status = TaskStatus::Ready;
            }
        }
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn plan_id(&self) -> &str {
        &self.plan_id
    }

    pub fn node(&self, id: &str) -> Option<&TaskNode> {
        self.nodes.get(id)
    }

    pub fn node_mut(&mut self, id: &str) -> Option<&mut TaskNode> {
        self.nodes.get_mut(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Ready tasks ordered by priority descending, then creation time, then
    /// id for determinism.
    pub fn ready_tasks(&self) -> Vec<String> {
        let mut ready: Vec<&TaskNode> = self
            .nodes
            .values()
            .filter(|n| n.status() == TaskStatus::Ready)
            .collect();
        ready.sort_by(|a, b| {
            b.task
                .priority
                .cmp(&a.task.priority)
                .then(a.task.created_at.cmp(&b.task.created_at))
                .then(a.task.id.cmp(&b.task.id))
        });
        ready.into_iter().map(|n| n.task.id.clone()).collect()
    }

    pub fn running_tasks(&self) -> Vec<String> {
        self.nodes
            .values()
            .filter(|n| n.status() == TaskStatus::Running)
            .map(|n| n.task.id.clone())
            .collect()
    }

    pub fn get_dependencies(&self, id: &str) -> HashSet<String> {
        self.reverse.get(id).cloned().unwrap_or_default()
    }

    pub fn get_dependents(&self, id: &str) -> HashSet<String> {
        self.forward.get(id).cloned().unwrap_or_default()
    }

    /// Artifacts of direct dependencies, keyed by dependency id.
    pub fn input_artifacts(&self, id: &str) -> HashMap<String, HashMap<String, serde_json::Value>> {
        let mut out = HashMap::new();
        for dep in self.deps_of(id) {
            if let Some(node) = self.nodes.get(dep) {
                if !node.artifacts.is_empty() {
                    out.insert(dep.clone(), node.artifacts.clone());
                }
            }
        }
        out
    }

    pub fn is_complete(&self) -> bool {
        self.nodes.values().all(|n| n.is_terminal() || n.status() == TaskStatus::Blocked)
    }

    /// Strictly terminal (blocked tasks are unresolved, not terminal).
    pub fn all_terminal(&self) -> bool {
        self.nodes.values().all(|n| n.is_terminal())
    }

    pub fn has_failures(&self) -> bool {
        self.nodes
            .values()
            .any(|n| n.status() == TaskStatus::Failed)
    }

    pub fn progress(&self) -> f64 {
        if self.nodes.is_empty() {
            return 1.0;
        }
        let terminal = self.nodes.values().filter(|n| n.is_terminal()).count();
        terminal as f64 / self.nodes.len() as f64
    }

    pub fn status_summary(&self) -> HashMap<&'static str, usize> {
        let mut summary: HashMap<&'static str, usize> = HashMap::new();
        for node in self.nodes.values() {
            *summary.entry(node.status().as_str()).or_default() += 1;
        }
        summary
    }

    // ========================================================================
    // Transitions
    // ========================================================================

    /// Only a ready task may start. Stamps the start time and counts the
    /// attempt.
    pub fn mark_running(&mut self, id: &str) -> Result<(), GraphError> {
        let node = self
            .nodes
            .get_mut(id)
            .ok_or_else(|| GraphError::UnknownTask(id.to_string()))?;
        if node.status() != TaskStatus::Ready {
            return Err(GraphError::InvalidTransition {
                task_id: id.to_string(),
                status: node.status(),
                action: "start",
            });
        }
        node.task.status = TaskStatus::Running;
        node.started_at = Some(chrono::Utc::now());
        node.attempt += 1;
        let attempt = node.attempt;
        node.log(format!("Started execution (attempt {})", attempt));
        Ok(())
    }

    pub fn mark_verifying(&mut self, id: &str) -> Result<(), GraphError> {
        let node = self
            .nodes
            .get_mut(id)
            .ok_or_else(|| GraphError::UnknownTask(id.to_string()))?;
        node.task.status = TaskStatus::Verifying;
        node.log("Starting verification");
        Ok(())
    }

    /// Back to running for another attempt after a failed gate pass.
    pub fn mark_retrying_in_place(&mut self, id: &str) -> Result<(), GraphError> {
        let node = self
            .nodes
            .get_mut(id)
            .ok_or_else(|| GraphError::UnknownTask(id.to_string()))?;
        node.task.status = TaskStatus::Running;
        node.attempt += 1;
        let attempt = node.attempt;
        node.log(format!("Retrying after gate failure (attempt {})", attempt));
        Ok(())
    }

    /// Completion re-evaluates dependents into ready.
    pub fn mark_completed(&mut self, id: &str, result: Option<String>) -> Result<(), GraphError> {
        let node = self
            .nodes
            .get_mut(id)
            .ok_or_else(|| GraphError::UnknownTask(id.to_string()))?;
        node.task.status = TaskStatus::Completed;
        node.completed_at = Some(chrono::Utc::now());
        node.result = result;
        node.error = None;
        node.log("Completed successfully");
        self.update_ready();
        Ok(())
    }

    /// Failure blocks every direct and transitive dependent, unless the
    /// failed task is skippable and fail-fast is off.
    pub fn mark_failed(&mut self, id: &str, error: &str) -> Result<(), GraphError> {
        {
            let node = self
                .nodes
                .get_mut(id)
                .ok_or_else(|| GraphError::UnknownTask(id.to_string()))?;
            node.task.status = TaskStatus::Failed;
            node.completed_at = Some(chrono::Utc::now());
            node.error = Some(error.to_string());
            node.log(format!("Failed: {}", error));
        }
        if self.dep_satisfied(id) {
            // Skippable failure with fail-fast off: dependents may proceed.
            self.update_ready();
        } else {
            self.block_dependents(id);
        }
        Ok(())
    }

    fn block_dependents(&mut self, id: &str) {
        let dependents: Vec<String> = self.get_dependents(id).into_iter().collect();
        for dependent in dependents {
            let should_block = self
                .nodes
                .get(&dependent)
                .map(|n| matches!(n.status(), TaskStatus::Pending | TaskStatus::Ready))
                .unwrap_or(false);
            if should_block {
                if let Some(node) = self.nodes.get_mut(&dependent) {
                    node.task.status = TaskStatus::Blocked;
                    node.error = Some(format!("Blocked by failed dependency: {}", id));
                    node.log(format!("Blocked due to failure of {}", id));
                }
                self.block_dependents(&dependent);
            }
        }
    }

    pub fn mark_skipped(&mut self, id: &str, reason: &str) -> Result<(), GraphError> {
        {
            let node = self
                .nodes
                .get_mut(id)
                .ok_or_else(|| GraphError::UnknownTask(id.to_string()))?;
            node.task.status = TaskStatus::Skipped;
            node.error = Some(reason.to_string());
            node.log(format!("Skipped: {}", reason));
        }
        if self.dep_satisfied(id) {
            self.update_ready();
        } else {
            self.block_dependents(id);
        }
        Ok(())
    }

    pub fn can_retry(&self, id: &str) -> bool {
        self.nodes
            .get(id)
            .map(|n| n.status() == TaskStatus::Failed && n.attempt < n.task.max_attempts)
            .unwrap_or(false)
    }

    /// Reset a failed task for retry. The attempt count is preserved so
    /// backoff can use it.
    pub fn retry(&mut self, id: &str) -> Result<(), GraphError> {
        if !self.can_retry(id) {
            let status = self
                .nodes
                .get(id)
                .map(|n| n.status())
                .ok_or_else(|| GraphError::UnknownTask(id.to_string()))?;
            return Err(GraphError::InvalidTransition {
                task_id: id.to_string(),
                status,
                action: "retry",
            });
        }
        let Some(node) = self.nodes.get_mut(id) else {
            return Err(GraphError::UnknownTask(id.to_string()));
        };
        node.task.status = TaskStatus::Ready;
        node.error = None;
        let next = node.attempt + 1;
        node.log(format!("Reset for retry (will be attempt {})", next));
        // A previous failure may have blocked dependents; they stay blocked
        // until this task completes, at which point update_ready unblocks
        // nothing automatically -- blocked is re-derived on completion.
        Ok(())
    }

    /// Unblock dependents of a task that is being retried. Called together
    /// with retry() when the caller wants the subtree schedulable again.
    pub fn unblock_dependents(&mut self, id: &str) {
        let dependents: Vec<String> = self.get_dependents(id).into_iter().collect();
        for dependent in dependents {
            let blocked = self
                .nodes
                .get(&dependent)
                .map(|n| n.status() == TaskStatus::Blocked)
                .unwrap_or(false);
            if blocked {
                if let Some(node) = self.nodes.get_mut(&dependent) {
                    node.task.status = TaskStatus::Pending;
                    node.error = None;
                }
                self.unblock_dependents(&dependent);
            }
        }
        self.update_ready();
    }

    // ========================================================================
    // Ordering
    // ========================================================================

    /// Kahn's algorithm over reverse-dependency in-degree. Deterministic
    /// tie-break: priority descending, then id ascending.
    pub fn topological_order(&self) -> Vec<String> {
        let mut in_degree: HashMap<&str, usize> = self
            .nodes
            .keys()
            .map(|id| (id.as_str(), self.reverse.get(id).map_or(0, |d| d.len())))
            .collect();

        let mut queue: Vec<&str> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());

        while !queue.is_empty() {
            queue.sort_by(|a, b| {
                let pa = self.nodes[*a].task.priority;
                let pb = self.nodes[*b].task.priority;
                pb.cmp(&pa).then(a.cmp(b))
            });
            let next = queue.remove(0);
            order.push(next.to_string());

            if let Some(dependents) = self.forward.get(next) {
                for dependent in dependents {
                    if let Some(degree) = in_degree.get_mut(dependent.as_str()) {
                        *degree -= 1;
                        if *degree == 0 {
                            queue.push(dependent.as_str());
                        }
                    }
                }
            }
        }
        order
    }

    /// Level k contains exactly the tasks whose prerequisites all sit in
    /// levels < k. Used for cost estimation and visualization only.
    pub fn execution_levels(&self) -> Vec<Vec<String>> {
        let mut levels: Vec<Vec<String>> = Vec::new();
        let mut remaining: HashSet<&str> = self.nodes.keys().map(String::as_str).collect();
        let mut placed: HashSet<&str> = HashSet::new();

        while !remaining.is_empty() {
            let mut level: Vec<&str> = remaining
                .iter()
                .copied()
                .filter(|id| {
                    self.deps_of(id)
                        .all(|d| placed.contains(d.as_str()))
                })
                .collect();
            if level.is_empty() {
                // Unreachable after build-time cycle validation.
                break;
            }
            level.sort_unstable();
            for id in &level {
                placed.insert(id);
                remaining.remove(id);
            }
            levels.push(level.into_iter().map(str::to_string).collect());
        }
        levels
    }

    // ========================================================================
    // Snapshot / restore
    // ========================================================================

    pub fn snapshot(&self) -> GraphSnapshot {
        GraphSnapshot {
            plan_id: self.plan_id.clone(),
            nodes: self
                .nodes
                .iter()
                .map(|(id, node)| {
                    (
                        id.clone(),
                        NodeSnapshot {
                            status: node.status(),
                            result: node.result.clone(),
                            error: node.error.clone(),
                            logs: node.logs.clone(),
                            artifacts: node.artifacts.clone(),
                            attempt: node.attempt,
                            started_at: node.started_at,
                            completed_at: node.completed_at,
                            verification: node.verification.clone(),
                        },
                    )
                })
                .collect(),
        }
    }

    pub fn snapshot_json(&self) -> String {
        serde_json::to_string(&self.snapshot()).unwrap_or_default()
    }

    /// Restore per-node state from a snapshot and re-evaluate the ready set.
    pub fn restore(&mut self, snapshot: &GraphSnapshot) {
        for (id, saved) in &snapshot.nodes {
            if let Some(node) = self.nodes.get_mut(id) {
                node.task.status = saved.status;
                node.result = saved.result.clone();
                node.error = saved.error.clone();
                node.logs = saved.logs.clone();
                node.artifacts = saved.artifacts.clone();
                node.attempt = saved.attempt;
                node.started_at = saved.started_at;
                node.completed_at = saved.completed_at;
                node.verification = saved.verification.clone();
            }
        }
        self.update_ready();
    }

    pub fn restore_json(&mut self, json: &str) -> Result<(), GraphError> {
        let snapshot: GraphSnapshot =
            serde_json::from_str(json).map_err(|e| GraphError::Snapshot(e.to_string()))?;
        self.restore(&snapshot);
        Ok(())
    }

    /// Roll interrupted tasks back to ready after a process restart,
    /// preserving attempt counters.
    pub fn recover_interrupted(&mut self) -> Vec<String> {
        let interrupted: Vec<String> = self
            .nodes
            .values()
            .filter(|n| matches!(n.status(), TaskStatus::Running | TaskStatus::Verifying))
            .map(|n| n.task.id.clone())
            .collect();
        for id in &interrupted {
            if let Some(node) = self.nodes.get_mut(id) {
                node.task.status = TaskStatus::Ready;
                node.log("Rolled back from interrupted execution");
            }
        }
        self.update_ready();
        interrupted
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use foreman_types::Task;

    fn make_task(id: &str, deps: &[&str]) -> Task {
        let mut task = Task::new(
            "run1".to_string(),
            format!("Task {}", id),
            String::new(),
            "coder".to_string(),
        );
        task.id = id.to_string();
        task.depends_on = deps.iter().map(|d| d.to_string()).collect();
        task
    }

    fn linear_graph() -> TaskGraph {
        TaskGraph::build(
            "plan1",
            vec![
                make_task("a", &[]),
                make_task("b", &["a"]),
                make_task("c", &["b"]),
            ],
            true,
        )
        .unwrap()
    }

    #[test]
    fn roots_become_ready_on_construction() {
        let graph = linear_graph();
        assert_eq!(graph.ready_tasks(), vec!["a".to_string()]);
        assert_eq!(graph.node("b").unwrap().status(), TaskStatus::Pending);
    }

    #[test]
    fn unknown_dependency_rejected() {
        let err = TaskGraph::build("p", vec![make_task("a", &["ghost"])], true).unwrap_err();
        assert!(matches!(err, GraphError::UnknownDependency { .. }));
    }

    #[test]
    fn empty_plan_rejected() {
        assert!(matches!(
            TaskGraph::build("p", vec![], true),
            Err(GraphError::Empty)
        ));
    }

    #[test]
    fn duplicate_ids_rejected() {
        let err = TaskGraph::build(
            "p",
            vec![make_task("a", &[]), make_task("a", &[])],
            true,
        )
        .unwrap_err();
        assert!(matches!(err, GraphError::DuplicateTaskId(_)));
    }

    #[test]
    fn cycle_detected() {
        let err = TaskGraph::build(
            "p",
            vec![
                make_task("a", &["c"]),
                make_task("b", &["a"]),
                make_task("c", &["b"]),
            ],
            true,
        )
        .unwrap_err();
        assert!(matches!(err, GraphError::Cycle(_)));
    }

    #[test]
    fn completion_promotes_dependents() {
        let mut graph = linear_graph();
        graph.mark_running("a").unwrap();
        graph.mark_completed("a", Some("done".to_string())).unwrap();
        assert_eq!(graph.ready_tasks(), vec!["b".to_string()]);
        assert_eq!(graph.node("c").unwrap().status(), TaskStatus::Pending);
    }

    #[test]
    fn running_requires_ready() {
        let mut graph = linear_graph();
        let err = graph.mark_running("b").unwrap_err();
        assert!(matches!(err, GraphError::InvalidTransition { .. }));
    }

    #[test]
    fn failure_blocks_transitive_dependents() {
        let mut graph = linear_graph();
        graph.mark_running("a").unwrap();
        graph.mark_failed("a", "boom").unwrap();

        assert_eq!(graph.node("b").unwrap().status(), TaskStatus::Blocked);
        assert_eq!(graph.node("c").unwrap().status(), TaskStatus::Blocked);
        assert!(graph
            .node("b")
            .unwrap()
            .error
            .as_deref()
            .unwrap()
            .contains("a"));
        assert!(graph.ready_tasks().is_empty());
        assert!(graph.has_failures());
    }

    #[test]
    fn skippable_failure_does_not_block_when_fail_fast_off() {
        let mut optional = make_task("a", &[]);
        optional.skippable = true;
        let mut graph = TaskGraph::build(
            "p",
            vec![optional, make_task("b", &["a"])],
            false,
        )
        .unwrap();
        graph.mark_running("a").unwrap();
        graph.mark_failed("a", "optional step broke").unwrap();
        assert_eq!(graph.node("b").unwrap().status(), TaskStatus::Ready);
    }

    #[test]
    fn retry_preserves_attempt_count() {
        let mut graph = linear_graph();
        graph.mark_running("a").unwrap();
        graph.mark_failed("a", "first failure").unwrap();

        assert!(graph.can_retry("a"));
        graph.retry("a").unwrap();
        let node = graph.node("a").unwrap();
        assert_eq!(node.status(), TaskStatus::Ready);
        assert_eq!(node.attempt, 1);
        assert!(node.error.is_none());
    }

    #[test]
    fn retry_exhaustion_is_terminal() {
        let mut graph = linear_graph();
        for _ in 0..3 {
            graph.unblock_dependents("a");
            if graph.node("a").unwrap().status() != TaskStatus::Ready {
                graph.retry("a").unwrap();
            }
            graph.mark_running("a").unwrap();
            graph.mark_failed("a", "again").unwrap();
        }
        // Attempt counter is at max_attempts (3): no further retry.
        assert_eq!(graph.node("a").unwrap().attempt, 3);
        assert!(!graph.can_retry("a"));
        assert!(matches!(
            graph.retry("a"),
            Err(GraphError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn topological_order_respects_priority_then_id() {
        let mut high = make_task("zz", &[]);
        high.priority = 10;
        let low = make_task("aa", &[]);
        let dependent = make_task("mm", &["zz", "aa"]);
        let graph = TaskGraph::build("p", vec![low, high, dependent], true).unwrap();

        let order = graph.topological_order();
        assert_eq!(order, vec!["zz", "aa", "mm"]);
    }

    #[test]
    fn execution_levels_group_parallel_tasks() {
        let graph = TaskGraph::build(
            "p",
            vec![
                make_task("a", &[]),
                make_task("b", &[]),
                make_task("c", &["a", "b"]),
                make_task("d", &["c"]),
            ],
            true,
        )
        .unwrap();
        let levels = graph.execution_levels();
        assert_eq!(levels.len(), 3);
        assert_eq!(levels[0], vec!["a", "b"]);
        assert_eq!(levels[1], vec!["c"]);
        assert_eq!(levels[2], vec!["d"]);
    }

    #[test]
    fn snapshot_restore_round_trips() {
        let mut graph = linear_graph();
        graph.mark_running("a").unwrap();
        graph.node_mut("a").unwrap().artifacts.insert(
            "api_schema".to_string(),
            serde_json::json!({"openapi": "3.0"}),
        );
        graph.mark_completed("a", Some("result-a".to_string())).unwrap();
        graph.mark_running("b").unwrap();

        let json = graph.snapshot_json();

        let mut restored = linear_graph();
        restored.restore_json(&json).unwrap();

        for id in ["a", "b", "c"] {
            let original = graph.node(id).unwrap();
            let copy = restored.node(id).unwrap();
            assert_eq!(original.status(), copy.status(), "status for {}", id);
            assert_eq!(original.attempt, copy.attempt, "attempt for {}", id);
            assert_eq!(original.artifacts, copy.artifacts, "artifacts for {}", id);
        }
        assert_eq!(
            restored.node("a").unwrap().result.as_deref(),
            Some("result-a")
        );
    }

    #[test]
    fn recover_interrupted_rolls_running_back_to_ready() {
        let mut graph = linear_graph();
        graph.mark_running("a").unwrap();
        let interrupted = graph.recover_interrupted();
        assert_eq!(interrupted, vec!["a".to_string()]);
        let node = graph.node("a").unwrap();
        assert_eq!(node.status(), TaskStatus::Ready);
        // Attempt counter survives the rollback.
        assert_eq!(node.attempt, 1);
    }

    #[test]
    fn progress_and_summary() {
        let mut graph = linear_graph();
        assert_eq!(graph.progress(), 0.0);
        graph.mark_running("a").unwrap();
        graph.mark_completed("a", None).unwrap();
        assert!((graph.progress() - 1.0 / 3.0).abs() < f64::EPSILON);

        let summary = graph.status_summary();
        assert_eq!(summary.get("completed"), Some(&1));
        assert_eq!(summary.get("ready"), Some(&1));
        assert_eq!(summary.get("pending"), Some(&1));
        assert!(!graph.is_complete());
    }

    #[test]
    fn input_artifacts_collects_from_dependencies() {
        let mut graph = linear_graph();
        graph.mark_running("a").unwrap();
        graph
            .node_mut("a")
            .unwrap()
            .artifacts
            .insert("dockerfile".to_string(), serde_json::json!("FROM scratch"));
        graph.mark_completed("a", None).unwrap();

        let inputs = graph.input_artifacts("b");
        assert_eq!(inputs.len(), 1);
        assert!(inputs["a"].contains_key("dockerfile"));
        assert!(graph.input_artifacts("a").is_empty());
    }
}
