// Orchestrator events
// Typed events emitted at every state transition, serialized as SSE lines.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The closed set of event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    // Lifecycle
    ProjectStarted,
    PlanningStarted,
    PlanningCompleted,
    ProjectCompleted,
    ProjectFailed,
    Paused,
    Resumed,
    // Tasks
    TaskCreated,
    TaskStarted,
    TaskProgress,
    TaskAgentOutput,
    TaskCompleted,
    TaskFailed,
    TaskFixing,
    // Gates
    QualityGateCheck,
    QualityGatePassed,
    QualityGateFailed,
    // Git
    GitCommit,
    GitPush,
    GitPrCreated,
    // Tooling
    ModelSelected,
    Error,
    Timeout,
}

/// An event emitted by the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub run_id: String,
    pub data: Value,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl OrchestratorEvent {
    pub fn new(kind: EventKind, run_id: impl Into<String>, data: Value) -> Self {
        Self {
            kind,
            run_id: run_id.into(),
            data,
            timestamp: chrono::Utc::now(),
        }
    }

    /// Format as a Server-Sent-Events record.
    pub fn to_sse(&self) -> String {
        // Serialization of this struct cannot fail: every field is a plain
        // value and `data` is already a serde_json::Value.
        let json = serde_json::to_string(self).unwrap_or_default();
        format!("data: {}\n\n", json)
    }
}

/// Terminator sentinel closing an event stream.
pub fn sse_done() -> &'static str {
    "data: [DONE]\n\n"
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn event_kind_serializes_snake_case() {
        let json = serde_json::to_string(&EventKind::QualityGateFailed).unwrap();
        assert_eq!(json, "\"quality_gate_failed\"");
        let json = serde_json::to_string(&EventKind::GitPrCreated).unwrap();
        assert_eq!(json, "\"git_pr_created\"");
    }

    #[test]
    fn sse_line_has_data_prefix_and_terminator() {
        let event = OrchestratorEvent::new(
            EventKind::TaskStarted,
            "run1",
            json!({ "task_id": "t1" }),
        );
        let line = event.to_sse();
        assert!(line.starts_with("data: {"));
        assert!(line.ends_with("\n\n"));
        assert!(line.contains("\"type\":\"task_started\""));
        assert!(line.contains("\"run_id\":\"run1\""));
    }

    #[test]
    fn sse_round_trips_through_json() {
        let event = OrchestratorEvent::new(EventKind::GitCommit, "r", json!({"sha": "abc"}));
        let line = event.to_sse();
        let payload = line.trim_start_matches("data: ").trim_end();
        let parsed: OrchestratorEvent = serde_json::from_str(payload).unwrap();
        assert_eq!(parsed.kind, EventKind::GitCommit);
        assert_eq!(parsed.data["sha"], "abc");
    }

    #[test]
    fn done_sentinel() {
        assert_eq!(sse_done(), "data: [DONE]\n\n");
    }
}
