// Foreman orchestration engine
// Task graph, planner parsing, agent contract, quality gates, git
// subsystem, recovery policy, and the execution engine that ties them
// together over durable run state.

pub mod agents;
pub mod engine;
pub mod gates;
pub mod git;
pub mod graph;
pub mod planner;
pub mod recovery;
pub mod runner;

pub use agents::{
    collect_response, parse_markers, Agent, AgentError, AgentMarker, AgentRegistry, ChatMessage,
    ChatOverrides, ChunkStream, THINKING_MARKER,
};
pub use engine::{list_active_runs, load_run, EngineDeps, EngineError, Orchestrator};
pub use gates::{fix_feedback, GateConfig, GateRunner};
pub use git::{sanitize_branch_name, GitOps};
pub use graph::{GraphError, GraphSnapshot, NodeSnapshot, TaskGraph, TaskNode};
pub use planner::{build_planning_prompt, parse_task_list};
pub use recovery::{
    backoff_delay, classify_error, determine_recovery_action, escape_prompt_text,
    fallback_agents_for, FailureContext, FailureKind, FailureLog, RecoveryAction, RecoveryConfig,
    Strategy,
};
pub use runner::{run_agent_with_tools, ToolLoopError, ToolLoopResult};
