// Foreman shared types
// Data model for runs, tasks, events, sessions, and tool invocations.

pub mod events;
pub mod project;
pub mod session;
pub mod tool;

pub use events::{EventKind, OrchestratorEvent};
pub use project::{
    Artifact, Attempt, GateKind, GateResult, QualityGate, Run, RunConfig, RunState, Task,
    TaskStatus,
};
pub use session::{ChannelKind, MessageEnvelope, MessageRole, Session, StoredMessage};
pub use tool::{ToolInvocation, ToolResult};

/// Generate a short content-free identifier (8 hex chars of a v4 UUID),
/// matching the id shape used for tasks and runs throughout the system.
pub fn short_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}
