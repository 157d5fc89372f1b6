// Foreman persistence
// SQLite-backed repositories for runs, tasks, attempts, artifacts and logs,
// the durable audit sink, and the channel-neutral session resolver. Every
// engine state transition lands here.

pub mod audit;
pub mod db;
pub mod runs;
pub mod sessions;

pub use audit::SqliteAuditSink;
pub use db::{Database, StoreError};
pub use runs::{ArtifactRepository, LogRepository, RunRepository, TaskRepository};
pub use sessions::{ResolvedSession, SessionResolver};

pub type Result<T> = std::result::Result<T, StoreError>;
