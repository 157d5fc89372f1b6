// Foreman guardrails
// Every tool execution path goes through this crate: path validation,
// budget tracking, agent policy resolution, diff-first approvals, redaction,
// and audit logging, unified behind the GuardrailsEnforcer.

pub mod approval;
pub mod audit;
pub mod budget;
pub mod enforcer;
pub mod path_security;
pub mod policy;
pub mod redaction;

pub use approval::{ActionKind, ApprovalError, ApprovalManager, ApprovalStatus, PendingApproval};
pub use audit::{
    compress_diff, decompress_diff, hash_content, redact_params, truncate_with_hash, AuditContext,
    AuditError, AuditSink, FileOpAudit, NullAuditSink, ViolationFlags,
};
pub use budget::{BudgetExceeded, BudgetKind, BudgetPolicy, BudgetTracker};
pub use enforcer::{EnforcementResult, GuardrailsEnforcer};
pub use path_security::{
    FileOp, PathValidator, SecurityAudit, SecurityViolation, ViolationKind,
};
pub use policy::{AgentPolicy, DiffApprovalPolicy, FilesystemPolicy, PolicyRegistry};
pub use redaction::RedactionPipeline;
