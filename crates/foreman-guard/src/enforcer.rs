// Guardrails enforcer
// Single enforcement point for every tool execution path. Callers must run
// check_tool_execution before the tool executes and record_tool_execution
// after it completes, regardless of the entry point.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use serde_json::Value;

use foreman_types::ToolResult;

use crate::approval::{ApprovalManager, ApprovalStatus};
use crate::audit::{AuditContext, AuditSink, FileOpAudit, ViolationFlags};
use crate::budget::BudgetTracker;
use crate::path_security::{FileOp, PathValidator};
use crate::policy::{AgentPolicy, PolicyRegistry};

// ============================================================================
// Enforcement result
// ============================================================================

/// Outcome of a guardrails check.
#[derive(Debug, Clone, Default)]
pub struct EnforcementResult {
    pub allowed: bool,
    pub error: Option<String>,
    pub policy_blocked: bool,
    pub sandbox_violation: bool,
    pub budget_exceeded: bool,
    pub approval_rejected: bool,
    /// Pre-call audit row, linked by the post-call record
    pub audit_log_id: Option<String>,
    pub approval_id: Option<String>,
}

impl EnforcementResult {
    fn allow() -> Self {
        Self {
            allowed: true,
            ..Self::default()
        }
    }

    pub fn flags(&self) -> ViolationFlags {
        ViolationFlags {
            policy_blocked: self.policy_blocked,
            sandbox_violation: self.sandbox_violation,
            budget_exceeded: self.budget_exceeded,
            approval_rejected: self.approval_rejected,
        }
    }
}

// ============================================================================
// Enforcer
// ============================================================================

/// Centralizes tool allowlists, the filesystem jail, budget limits,
/// diff-first approval, and audit logging.
pub struct GuardrailsEnforcer {
    ctx: AuditContext,
    policy: AgentPolicy,
    budget: StdMutex<BudgetTracker>,
    validator: PathValidator,
    approvals: Arc<ApprovalManager>,
    sink: Arc<dyn AuditSink>,
    files_written: StdMutex<Vec<String>>,
}

impl GuardrailsEnforcer {
    /// Build an enforcer for an agent. Unknown agents resolve to the
    /// default-deny policy.
    pub fn for_agent(
        registry: &PolicyRegistry,
        agent_id: &str,
        session_id: Option<&str>,
        task_id: Option<&str>,
        approvals: Arc<ApprovalManager>,
        sink: Arc<dyn AuditSink>,
    ) -> Self {
        let policy = registry.resolve(agent_id);
        let budget = BudgetTracker::new(
            policy.budget.clone(),
            session_id.map(str::to_string),
            Some(agent_id.to_string()),
        );
        let workspace = if policy.filesystem.workspace_path.is_empty() {
            PathBuf::from(registry.workspace_path())
        } else {
            PathBuf::from(&policy.filesystem.workspace_path)
        };
        let allowed_dirs = if policy.filesystem.write_paths.is_empty() {
            vec![workspace.clone()]
        } else {
            policy.filesystem.write_paths.iter().map(PathBuf::from).collect()
        };
        Self {
            ctx: AuditContext::new(session_id, task_id, Some(agent_id)),
            policy,
            budget: StdMutex::new(budget),
            validator: PathValidator::new(allowed_dirs, workspace),
            approvals,
            sink,
            files_written: StdMutex::new(Vec::new()),
        }
    }

    pub fn policy(&self) -> &AgentPolicy {
        &self.policy
    }

    pub fn workspace(&self) -> &std::path::Path {
        self.validator.workspace()
    }

    /// Check whether a tool execution is allowed. Must run before every
    /// execution. Blocks while a diff-first approval is pending.
    pub async fn check_tool_execution(&self, tool_id: &str, args: &Value) -> EnforcementResult {
        // 1. Tool allowlist.
        if !self.policy.is_tool_allowed(tool_id) {
            let result = EnforcementResult {
                allowed: false,
                policy_blocked: true,
                error: Some(format!(
                    "Tool '{}' not allowed for agent '{}'",
                    tool_id,
                    self.ctx.agent_id.as_deref().unwrap_or("unknown")
                )),
                ..EnforcementResult::default()
            };
            self.audit_blocked(tool_id, args, &result);
            return result;
        }

        // 2. Budget ceilings.
        {
            let budget = self.budget.lock().expect("budget lock poisoned");
            let check = budget
                .check_tool_call()
                .and_then(|_| if tool_id == "shell" { budget.check_shell_call() } else { Ok(()) });
            if let Err(exceeded) = check {
                if let Err(e) = self.sink.log_budget_check(
                    exceeded.kind.as_str(),
                    exceeded.current,
                    exceeded.limit,
                    true,
                    &self.ctx,
                ) {
                    tracing::warn!("budget audit logging failed: {}", e);
                }
                return EnforcementResult {
                    allowed: false,
                    budget_exceeded: true,
                    error: Some(exceeded.to_string()),
                    ..EnforcementResult::default()
                };
            }
        }

        // 3. Filesystem jail for mutations.
        if tool_id == "filesystem" {
            let jail = self.check_filesystem_jail(args);
            if !jail.allowed {
                self.audit_blocked(tool_id, args, &jail);
                return jail;
            }
        }

        // 4. Diff-first approval.
        let mut approval_id = None;
        if self.policy.diff_approval.enabled {
            let decision = self.check_diff_approval(tool_id, args).await;
            if !decision.allowed {
                self.audit_blocked(tool_id, args, &decision);
                return decision;
            }
            approval_id = decision.approval_id;
        }

        // 5. Pre-call audit row.
        let action = args.get("action").and_then(Value::as_str);
        let audit_log_id = match self.sink.log_tool_call(tool_id, action, args, &self.ctx) {
            Ok(id) => Some(id),
            Err(e) => {
                tracing::warn!("audit logging failed: {}", e);
                None
            }
        };

        EnforcementResult {
            audit_log_id,
            approval_id,
            ..EnforcementResult::allow()
        }
    }

    /// Record a tool execution after it completes. Must run after every
    /// execution that passed the check.
    pub fn record_tool_execution(
        &self,
        tool_id: &str,
        args: &Value,
        tool_result: &ToolResult,
        duration_ms: f64,
        enforcement: &EnforcementResult,
    ) {
        {
            let mut budget = self.budget.lock().expect("budget lock poisoned");
            budget.record_tool_call(tool_result.output.len());
            if tool_id == "shell" && tool_result.success {
                budget.record_shell_time(duration_ms / 1000.0);
            }
        }

        let action = args.get("action").and_then(Value::as_str).unwrap_or("");
        let path = args.get("path").and_then(Value::as_str).unwrap_or("");

        if tool_id == "filesystem" && action == "write" && tool_result.success && !path.is_empty() {
            self.files_written
                .lock()
                .expect("files lock poisoned")
                .push(path.to_string());
        }

        if let Some(log_id) = &enforcement.audit_log_id {
            if let Err(e) = self.sink.log_tool_result(
                log_id,
                tool_result.success,
                Some(&tool_result.output),
                tool_result.error.as_deref(),
                duration_ms,
                enforcement.flags(),
            ) {
                tracing::warn!("audit result logging failed: {}", e);
            }
        }

        if tool_id == "filesystem" && matches!(action, "write" | "delete" | "copy") {
            let in_workspace = self
                .validator
                .validate(path, FileOp::Write, true, self.ctx.agent_id.as_deref(), None)
                .is_ok();
            let op = FileOpAudit {
                path: path.to_string(),
                operation: action.to_string(),
                before_hash: None,
                after_hash: args
                    .get("content")
                    .and_then(Value::as_str)
                    .map(crate::audit::hash_content),
                diff_compressed: None,
                lines_added: 0,
                lines_removed: 0,
                in_workspace,
                blocked: false,
                approval_id: enforcement.approval_id.clone(),
                success: tool_result.success,
                error: tool_result.error.clone(),
            };
            if let Err(e) = self.sink.log_file_operation(&op, &self.ctx) {
                tracing::warn!("file operation audit failed: {}", e);
            }
        }
    }

    // ========================================================================
    // Filesystem jail
    // ========================================================================

    fn check_filesystem_jail(&self, args: &Value) -> EnforcementResult {
        let action = args.get("action").and_then(Value::as_str).unwrap_or("");
        let op = match action {
            "write" => FileOp::Write,
            "delete" => FileOp::Delete,
            "copy" => FileOp::Copy,
            "create_dir" => FileOp::CreateDir,
            // Reads are not jailed.
            _ => return EnforcementResult::allow(),
        };

        let target = if op == FileOp::Copy {
            args.get("dest").and_then(Value::as_str).unwrap_or("")
        } else {
            args.get("path").and_then(Value::as_str).unwrap_or("")
        };

        if target.is_empty() {
            return EnforcementResult {
                allowed: false,
                error: Some(format!("Missing path for {} operation", action)),
                ..EnforcementResult::default()
            };
        }

        if !self.policy.filesystem.write_allowed {
            return EnforcementResult {
                allowed: false,
                sandbox_violation: true,
                error: Some(format!(
                    "Write operations not permitted for agent '{}'",
                    self.ctx.agent_id.as_deref().unwrap_or("unknown")
                )),
                ..EnforcementResult::default()
            };
        }

        match self.validator.validate(
            target,
            op,
            true,
            self.ctx.agent_id.as_deref(),
            self.ctx.session_id.as_deref(),
        ) {
            Ok(_) => EnforcementResult::allow(),
            Err(violation) => EnforcementResult {
                allowed: false,
                sandbox_violation: true,
                error: Some(format!(
                    "Write operations only allowed in workspace: {} ({})",
                    self.validator.workspace().display(),
                    violation.message
                )),
                ..EnforcementResult::default()
            },
        }
    }

    // ========================================================================
    // Diff-first approval (fail-closed)
    // ========================================================================

    async fn check_diff_approval(&self, tool_id: &str, args: &Value) -> EnforcementResult {
        let diff_policy = &self.policy.diff_approval;
        let action = args.get("action").and_then(Value::as_str).unwrap_or("");
        let path = args.get("path").and_then(Value::as_str).unwrap_or("");

        let approval_action = match tool_id {
            "filesystem" if action == "write" && diff_policy.requires_approval("write", path) => {
                Some("write")
            }
            "filesystem" if action == "delete" && diff_policy.requires_approval("delete", path) => {
                Some("delete")
            }
            "shell" if diff_policy.requires_approval("shell", "") => Some("shell"),
            _ => None,
        };

        let Some(approval_action) = approval_action else {
            return EnforcementResult::allow();
        };

        let session_id = self.ctx.session_id.as_deref().unwrap_or("");
        let agent_id = self.ctx.agent_id.as_deref().unwrap_or("");
        let task_id = self.ctx.task_id.as_deref();
        let timeout = diff_policy.approval_timeout_secs;

        let approval = match approval_action {
            "write" => {
                let new_content = args.get("content").and_then(Value::as_str).unwrap_or("");
                let original = self.read_for_diff(path);
                self.approvals
                    .create_write_approval(
                        session_id,
                        agent_id,
                        task_id,
                        path,
                        original.as_deref(),
                        new_content,
                        timeout,
                    )
                    .await
            }
            "delete" => {
                let original = self.read_for_diff(path);
                self.approvals
                    .create_delete_approval(
                        session_id,
                        agent_id,
                        task_id,
                        path,
                        original.as_deref(),
                        timeout,
                    )
                    .await
            }
            _ => {
                let command = args.get("command").and_then(Value::as_str).unwrap_or("");
                let workdir = args.get("workdir").and_then(Value::as_str);
                self.approvals
                    .create_shell_approval(session_id, agent_id, task_id, command, workdir, timeout)
                    .await
            }
        };

        if let Err(e) = self.sink.log_event(
            "diff_approval",
            "requested",
            &self.ctx,
            true,
            serde_json::json!({
                "approval_id": approval.id,
                "action_type": approval_action,
                "file_path": args.get("path"),
            }),
        ) {
            tracing::warn!("failed to log approval request: {}", e);
        }

        // Fail closed: any internal error while waiting denies the action.
        let status = match self.approvals.wait(&approval.id).await {
            Ok(status) => status,
            Err(e) => {
                tracing::error!("approval system error, denying action: {}", e);
                return EnforcementResult {
                    allowed: false,
                    approval_rejected: true,
                    approval_id: Some(approval.id.clone()),
                    error: Some(format!("Approval system error: {}", e)),
                    ..EnforcementResult::default()
                };
            }
        };

        match status {
            ApprovalStatus::Approved => {
                // Tamper detection: the content executed must be the content
                // that was approved.
                if approval_action == "write" {
                    let content = args.get("content").and_then(Value::as_str).unwrap_or("");
                    match self.approvals.verify_content(&approval.id, content).await {
                        Ok(true) => {}
                        Ok(false) => {
                            return EnforcementResult {
                                allowed: false,
                                approval_rejected: true,
                                approval_id: Some(approval.id),
                                error: Some(
                                    "Approved content hash mismatch; execution denied".to_string(),
                                ),
                                ..EnforcementResult::default()
                            }
                        }
                        Err(e) => {
                            return EnforcementResult {
                                allowed: false,
                                approval_rejected: true,
                                approval_id: Some(approval.id),
                                error: Some(format!("Approval verification error: {}", e)),
                                ..EnforcementResult::default()
                            }
                        }
                    }
                }
                EnforcementResult {
                    approval_id: Some(approval.id),
                    ..EnforcementResult::allow()
                }
            }
            ApprovalStatus::Rejected => {
                let note = self
                    .approvals
                    .get(&approval.id)
                    .await
                    .and_then(|a| a.note)
                    .unwrap_or_else(|| "No reason given".to_string());
                EnforcementResult {
                    allowed: false,
                    approval_rejected: true,
                    approval_id: Some(approval.id),
                    error: Some(format!("Action rejected by user: {}", note)),
                    ..EnforcementResult::default()
                }
            }
            ApprovalStatus::Expired => EnforcementResult {
                allowed: false,
                approval_rejected: true,
                approval_id: Some(approval.id),
                error: Some("Approval request expired".to_string()),
                ..EnforcementResult::default()
            },
            ApprovalStatus::Pending => EnforcementResult {
                allowed: false,
                approval_rejected: true,
                approval_id: Some(approval.id),
                error: Some("Approval still pending; execution denied".to_string()),
                ..EnforcementResult::default()
            },
        }
    }

    fn read_for_diff(&self, path: &str) -> Option<String> {
        let candidate = if std::path::Path::new(path).is_absolute() {
            PathBuf::from(path)
        } else {
            self.validator.workspace().join(path)
        };
        std::fs::read_to_string(candidate).ok()
    }

    // ========================================================================
    // Audit helpers
    // ========================================================================

    fn audit_blocked(&self, tool_id: &str, args: &Value, result: &EnforcementResult) {
        let action = args.get("action").and_then(Value::as_str);
        let logged = self
            .sink
            .log_tool_call(tool_id, action, args, &self.ctx)
            .and_then(|log_id| {
                self.sink.log_tool_result(
                    &log_id,
                    false,
                    None,
                    result.error.as_deref(),
                    0.0,
                    result.flags(),
                )
            });
        if let Err(e) = logged {
            tracing::warn!("failed to log blocked tool call: {}", e);
        }

        if result.sandbox_violation && tool_id == "filesystem" {
            let path = args.get("path").and_then(Value::as_str).unwrap_or("");
            let op = FileOpAudit {
                path: path.to_string(),
                operation: action.unwrap_or("").to_string(),
                before_hash: None,
                after_hash: None,
                diff_compressed: None,
                lines_added: 0,
                lines_removed: 0,
                in_workspace: false,
                blocked: true,
                approval_id: None,
                success: false,
                error: result.error.clone(),
            };
            if let Err(e) = self.sink.log_file_operation(&op, &self.ctx) {
                tracing::warn!("file operation audit failed: {}", e);
            }
        }
    }

    // ========================================================================
    // Message-scoped budget surface
    // ========================================================================

    pub fn check_tool_loop(&self) -> Result<(), crate::budget::BudgetExceeded> {
        self.budget
            .lock()
            .expect("budget lock poisoned")
            .check_tool_loop()
    }

    pub fn record_tool_loop(&self) {
        self.budget
            .lock()
            .expect("budget lock poisoned")
            .record_tool_loop();
    }

    pub fn reset_message_counters(&self) {
        self.budget
            .lock()
            .expect("budget lock poisoned")
            .reset_message_counters();
    }

    pub fn is_budget_exhausted(&self) -> bool {
        self.budget
            .lock()
            .expect("budget lock poisoned")
            .is_exhausted()
    }

    pub fn budget_remaining(&self) -> serde_json::Value {
        self.budget
            .lock()
            .expect("budget lock poisoned")
            .remaining()
    }

    pub fn files_written(&self) -> Vec<String> {
        self.files_written
            .lock()
            .expect("files lock poisoned")
            .clone()
    }
}

// ============================================================================
// Tests
// ============================================================================
