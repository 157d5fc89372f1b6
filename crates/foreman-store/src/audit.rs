// Durable audit repositories
// Implements the guard crate's AuditSink over SQLite. Append-only: rows are
// inserted on the hot path and only read by the query surface below.

use chrono::Utc;
use rusqlite::params;
use serde_json::Value;

use foreman_guard::{
    hash_content, redact_params, AuditContext, AuditError, AuditSink, FileOpAudit, ViolationFlags,
};

use crate::db::Database;
use crate::Result;

/// Body text beyond this many characters is truncated before persisting;
/// the full-content hash is always kept.
const MAX_LLM_BODY: usize = 1000;

#[derive(Clone)]
pub struct SqliteAuditSink {
    db: Database,
}

impl SqliteAuditSink {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    fn storage_err(e: impl std::fmt::Display) -> AuditError {
        AuditError::Storage(e.to_string())
    }

    // ========================================================================
    // Query surface (never used on hot paths)
    // ========================================================================

    pub fn tool_logs(&self, session_id: &str, limit: usize) -> Result<Vec<Value>> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare(
            "SELECT tool_name, tool_action, params_redacted_json, success, error, duration_ms,
                    policy_blocked, sandbox_violation, budget_exceeded, created_at
             FROM audit_tool WHERE session_id = ?1 ORDER BY created_at DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![session_id, limit], |row| {
            let params_json: String = row.get(2)?;
            Ok(serde_json::json!({
                "tool_name": row.get::<_, String>(0)?,
                "tool_action": row.get::<_, Option<String>>(1)?,
                "parameters": serde_json::from_str::<Value>(&params_json).unwrap_or(Value::Null),
                "success": row.get::<_, Option<bool>>(3)?,
                "error": row.get::<_, Option<String>>(4)?,
                "duration_ms": row.get::<_, Option<f64>>(5)?,
                "policy_blocked": row.get::<_, bool>(6)?,
                "sandbox_violation": row.get::<_, bool>(7)?,
                "budget_exceeded": row.get::<_, bool>(8)?,
                "created_at": row.get::<_, chrono::DateTime<Utc>>(9)?.to_rfc3339(),
            }))
        })?;
        let mut logs = Vec::new();
        for row in rows {
            logs.push(row?);
        }
        Ok(logs)
    }

    pub fn file_changes(&self, session_id: &str, limit: usize) -> Result<Vec<Value>> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare(
            "SELECT path, operation, in_workspace, blocked, success, error, approval_id, created_at
             FROM audit_file WHERE session_id = ?1 ORDER BY created_at DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![session_id, limit], |row| {
            Ok(serde_json::json!({
                "path": row.get::<_, String>(0)?,
                "operation": row.get::<_, String>(1)?,
                "in_workspace": row.get::<_, bool>(2)?,
                "blocked": row.get::<_, bool>(3)?,
                "success": row.get::<_, bool>(4)?,
                "error": row.get::<_, Option<String>>(5)?,
                "approval_id": row.get::<_, Option<String>>(6)?,
                "created_at": row.get::<_, chrono::DateTime<Utc>>(7)?.to_rfc3339(),
            }))
        })?;
        let mut changes = Vec::new();
        for row in rows {
            changes.push(row?);
        }
        Ok(changes)
    }

    pub fn budget_violations(&self, session_id: &str) -> Result<Vec<Value>> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare(
            "SELECT budget_kind, current_value, limit_value, created_at
             FROM audit_budget WHERE session_id = ?1 AND exceeded = 1 ORDER BY created_at DESC",
        )?;
        let rows = stmt.query_map(params![session_id], |row| {
            Ok(serde_json::json!({
                "budget_kind": row.get::<_, String>(0)?,
                "current": row.get::<_, f64>(1)?,
                "limit": row.get::<_, f64>(2)?,
                "created_at": row.get::<_, chrono::DateTime<Utc>>(3)?.to_rfc3339(),
            }))
        })?;
        let mut violations = Vec::new();
        for row in rows {
            violations.push(row?);
        }
        Ok(violations)
    }

    /// Tool calls flagged with a sandbox or policy violation.
    pub fn security_events(&self, limit: usize) -> Result<Vec<Value>> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare(
            "SELECT tool_name, error, sandbox_violation, policy_blocked, agent_id, created_at
             FROM audit_tool WHERE sandbox_violation = 1 OR policy_blocked = 1
             ORDER BY created_at DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit], |row| {
            Ok(serde_json::json!({
                "tool_name": row.get::<_, String>(0)?,
                "error": row.get::<_, Option<String>>(1)?,
                "sandbox_violation": row.get::<_, bool>(2)?,
                "policy_blocked": row.get::<_, bool>(3)?,
                "agent_id": row.get::<_, Option<String>>(4)?,
                "created_at": row.get::<_, chrono::DateTime<Utc>>(5)?.to_rfc3339(),
            }))
        })?;
        let mut events = Vec::new();
        for row in rows {
            events.push(row?);
        }
        Ok(events)
    }

    /// Retention: keep at most `keep` newest rows in each audit table.
    pub fn prune(&self, keep: usize) -> Result<()> {
        let conn = self.db.conn();
        for table in ["audit_events", "audit_tool", "audit_file", "audit_llm", "audit_budget"] {
            conn.execute(
                &format!(
                    "DELETE FROM {table} WHERE id NOT IN
                     (SELECT id FROM {table} ORDER BY created_at DESC LIMIT ?1)"
                ),
                params![keep],
            )?;
        }
        Ok(())
    }
}

impl AuditSink for SqliteAuditSink {
    fn log_event(
        &self,
        category: &str,
        action: &str,
        ctx: &AuditContext,
        success: bool,
        metadata: Value,
    ) -> std::result::Result<String, AuditError> {
        let id = uuid::Uuid::new_v4().to_string();
        self.db
            .conn()
            .execute(
                "INSERT INTO audit_events (id, category, action, session_id, task_id, agent_id,
                                           success, metadata_json, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    id,
                    category,
                    action,
                    ctx.session_id,
                    ctx.task_id,
                    ctx.agent_id,
                    success,
                    metadata.to_string(),
                    Utc::now(),
                ],
            )
            .map_err(Self::storage_err)?;
        Ok(id)
    }

    fn log_tool_call(
        &self,
        tool_name: &str,
        tool_action: Option<&str>,
        params: &Value,
        ctx: &AuditContext,
    ) -> std::result::Result<String, AuditError> {
        let id = uuid::Uuid::new_v4().to_string();
        let redacted = redact_params(params);
        let params_hash = hash_content(&params.to_string());
        self.db
            .conn()
            .execute(
                "INSERT INTO audit_tool (id, tool_name, tool_action, params_redacted_json,
                                         params_hash, session_id, task_id, agent_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    id,
                    tool_name,
                    tool_action,
                    redacted.to_string(),
                    params_hash,
                    ctx.session_id,
                    ctx.task_id,
                    ctx.agent_id,
                    Utc::now(),
                ],
            )
            .map_err(Self::storage_err)?;
        Ok(id)
    }

    fn log_tool_result(
        &self,
        log_id: &str,
        success: bool,
        output: Option<&str>,
        error: Option<&str>,
        duration_ms: f64,
        flags: ViolationFlags,
    ) -> std::result::Result<(), AuditError> {
        let output_length = output.map(|o| o.len() as i64);
        let output_hash = output.map(hash_content);
        let updated = self
            .db
            .conn()
            .execute(
                "UPDATE audit_tool SET success = ?2, output_length = ?3, output_hash = ?4,
                                       error = ?5, duration_ms = ?6, policy_blocked = ?7,
                                       sandbox_violation = ?8, budget_exceeded = ?9,
                                       approval_rejected = ?10, completed_at = ?11
                 WHERE id = ?1",
                params![
                    log_id,
                    success,
                    output_length,
                    output_hash,
                    error,
                    duration_ms,
                    flags.policy_blocked,
                    flags.sandbox_violation,
                    flags.budget_exceeded,
                    flags.approval_rejected,
                    Utc::now(),
                ],
            )
            .map_err(Self::storage_err)?;
        if updated == 0 {
            return Err(AuditError::NotFound(log_id.to_string()));
        }
        Ok(())
    }

    fn log_file_operation(
        &self,
        op: &FileOpAudit,
        ctx: &AuditContext,
    ) -> std::result::Result<String, AuditError> {
        let id = uuid::Uuid::new_v4().to_string();
        self.db
            .conn()
            .execute(
                "INSERT INTO audit_file (id, path, operation, before_hash, after_hash,
                                         diff_compressed, lines_added, lines_removed,
                                         in_workspace, blocked, approval_id, success, error,
                                         session_id, task_id, agent_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
                params![
                    id,
                    op.path,
                    op.operation,
                    op.before_hash,
                    op.after_hash,
                    op.diff_compressed,
                    op.lines_added,
                    op.lines_removed,
                    op.in_workspace,
                    op.blocked,
                    op.approval_id,
                    op.success,
                    op.error,
                    ctx.session_id,
                    ctx.task_id,
                    ctx.agent_id,
                    Utc::now(),
                ],
            )
            .map_err(Self::storage_err)?;
        Ok(id)
    }

    fn log_llm_exchange(
        &self,
        direction: &str,
        content: &str,
        ctx: &AuditContext,
    ) -> std::result::Result<String, AuditError> {
        let id = uuid::Uuid::new_v4().to_string();
        let (body, content_hash) = foreman_guard::truncate_with_hash(content, MAX_LLM_BODY);
        self.db
            .conn()
            .execute(
                "INSERT INTO audit_llm (id, direction, content_hash, content_length, content_body,
                                        session_id, task_id, agent_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    id,
                    direction,
                    content_hash,
                    content.len() as i64,
                    body,
                    ctx.session_id,
                    ctx.task_id,
                    ctx.agent_id,
                    Utc::now(),
                ],
            )
            .map_err(Self::storage_err)?;
        Ok(id)
    }

    fn log_budget_check(
        &self,
        budget_kind: &str,
        current: f64,
        limit: f64,
        exceeded: bool,
        ctx: &AuditContext,
    ) -> std::result::Result<(), AuditError> {
        self.db
            .conn()
            .execute(
                "INSERT INTO audit_budget (id, budget_kind, current_value, limit_value, exceeded,
                                           session_id, task_id, agent_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    uuid::Uuid::new_v4().to_string(),
                    budget_kind,
                    current,
                    limit,
                    exceeded,
                    ctx.session_id,
                    ctx.task_id,
                    ctx.agent_id,
                    Utc::now(),
                ],
            )
            .map_err(Self::storage_err)?;
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sink() -> SqliteAuditSink {
        SqliteAuditSink::new(Database::open_in_memory().unwrap())
    }

    fn ctx() -> AuditContext {
        AuditContext::new(Some("s1"), Some("t1"), Some("coder"))
    }

    #[test]
    fn tool_call_and_result_link_and_redact() {
        let sink = sink();
        let log_id = sink
            .log_tool_call(
                "filesystem",
                Some("write"),
                &json!({ "path": "a.txt", "api_key": "sk_live_xyz" }),
                &ctx(),
            )
            .unwrap();
        sink.log_tool_result(
            &log_id,
            true,
            Some("written"),
            None,
            12.5,
            ViolationFlags::default(),
        )
        .unwrap();

        let logs = sink.tool_logs("s1", 10).unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0]["success"], true);
        // The stored parameters went through redaction.
        let stored_key = logs[0]["parameters"]["api_key"].as_str().unwrap();
        assert!(stored_key.starts_with("[REDACTED"));
    }

    #[test]
    fn result_for_unknown_log_id_errors() {
        let sink = sink();
        let err = sink
            .log_tool_result("missing", true, None, None, 0.0, ViolationFlags::default())
            .unwrap_err();
        assert!(matches!(err, AuditError::NotFound(_)));
    }

    #[test]
    fn violation_flags_surface_in_security_events() {
        let sink = sink();
        let log_id = sink
            .log_tool_call("filesystem", Some("write"), &json!({ "path": "../x" }), &ctx())
            .unwrap();
        sink.log_tool_result(
            &log_id,
            false,
            None,
            Some("outside workspace"),
            0.0,
            ViolationFlags {
                sandbox_violation: true,
                ..ViolationFlags::default()
            },
        )
        .unwrap();

        let events = sink.security_events(10).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["sandbox_violation"], true);
    }

    #[test]
    fn llm_exchange_truncates_but_keeps_hash() {
        let sink = sink();
        let content = "x".repeat(5000);
        sink.log_llm_exchange("response", &content, &ctx()).unwrap();

        let conn_hash: String = sink
            .db
            .conn()
            .query_row("SELECT content_hash FROM audit_llm", [], |row| row.get(0))
            .unwrap();
        assert_eq!(conn_hash, hash_content(&content));

        let body: String = sink
            .db
            .conn()
            .query_row("SELECT content_body FROM audit_llm", [], |row| row.get(0))
            .unwrap();
        assert!(body.len() < content.len());
        assert!(body.ends_with("[truncated]"));
    }

    #[test]
    fn budget_violations_query() {
        let sink = sink();
        sink.log_budget_check("tool_calls_per_message", 30.0, 30.0, true, &ctx())
            .unwrap();
        sink.log_budget_check("shell_time_seconds", 10.0, 300.0, false, &ctx())
            .unwrap();
        let violations = sink.budget_violations("s1").unwrap();
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0]["budget_kind"], "tool_calls_per_message");
    }

    #[test]
    fn prune_keeps_newest_rows() {
        let sink = sink();
        for i in 0..10 {
            sink.log_event("cat", &format!("a{}", i), &ctx(), true, json!({}))
                .unwrap();
        }
        sink.prune(3).unwrap();
        let count: i64 = sink
            .db
            .conn()
            .query_row("SELECT count(*) FROM audit_events", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 3);
    }

    #[test]
    fn file_operation_round_trip_with_compressed_diff() {
        let sink = sink();
        let diff = "--- a/f\n+++ b/f\n@@ -1 +1 @@\n-x\n+y\n";
        let op = FileOpAudit {
            path: "f".to_string(),
            operation: "write".to_string(),
            before_hash: Some(hash_content("x")),
            after_hash: Some(hash_content("y")),
            diff_compressed: Some(foreman_guard::compress_diff(diff)),
            lines_added: 1,
            lines_removed: 1,
            in_workspace: true,
            blocked: false,
            approval_id: None,
            success: true,
            error: None,
        };
        sink.log_file_operation(&op, &ctx()).unwrap();

        let blob: Vec<u8> = sink
            .db
            .conn()
            .query_row("SELECT diff_compressed FROM audit_file", [], |row| row.get(0))
            .unwrap();
        assert_eq!(foreman_guard::decompress_diff(&blob).unwrap(), diff);
    }
}
