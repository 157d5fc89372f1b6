// Audit sink contract
// Append-only, hash-preserving records of tool calls, file operations, LLM
// exchanges, and budget checks. The durable implementation lives in the
// persistence crate; this module owns the trait, the redaction/truncation
// helpers, and diff compression.

use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;

// ============================================================================
// Context and flags
// ============================================================================

/// Who caused the audited event.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditContext {
    pub session_id: Option<String>,
    pub task_id: Option<String>,
    pub agent_id: Option<String>,
}

impl AuditContext {
    pub fn new(
        session_id: Option<&str>,
        task_id: Option<&str>,
        agent_id: Option<&str>,
    ) -> Self {
        Self {
            session_id: session_id.map(str::to_string),
            task_id: task_id.map(str::to_string),
            agent_id: agent_id.map(str::to_string),
        }
    }
}

/// Violation flags recorded with a tool result.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ViolationFlags {
    pub policy_blocked: bool,
    pub sandbox_violation: bool,
    pub budget_exceeded: bool,
    pub approval_rejected: bool,
}

/// A file operation audit payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileOpAudit {
    pub path: String,
    pub operation: String,
    pub before_hash: Option<String>,
    pub after_hash: Option<String>,
    /// Compressed unified diff, when captured
    pub diff_compressed: Option<Vec<u8>>,
    pub lines_added: u32,
    pub lines_removed: u32,
    pub in_workspace: bool,
    pub blocked: bool,
    pub approval_id: Option<String>,
    pub success: bool,
    pub error: Option<String>,
}

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("audit storage error: {0}")]
    Storage(String),
    #[error("audit record not found: {0}")]
    NotFound(String),
}

// ============================================================================
// Sink trait
// ============================================================================

/// Destination for durable audit records. Never read on hot paths.
pub trait AuditSink: Send + Sync {
    /// Generic categorized event; returns the record id.
    fn log_event(
        &self,
        category: &str,
        action: &str,
        ctx: &AuditContext,
        success: bool,
        metadata: Value,
    ) -> Result<String, AuditError>;

    /// Pre-execution tool call record; returns the record id that the
    /// post-call result links to.
    fn log_tool_call(
        &self,
        tool_name: &str,
        tool_action: Option<&str>,
        params: &Value,
        ctx: &AuditContext,
    ) -> Result<String, AuditError>;

    fn log_tool_result(
        &self,
        log_id: &str,
        success: bool,
        output: Option<&str>,
        error: Option<&str>,
        duration_ms: f64,
        flags: ViolationFlags,
    ) -> Result<(), AuditError>;

    fn log_file_operation(&self, op: &FileOpAudit, ctx: &AuditContext)
        -> Result<String, AuditError>;

    /// `direction` is "request" or "response". The body is truncated; the
    /// hash of the original is always retained.
    fn log_llm_exchange(
        &self,
        direction: &str,
        content: &str,
        ctx: &AuditContext,
    ) -> Result<String, AuditError>;

    fn log_budget_check(
        &self,
        budget_kind: &str,
        current: f64,
        limit: f64,
        exceeded: bool,
        ctx: &AuditContext,
    ) -> Result<(), AuditError>;
}

/// Sink that drops everything; used in tests and when auditing is disabled.
#[derive(Debug, Default, Clone)]
pub struct NullAuditSink;

impl AuditSink for NullAuditSink {
    fn log_event(
        &self,
        _category: &str,
        _action: &str,
        _ctx: &AuditContext,
        _success: bool,
        _metadata: Value,
    ) -> Result<String, AuditError> {
        Ok(String::new())
    }

    fn log_tool_call(
        &self,
        _tool_name: &str,
        _tool_action: Option<&str>,
        _params: &Value,
        _ctx: &AuditContext,
    ) -> Result<String, AuditError> {
        Ok(String::new())
    }

    fn log_tool_result(
        &self,
        _log_id: &str,
        _success: bool,
        _output: Option<&str>,
        _error: Option<&str>,
        _duration_ms: f64,
        _flags: ViolationFlags,
    ) -> Result<(), AuditError> {
        Ok(())
    }

    fn log_file_operation(
        &self,
        _op: &FileOpAudit,
        _ctx: &AuditContext,
    ) -> Result<String, AuditError> {
        Ok(String::new())
    }

    fn log_llm_exchange(
        &self,
        _direction: &str,
        _content: &str,
        _ctx: &AuditContext,
    ) -> Result<String, AuditError> {
        Ok(String::new())
    }

    fn log_budget_check(
        &self,
        _budget_kind: &str,
        _current: f64,
        _limit: f64,
        _exceeded: bool,
        _ctx: &AuditContext,
    ) -> Result<(), AuditError> {
        Ok(())
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// sha256 hex digest of a string.
pub fn hash_content(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

const SENSITIVE_KEYS: [&str; 6] = ["password", "secret", "token", "api_key", "apikey", "key"];
const MAX_PARAM_STR: usize = 100;

/// Redact sensitive keys and clamp long strings in tool parameters before
/// they are persisted.
pub fn redact_params(params: &Value) -> Value {
    match params {
        Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (key, value) in map {
                let lower = key.to_lowercase();
                let sensitive = SENSITIVE_KEYS.iter().any(|k| lower.contains(k));
                if sensitive {
                    let replacement = match value.as_str() {
                        Some(s) => format!("[REDACTED:{} chars]", s.len()),
                        None => "[REDACTED]".to_string(),
                    };
                    out.insert(key.clone(), Value::String(replacement));
                } else if let Some(s) = value.as_str() {
                    if s.len() > MAX_PARAM_STR {
                        out.insert(
                            key.clone(),
                            Value::String(format!(
                                "{}...[{} chars total]",
                                &s[..floor_char_boundary(s, MAX_PARAM_STR)],
                                s.len()
                            )),
                        );
                    } else {
                        out.insert(key.clone(), value.clone());
                    }
                } else {
                    out.insert(key.clone(), redact_params(value));
                }
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(redact_params).collect()),
        other => other.clone(),
    }
}

fn floor_char_boundary(s: &str, mut index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    while !s.is_char_boundary(index) {
        index -= 1;
    }
    index
}

/// Truncate a string to at most `max` characters with a marker, returning
/// `(possibly_truncated, original_hash)` so the original is recoverable by
/// hash comparison.
pub fn truncate_with_hash(content: &str, max: usize) -> (String, String) {
    let hash = hash_content(content);
    if content.chars().count() <= max {
        return (content.to_string(), hash);
    }
    let cut: String = content.chars().take(max).collect();
    (format!("{}\n... [truncated]", cut), hash)
}

/// Compress a diff for storage.
pub fn compress_diff(diff: &str) -> Vec<u8> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    // Writing to a Vec cannot fail.
    let _ = encoder.write_all(diff.as_bytes());
    encoder.finish().unwrap_or_default()
}

/// Inverse of `compress_diff`, byte-for-byte.
pub fn decompress_diff(compressed: &[u8]) -> Result<String, AuditError> {
    let mut decoder = ZlibDecoder::new(compressed);
    let mut out = String::new();
    decoder
        .read_to_string(&mut out)
        .map_err(|e| AuditError::Storage(format!("diff decompression failed: {}", e)))?;
    Ok(out)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn hash_is_stable_sha256_hex() {
        let h = hash_content("hello");
        assert_eq!(h.len(), 64);
        assert_eq!(h, hash_content("hello"));
        assert_ne!(h, hash_content("hello!"));
    }

    #[test]
    fn sensitive_params_are_redacted() {
        let params = json!({
            "path": "src/main.rs",
            "api_key": "sk_live_123456",
            "password": "hunter2",
            "nested": { "token": "abc" },
        });
        let redacted = redact_params(&params);
        assert_eq!(redacted["path"], "src/main.rs");
        assert_eq!(redacted["api_key"], "[REDACTED:14 chars]");
        assert_eq!(redacted["password"], "[REDACTED:7 chars]");
        assert_eq!(redacted["nested"]["token"], "[REDACTED:3 chars]");
    }

    #[test]
    fn long_strings_are_clamped() {
        let long = "x".repeat(250);
        let redacted = redact_params(&json!({ "content": long }));
        let stored = redacted["content"].as_str().unwrap();
        assert!(stored.starts_with(&"x".repeat(100)));
        assert!(stored.contains("[250 chars total]"));
    }

    #[test]
    fn truncate_preserves_original_hash() {
        let content = "line\n".repeat(100);
        let (truncated, hash) = truncate_with_hash(&content, 50);
        assert!(truncated.ends_with("[truncated]"));
        assert_eq!(hash, hash_content(&content));

        let (untouched, hash2) = truncate_with_hash("short", 50);
        assert_eq!(untouched, "short");
        assert_eq!(hash2, hash_content("short"));
    }

    #[test]
    fn diff_compression_round_trips() {
        let diff = "--- a/file\n+++ b/file\n@@ -1 +1 @@\n-old\n+new\n";
        let compressed = compress_diff(diff);
        assert!(!compressed.is_empty());
        let restored = decompress_diff(&compressed).unwrap();
        assert_eq!(restored, diff);
    }

    #[test]
    fn null_sink_accepts_everything() {
        let sink = NullAuditSink;
        let ctx = AuditContext::default();
        let id = sink
            .log_tool_call("filesystem", Some("write"), &json!({}), &ctx)
            .unwrap();
        sink.log_tool_result(&id, true, Some("ok"), None, 1.0, ViolationFlags::default())
            .unwrap();
    }
}
