// Tool invocation types
// Shared between the interpreter, the enforcer, and the audit trail.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Result of executing a tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub success: bool,
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ToolResult {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            error: None,
            data: None,
        }
    }

    pub fn err(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: String::new(),
            error: Some(error.into()),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// A parsed tool invocation from agent output. Transient; never persisted
/// directly (the audit trail stores a redacted projection).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub tool_id: String,
    /// Key-value arguments; always a JSON object for well-formed invocations
    pub args: Value,
    pub raw_json: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parse_error: Option<String>,
}

impl ToolInvocation {
    pub fn arg_str(&self, key: &str) -> Option<&str> {
        self.args.get(key).and_then(Value::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn constructors() {
        let ok = ToolResult::ok("done");
        assert!(ok.success);
        assert!(ok.error.is_none());

        let err = ToolResult::err("boom");
        assert!(!err.success);
        assert_eq!(err.error.as_deref(), Some("boom"));
    }

    #[test]
    fn arg_accessor() {
        let inv = ToolInvocation {
            tool_id: "filesystem".to_string(),
            args: json!({ "action": "write", "path": "a.txt" }),
            raw_json: String::new(),
            parse_error: None,
        };
        assert_eq!(inv.arg_str("action"), Some("write"));
        assert_eq!(inv.arg_str("missing"), None);
    }
}
