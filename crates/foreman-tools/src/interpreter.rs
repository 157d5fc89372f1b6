// Tool-call interpreter
// Parses tool invocation blocks from agent output, executes them through the
// registry under guardrails, and formats results for the next agent turn.
//
// Protocol:
//     <tool_call>{"tool": "filesystem", "args": {"action": "read", "path": "/f"}}</tool_call>
//
// Two fallback syntaxes are accepted: a fenced block labelled `tool`, and
// <function_call>...</function_call>. Multiple blocks per response execute
// in source order.

use std::sync::Arc;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use foreman_guard::GuardrailsEnforcer;
use foreman_types::{ToolInvocation, ToolResult};

use crate::ToolRegistry;

static TOOL_CALL_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)<tool_call>\s*(\{.*?\})\s*</tool_call>").expect("tool call pattern")
});

static ALT_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r"(?s)```tool\s*\n(\{.*?\})\s*\n```").expect("fenced tool pattern"),
        Regex::new(r"(?s)<function_call>\s*(\{.*?\})\s*</function_call>")
            .expect("function call pattern"),
    ]
});

// ============================================================================
// Parsing
// ============================================================================

/// Parse every tool-call block from agent output, primary syntax first,
/// falling back to the alternative syntaxes only when the primary matched
/// nothing.
pub fn parse_tool_blocks(text: &str) -> Vec<ToolInvocation> {
    let mut raw_blocks: Vec<String> = TOOL_CALL_PATTERN
        .captures_iter(text)
        .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()))
        .collect();

    if raw_blocks.is_empty() {
        for pattern in ALT_PATTERNS.iter() {
            raw_blocks = pattern
                .captures_iter(text)
                .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()))
                .collect();
            if !raw_blocks.is_empty() {
                break;
            }
        }
    }

    raw_blocks.iter().map(|raw| parse_single(raw)).collect()
}

fn parse_single(raw_json: &str) -> ToolInvocation {
    match serde_json::from_str::<Value>(raw_json) {
        Ok(data) => {
            // Both {"tool": ..., "args": ...} and {"name": ..., "arguments": ...}
            // are accepted.
            let tool_id = data
                .get("tool")
                .or_else(|| data.get("name"))
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string();
            let args = data
                .get("args")
                .or_else(|| data.get("arguments"))
                .cloned()
                .filter(Value::is_object)
                .unwrap_or_else(|| Value::Object(serde_json::Map::new()));

            if tool_id.is_empty() {
                return ToolInvocation {
                    tool_id,
                    args,
                    raw_json: raw_json.to_string(),
                    parse_error: Some("Missing 'tool' or 'name' field".to_string()),
                };
            }

            ToolInvocation {
                tool_id,
                args,
                raw_json: raw_json.to_string(),
                parse_error: None,
            }
        }
        Err(e) => ToolInvocation {
            tool_id: String::new(),
            args: Value::Object(serde_json::Map::new()),
            raw_json: raw_json.to_string(),
            parse_error: Some(format!("Invalid JSON: {}", e)),
        },
    }
}

pub fn has_tool_calls(text: &str) -> bool {
    TOOL_CALL_PATTERN.is_match(text) || ALT_PATTERNS.iter().any(|p| p.is_match(text))
}

/// Remove tool-call blocks, leaving the surrounding prose.
pub fn strip_tool_blocks(text: &str) -> String {
    let mut result = TOOL_CALL_PATTERN.replace_all(text, "").to_string();
    for pattern in ALT_PATTERNS.iter() {
        result = pattern.replace_all(&result, "").to_string();
    }
    result.trim().to_string()
}

/// One repair attempt per message: quote the bad JSON, the decoder error,
/// and repeat the schema reminder.
pub fn create_repair_prompt(raw_json: &str, error: &str) -> String {
    format!(
        "Your previous tool call had invalid JSON. Please fix and re-emit.\n\n\
         Invalid JSON:\n```\n{}\n```\n\n\
         Error: {}\n\n\
         Please emit a corrected tool call using this exact format:\n\
         <tool_call>{{\"tool\": \"tool_name\", \"args\": {{\"param\": \"value\"}}}}</tool_call>\n",
        raw_json, error
    )
}

// ============================================================================
// Execution
// ============================================================================

/// Result of executing one invocation.
#[derive(Debug, Clone)]
pub struct ToolExecutionResult {
    pub invocation: ToolInvocation,
    pub result: ToolResult,
    pub duration_ms: f64,
}

/// Interpreter limits.
#[derive(Debug, Clone)]
pub struct InterpreterConfig {
    pub per_call_timeout: Duration,
    /// Output beyond this is truncated in the formatted agent turn
    pub max_output_chars: usize,
}

impl Default for InterpreterConfig {
    fn default() -> Self {
        Self {
            per_call_timeout: Duration::from_secs(300),
            max_output_chars: 10_000,
        }
    }
}

/// Drives the multi-step tool loop for one agent message:
/// parse -> enforce -> execute -> format, until the agent stops emitting
/// invocations or a ceiling is hit.
pub struct ToolInterpreter {
    registry: ToolRegistry,
    enforcer: Arc<GuardrailsEnforcer>,
    config: InterpreterConfig,
    iteration: u32,
    repair_attempted: bool,
    history: Vec<ToolExecutionResult>,
}

impl ToolInterpreter {
    pub fn new(registry: ToolRegistry, enforcer: Arc<GuardrailsEnforcer>) -> Self {
        Self::with_config(registry, enforcer, InterpreterConfig::default())
    }

    pub fn with_config(
        registry: ToolRegistry,
        enforcer: Arc<GuardrailsEnforcer>,
        config: InterpreterConfig,
    ) -> Self {
        Self {
            registry,
            enforcer,
            config,
            iteration: 0,
            repair_attempted: false,
            history: Vec::new(),
        }
    }

    pub fn parse(&self, text: &str) -> Vec<ToolInvocation> {
        parse_tool_blocks(text)
    }

    /// Execute a batch of invocations in source order. A budget-exceeded
    /// failure aborts the remaining invocations in the batch.
    pub async fn execute(&mut self, invocations: Vec<ToolInvocation>) -> Vec<ToolExecutionResult> {
        let mut results = Vec::new();

        for invocation in invocations {
            if let Some(parse_error) = &invocation.parse_error {
                let error = format!("Parse error: {}", parse_error);
                results.push(ToolExecutionResult {
                    invocation,
                    result: ToolResult::err(error),
                    duration_ms: 0.0,
                });
                continue;
            }

            let enforcement = self
                .enforcer
                .check_tool_execution(&invocation.tool_id, &invocation.args)
                .await;

            if !enforcement.allowed {
                let abort_batch = enforcement.budget_exceeded;
                results.push(ToolExecutionResult {
                    invocation,
                    result: ToolResult::err(
                        enforcement
                            .error
                            .clone()
                            .unwrap_or_else(|| "Blocked by policy".to_string()),
                    ),
                    duration_ms: 0.0,
                });
                if abort_batch {
                    break;
                }
                continue;
            }

            let Some(tool) = self.registry.get(&invocation.tool_id).await else {
                let result = ToolResult::err(format!("Unknown tool: {}", invocation.tool_id));
                self.enforcer.record_tool_execution(
                    &invocation.tool_id,
                    &invocation.args,
                    &result,
                    0.0,
                    &enforcement,
                );
                results.push(ToolExecutionResult {
                    invocation,
                    result,
                    duration_ms: 0.0,
                });
                continue;
            };

            let start = Instant::now();
            let result = match tokio::time::timeout(
                self.config.per_call_timeout,
                tool.execute(invocation.args.clone()),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => ToolResult::err(format!(
                    "Tool execution timed out after {}s",
                    self.config.per_call_timeout.as_secs()
                )),
            };
            let duration_ms = start.elapsed().as_secs_f64() * 1000.0;

            self.enforcer.record_tool_execution(
                &invocation.tool_id,
                &invocation.args,
                &result,
                duration_ms,
                &enforcement,
            );

            tracing::info!(
                "tool {}: success={} duration={:.0}ms",
                invocation.tool_id,
                result.success,
                duration_ms
            );

            let exec = ToolExecutionResult {
                invocation,
                result,
                duration_ms,
            };
            self.history.push(exec.clone());
            results.push(exec);
        }

        results
    }

    /// Format results as the tagged block fed into the agent's next turn.
    pub fn format_results(&self, results: &[ToolExecutionResult]) -> String {
        if results.is_empty() {
            return String::new();
        }

        let mut parts = vec!["<tool_results>".to_string()];
        for exec in results {
            parts.push(format!("<result tool=\"{}\">", exec.invocation.tool_id));
            if exec.result.success {
                parts.push("<status>success</status>".to_string());
                let (output, _hash) = foreman_guard::truncate_with_hash(
                    &exec.result.output,
                    self.config.max_output_chars,
                );
                parts.push(format!("<output>{}</output>", output));
            } else {
                parts.push("<status>error</status>".to_string());
                parts.push(format!(
                    "<error>{}</error>",
                    exec.result.error.as_deref().unwrap_or("unknown error")
                ));
            }
            parts.push("</result>".to_string());
        }
        parts.push("</tool_results>".to_string());
        parts.join("\n")
    }

    /// Returns Ok(()) while another tool loop is allowed this message.
    pub fn check_iteration_limit(&self) -> Result<(), String> {
        self.enforcer
            .check_tool_loop()
            .map_err(|e| e.to_string())
    }

    pub fn increment_iteration(&mut self) {
        self.iteration += 1;
        self.enforcer.record_tool_loop();
    }

    pub fn iteration(&self) -> u32 {
        self.iteration
    }

    /// First invocation with a parse error, when repair has not yet been
    /// attempted this message.
    pub fn needs_repair<'a>(
        &self,
        invocations: &'a [ToolInvocation],
    ) -> Option<&'a ToolInvocation> {
        if self.repair_attempted {
            return None;
        }
        invocations.iter().find(|inv| inv.parse_error.is_some())
    }

    pub fn mark_repair_attempted(&mut self) {
        self.repair_attempted = true;
    }

    pub fn repair_prompt(&self, invocation: &ToolInvocation) -> String {
        create_repair_prompt(
            &invocation.raw_json,
            invocation.parse_error.as_deref().unwrap_or("Unknown error"),
        )
    }

    /// Reset per-message state at the start of a new agent turn.
    pub fn reset_message(&mut self) {
        self.iteration = 0;
        self.repair_attempted = false;
        self.enforcer.reset_message_counters();
    }

    pub fn history(&self) -> &[ToolExecutionResult] {
        &self.history
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use foreman_guard::{AgentPolicy, ApprovalManager, NullAuditSink, PolicyRegistry};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    struct EchoTool;

    #[async_trait]
    impl crate::Tool for EchoTool {
        fn id(&self) -> &str {
            "echo"
        }

        async fn execute(&self, args: Value) -> ToolResult {
            ToolResult::ok(args.get("text").and_then(Value::as_str).unwrap_or(""))
        }
    }

    struct SlowTool;

    #[async_trait]
    impl crate::Tool for SlowTool {
        fn id(&self) -> &str {
            "slow"
        }

        async fn execute(&self, _args: Value) -> ToolResult {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            ToolResult::ok("never")
        }
    }

    struct CountingTool(Arc<AtomicUsize>);

    #[async_trait]
    impl crate::Tool for CountingTool {
        fn id(&self) -> &str {
            "counter"
        }

        async fn execute(&self, _args: Value) -> ToolResult {
            self.0.fetch_add(1, Ordering::SeqCst);
            ToolResult::ok("counted")
        }
    }

    fn enforcer_with(
        workspace: &std::path::Path,
        mutate: impl FnOnce(&mut AgentPolicy),
    ) -> Arc<GuardrailsEnforcer> {
        let mut registry = PolicyRegistry::empty(workspace.display().to_string());
        let mut policy = AgentPolicy::default_deny();
        policy.agent_id = "test".to_string();
        policy.allowed_tools = None;
        mutate(&mut policy);
        registry.insert(policy);
        Arc::new(GuardrailsEnforcer::for_agent(
            &registry,
            "test",
            Some("s1"),
            None,
            Arc::new(ApprovalManager::new()),
            Arc::new(NullAuditSink),
        ))
    }

    async fn interpreter(workspace: &std::path::Path) -> ToolInterpreter {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool)).await;
        ToolInterpreter::new(registry, enforcer_with(workspace, |_| {}))
    }

    #[test]
    fn parse_single_tool_call() {
        let text = r#"I'll read the file.
<tool_call>{"tool": "filesystem", "args": {"action": "read", "path": "/f"}}</tool_call>"#;
        let invocations = parse_tool_blocks(text);
        assert_eq!(invocations.len(), 1);
        assert_eq!(invocations[0].tool_id, "filesystem");
        assert_eq!(invocations[0].arg_str("action"), Some("read"));
        assert!(invocations[0].parse_error.is_none());
    }

    #[test]
    fn parse_multiple_tool_calls_in_order() {
        let text = r#"<tool_call>{"tool": "a", "args": {}}</tool_call>
some text
<tool_call>{"tool": "b", "args": {"nested": {"x": 1}}}</tool_call>"#;
        let invocations = parse_tool_blocks(text);
        assert_eq!(invocations.len(), 2);
        assert_eq!(invocations[0].tool_id, "a");
        assert_eq!(invocations[1].tool_id, "b");
        assert_eq!(invocations[1].args["nested"]["x"], 1);
    }

    #[test]
    fn parse_fenced_tool_block() {
        let text = "```tool\n{\"tool\": \"shell\", \"args\": {\"command\": \"ls\"}}\n```";
        let invocations = parse_tool_blocks(text);
        assert_eq!(invocations.len(), 1);
        assert_eq!(invocations[0].tool_id, "shell");
    }

    #[test]
    fn parse_function_call_format() {
        let text = r#"<function_call>{"name": "web_search", "arguments": {"query": "rust"}}</function_call>"#;
        let invocations = parse_tool_blocks(text);
        assert_eq!(invocations.len(), 1);
        assert_eq!(invocations[0].tool_id, "web_search");
        assert_eq!(invocations[0].arg_str("query"), Some("rust"));
    }

    #[test]
    fn parse_invalid_json_records_error() {
        let text = r#"<tool_call>{"tool": "x", "args": {broken}</tool_call>"#;
        let invocations = parse_tool_blocks(text);
        assert_eq!(invocations.len(), 1);
        assert!(invocations[0]
            .parse_error
            .as_deref()
            .unwrap()
            .contains("Invalid JSON"));
    }

    #[test]
    fn parse_missing_tool_field() {
        let text = r#"<tool_call>{"args": {"a": 1}}</tool_call>"#;
        let invocations = parse_tool_blocks(text);
        assert_eq!(invocations.len(), 1);
        assert!(invocations[0]
            .parse_error
            .as_deref()
            .unwrap()
            .contains("Missing 'tool'"));
    }

    #[test]
    fn has_and_strip_tool_blocks() {
        let text = "before\n<tool_call>{\"tool\": \"x\", \"args\": {}}</tool_call>\nafter";
        assert!(has_tool_calls(text));
        assert!(!has_tool_calls("no calls here"));
        let stripped = strip_tool_blocks(text);
        assert_eq!(stripped, "before\n\nafter");
    }

    #[test]
    fn repair_prompt_quotes_error_and_schema() {
        let prompt = create_repair_prompt("{bad", "expected value at line 1");
        assert!(prompt.contains("{bad"));
        assert!(prompt.contains("expected value at line 1"));
        assert!(prompt.contains("<tool_call>"));
    }

    #[tokio::test]
    async fn executes_and_formats_success() {
        let temp = tempdir().unwrap();
        let mut interp = interpreter(temp.path()).await;
        let invocations =
            parse_tool_blocks(r#"<tool_call>{"tool": "echo", "args": {"text": "hi"}}</tool_call>"#);
        let results = interp.execute(invocations).await;
        assert_eq!(results.len(), 1);
        assert!(results[0].result.success);

        let formatted = interp.format_results(&results);
        assert!(formatted.starts_with("<tool_results>"));
        assert!(formatted.contains("<status>success</status>"));
        assert!(formatted.contains("<output>hi</output>"));
        assert!(formatted.ends_with("</tool_results>"));
    }

    #[tokio::test]
    async fn formats_error_result() {
        let temp = tempdir().unwrap();
        let mut interp = interpreter(temp.path()).await;
        let invocations =
            parse_tool_blocks(r#"<tool_call>{"tool": "nope", "args": {}}</tool_call>"#);
        let results = interp.execute(invocations).await;
        let formatted = interp.format_results(&results);
        assert!(formatted.contains("<status>error</status>"));
        assert!(formatted.contains("Unknown tool: nope"));
    }

    #[tokio::test]
    async fn long_output_truncated_in_format() {
        let temp = tempdir().unwrap();
        let registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool)).await;
        let mut interp = ToolInterpreter::with_config(
            registry,
            enforcer_with(temp.path(), |_| {}),
            InterpreterConfig {
                max_output_chars: 20,
                ..InterpreterConfig::default()
            },
        );
        let long_text = "x".repeat(100);
        let invocations = vec![ToolInvocation {
            tool_id: "echo".to_string(),
            args: json!({ "text": long_text }),
            raw_json: String::new(),
            parse_error: None,
        }];
        let results = interp.execute(invocations).await;
        let formatted = interp.format_results(&results);
        assert!(formatted.contains("[truncated]"));
    }

    #[tokio::test(start_paused = true)]
    async fn per_call_timeout_becomes_error() {
        let temp = tempdir().unwrap();
        let registry = ToolRegistry::new();
        registry.register(Arc::new(SlowTool)).await;
        let mut interp = ToolInterpreter::with_config(
            registry,
            enforcer_with(temp.path(), |_| {}),
            InterpreterConfig {
                per_call_timeout: Duration::from_secs(1),
                ..InterpreterConfig::default()
            },
        );
        let invocations = vec![ToolInvocation {
            tool_id: "slow".to_string(),
            args: json!({}),
            raw_json: String::new(),
            parse_error: None,
        }];
        let results = interp.execute(invocations).await;
        assert!(!results[0].result.success);
        assert!(results[0]
            .result
            .error
            .as_deref()
            .unwrap()
            .contains("timed out"));
    }

    #[tokio::test]
    async fn budget_exceeded_aborts_remaining_batch() {
        // Four invocations; ceiling of two calls per message. The first two
        // execute, the third fails with budget, the fourth never runs.
        let temp = tempdir().unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        let registry = ToolRegistry::new();
        registry.register(Arc::new(CountingTool(count.clone()))).await;
        let enforcer = enforcer_with(temp.path(), |policy| {
            policy.budget.max_tool_calls_per_message = 2;
        });
        let mut interp = ToolInterpreter::new(registry, enforcer);

        let invocations: Vec<ToolInvocation> = (0..4)
            .map(|_| ToolInvocation {
                tool_id: "counter".to_string(),
                args: json!({}),
                raw_json: String::new(),
                parse_error: None,
            })
            .collect();

        let results = interp.execute(invocations).await;
        assert_eq!(results.len(), 3);
        assert!(results[0].result.success);
        assert!(results[1].result.success);
        assert!(!results[2].result.success);
        assert!(results[2]
            .result
            .error
            .as_deref()
            .unwrap()
            .contains("Budget exceeded"));
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn policy_block_does_not_abort_batch() {
        let temp = tempdir().unwrap();
        let registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool)).await;
        let enforcer = enforcer_with(temp.path(), |policy| {
            policy.allowed_tools = Some(vec!["echo".to_string()]);
        });
        let mut interp = ToolInterpreter::new(registry, enforcer);

        let invocations = vec![
            ToolInvocation {
                tool_id: "shell".to_string(),
                args: json!({ "command": "ls" }),
                raw_json: String::new(),
                parse_error: None,
            },
            ToolInvocation {
                tool_id: "echo".to_string(),
                args: json!({ "text": "still runs" }),
                raw_json: String::new(),
                parse_error: None,
            },
        ];
        let results = interp.execute(invocations).await;
        assert_eq!(results.len(), 2);
        assert!(!results[0].result.success);
        assert!(results[0]
            .result
            .error
            .as_deref()
            .unwrap()
            .contains("not allowed"));
        assert!(results[1].result.success);
    }

    #[tokio::test]
    async fn repair_offered_only_once() {
        let temp = tempdir().unwrap();
        let mut interp = interpreter(temp.path()).await;
        let invocations =
            parse_tool_blocks(r#"<tool_call>{"tool": broken}</tool_call>"#);
        assert!(interp.needs_repair(&invocations).is_some());
        interp.mark_repair_attempted();
        assert!(interp.needs_repair(&invocations).is_none());
    }

    #[tokio::test]
    async fn iteration_ceiling_via_budget() {
        let temp = tempdir().unwrap();
        let registry = ToolRegistry::new();
        let enforcer = enforcer_with(temp.path(), |policy| {
            policy.budget.max_tool_loops_per_message = 2;
        });
        let mut interp = ToolInterpreter::new(registry, enforcer);
        assert!(interp.check_iteration_limit().is_ok());
        interp.increment_iteration();
        interp.increment_iteration();
        let err = interp.check_iteration_limit().unwrap_err();
        assert!(err.contains("tool_loops"));

        interp.reset_message();
        assert!(interp.check_iteration_limit().is_ok());
        assert_eq!(interp.iteration(), 0);
    }
}
