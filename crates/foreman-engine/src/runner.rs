// Agent tool loop
// Drives one agent message to completion: the agent emits tool-call blocks,
// the interpreter executes them under guardrails, and the results are fed
// back into the next turn until the agent answers without tool calls or a
// ceiling is hit.

use serde_json::Value;
use thiserror::Error;

use foreman_tools::ToolInterpreter;

use crate::agents::{collect_response, Agent, AgentError, ChatMessage, ChatOverrides};

#[derive(Debug, Error)]
pub enum ToolLoopError {
    #[error(transparent)]
    Agent(#[from] AgentError),
    #[error("max tool iterations exceeded: {0}")]
    MaxIterations(String),
}

/// Outcome of a completed tool loop.
#[derive(Debug)]
pub struct ToolLoopResult {
    /// The agent's final answer, tool blocks stripped
    pub response: String,
    /// Tool iterations consumed by this message
    pub iterations: u32,
}

/// Run the multi-step tool loop for a single agent message.
///
/// Per iteration: parse every block; a parse error triggers exactly one
/// repair turn per message; otherwise the batch executes in source order and
/// the formatted results become the next turn's input.
pub async fn run_agent_with_tools(
    agent: &dyn Agent,
    interpreter: &mut ToolInterpreter,
    mut messages: Vec<ChatMessage>,
    context: Value,
) -> Result<ToolLoopResult, ToolLoopError> {
    interpreter.reset_message();

    loop {
        let stream = agent
            .chat(messages.clone(), context.clone(), ChatOverrides::default())
            .await?;
        let response = collect_response(stream).await?;

        let invocations = interpreter.parse(&response);
        if invocations.is_empty() {
            return Ok(ToolLoopResult {
                iterations: interpreter.iteration(),
                response,
            });
        }

        // One repair attempt per message: quote the bad JSON and stop
        // processing this batch.
        if let Some(broken) = interpreter.needs_repair(&invocations) {
            let repair = interpreter.repair_prompt(broken);
            interpreter.mark_repair_attempted();
            messages.push(ChatMessage::system(repair));
            continue;
        }

        if let Err(limit) = interpreter.check_iteration_limit() {
            return Err(ToolLoopError::MaxIterations(limit));
        }
        interpreter.increment_iteration();

        let results = interpreter.execute(invocations).await;
        let formatted = interpreter.format_results(&results);
        messages.push(ChatMessage::user(formatted));
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use foreman_guard::{
        AgentPolicy, ApprovalManager, GuardrailsEnforcer, NullAuditSink, PolicyRegistry,
    };
    use foreman_tools::{Tool, ToolRegistry};
    use foreman_types::ToolResult;
    use futures::stream;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};
    use tempfile::tempdir;

    use crate::agents::ChunkStream;

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn id(&self) -> &str {
            "echo"
        }

        async fn execute(&self, args: Value) -> ToolResult {
            ToolResult::ok(args.get("text").and_then(Value::as_str).unwrap_or(""))
        }
    }

    /// Plays back scripted turns; each chat call pops the next one.
    struct TurnAgent {
        turns: Mutex<VecDeque<String>>,
    }

    #[async_trait]
    impl Agent for TurnAgent {
        fn id(&self) -> &str {
            "turns"
        }

        async fn chat(
            &self,
            _messages: Vec<ChatMessage>,
            _context: Value,
            _overrides: ChatOverrides,
        ) -> Result<ChunkStream, AgentError> {
            let turn = self
                .turns
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| "All done.".to_string());
            Ok(Box::pin(stream::once(async move { Ok(turn) })))
        }
    }

    async fn interpreter(
        workspace: &std::path::Path,
        loops: u32,
    ) -> ToolInterpreter {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool)).await;
        let mut policies = PolicyRegistry::empty(workspace.display().to_string());
        let mut policy = AgentPolicy::default_deny();
        policy.agent_id = "turns".to_string();
        policy.allowed_tools = None;
        policy.budget.max_tool_loops_per_message = loops;
        policies.insert(policy);
        let enforcer = Arc::new(GuardrailsEnforcer::for_agent(
            &policies,
            "turns",
            Some("s1"),
            None,
            Arc::new(ApprovalManager::new()),
            Arc::new(NullAuditSink),
        ));
        ToolInterpreter::new(registry, enforcer)
    }

    fn agent_with(turns: &[&str]) -> TurnAgent {
        TurnAgent {
            turns: Mutex::new(turns.iter().map(|t| t.to_string()).collect()),
        }
    }

    #[tokio::test]
    async fn tool_results_feed_next_turn_until_final_answer() {
        let temp = tempdir().unwrap();
        let agent = agent_with(&[
            r#"Let me check. <tool_call>{"tool": "echo", "args": {"text": "pong"}}</tool_call>"#,
            "The tool said pong. Final answer: pong.",
        ]);
        let mut interp = interpreter(temp.path(), 6).await;

        let result = run_agent_with_tools(
            &agent,
            &mut interp,
            vec![ChatMessage::user("ping?")],
            Value::Null,
        )
        .await
        .unwrap();

        assert_eq!(result.iterations, 1);
        assert!(result.response.contains("Final answer: pong"));
    }

    #[tokio::test]
    async fn broken_json_gets_one_repair_turn() {
        let temp = tempdir().unwrap();
        let agent = agent_with(&[
            r#"<tool_call>{"tool": broken}</tool_call>"#,
            r#"<tool_call>{"tool": "echo", "args": {"text": "fixed"}}</tool_call>"#,
            "Done after repair.",
        ]);
        let mut interp = interpreter(temp.path(), 6).await;

        let result = run_agent_with_tools(
            &agent,
            &mut interp,
            vec![ChatMessage::user("go")],
            Value::Null,
        )
        .await
        .unwrap();

        // The repair turn does not count as a tool iteration.
        assert_eq!(result.iterations, 1);
        assert!(result.response.contains("Done after repair"));
    }

    #[tokio::test]
    async fn iteration_ceiling_surfaces_max_iterations() {
        let temp = tempdir().unwrap();
        // The agent never stops emitting tool calls.
        let agent = TurnAgent {
            turns: Mutex::new(VecDeque::new()),
        };
        {
            let mut turns = agent.turns.lock().unwrap();
            for _ in 0..10 {
                turns.push_back(
                    r#"<tool_call>{"tool": "echo", "args": {"text": "again"}}</tool_call>"#
                        .to_string(),
                );
            }
        }
        let mut interp = interpreter(temp.path(), 2).await;

        let err = run_agent_with_tools(
            &agent,
            &mut interp,
            vec![ChatMessage::user("loop forever")],
            Value::Null,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, ToolLoopError::MaxIterations(_)));
    }
}
