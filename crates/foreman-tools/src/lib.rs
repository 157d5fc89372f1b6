// Foreman tools
// String-id tool registry plus the interpreter that parses tool-call blocks
// out of agent output and executes them under guardrails.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use foreman_types::ToolResult;

pub mod interpreter;

pub use interpreter::{
    create_repair_prompt, has_tool_calls, parse_tool_blocks, strip_tool_blocks, InterpreterConfig,
    ToolExecutionResult, ToolInterpreter,
};

/// A tool callable by agents. Registered by string id; the interpreter
/// enforces policy around it.
#[async_trait]
pub trait Tool: Send + Sync {
    fn id(&self) -> &str;
    fn description(&self) -> &str {
        ""
    }
    async fn execute(&self, args: Value) -> ToolResult;
}

/// Registry mapping tool ids to implementations.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: Arc<RwLock<HashMap<String, Arc<dyn Tool>>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, tool: Arc<dyn Tool>) {
        self.tools
            .write()
            .await
            .insert(tool.id().to_string(), tool);
    }

    pub async fn get(&self, id: &str) -> Option<Arc<dyn Tool>> {
        self.tools.read().await.get(id).cloned()
    }

    pub async fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.tools.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }
}
