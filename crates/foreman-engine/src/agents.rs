// Agent contract
// Agents expose a streaming chat call and are looked up by string id.
// Chunks starting with the thinking marker are suppressed; inline markers
// ([GOAL:n], [CHECKPOINT:...], ...) are parsed for progress tracking.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::RwLock;

use foreman_types::MessageRole;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("agent not found: {0}")]
    NotFound(String),
    #[error("agent error: {0}")]
    Chat(String),
}

/// One message in an agent conversation.
#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }
}

/// Per-call overrides passed through to the model layer.
#[derive(Debug, Clone, Default)]
pub struct ChatOverrides {
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<String, AgentError>> + Send>>;

/// An agent: a specialized role (planner, implementer, reviewer, tester,
/// deployer, documenter) behind a streaming chat interface.
#[async_trait]
pub trait Agent: Send + Sync {
    fn id(&self) -> &str;

    async fn chat(
        &self,
        messages: Vec<ChatMessage>,
        context: Value,
        overrides: ChatOverrides,
    ) -> Result<ChunkStream, AgentError>;
}

/// Registry mapping agent ids to implementations.
#[derive(Clone, Default)]
pub struct AgentRegistry {
    agents: Arc<RwLock<HashMap<String, Arc<dyn Agent>>>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, agent: Arc<dyn Agent>) {
        self.agents
            .write()
            .await
            .insert(agent.id().to_string(), agent);
    }

    pub async fn get(&self, id: &str) -> Option<Arc<dyn Agent>> {
        self.agents.read().await.get(id).cloned()
    }
}

/// Chunks beginning with this marker carry internal reasoning and are
/// dropped from the collected response.
pub const THINKING_MARKER: &str = "__THINKING";

/// Consume a chunk stream into the full response text, suppressing thinking
/// chunks.
pub async fn collect_response(mut stream: ChunkStream) -> Result<String, AgentError> {
    let mut response = String::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        if chunk.starts_with(THINKING_MARKER) {
            continue;
        }
        response.push_str(&chunk);
    }
    Ok(response)
}

// ============================================================================
// Inline markers
// ============================================================================

/// Inline progress markers an agent may emit in its response.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentMarker {
    Goal { n: u32, text: String },
    GoalDone { n: u32 },
    GoalFailed { n: u32, error: String },
    Checkpoint { name: String, text: String },
    Request { agent: String, text: String },
    ReviewRequest { text: String },
    Spawn { agent: String, task: String },
    Workflow { name: String, task: String },
}

static MARKER_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r"(?m)^\[GOAL:(\d+)\]\s*(.*)$").expect("goal pattern"),
        Regex::new(r"(?m)^\[GOAL_DONE:(\d+)\]\s*$").expect("goal done pattern"),
        Regex::new(r"(?m)^\[GOAL_FAILED:(\d+)\]\s*(.*)$").expect("goal failed pattern"),
        Regex::new(r"(?m)^\[CHECKPOINT:([^\]]+)\]\s*(.*)$").expect("checkpoint pattern"),
        Regex::new(r"(?m)^\[REQUEST:([^\]]+)\]\s*(.*)$").expect("request pattern"),
        Regex::new(r"(?m)^\[REVIEW_REQUEST\]\s*(.*)$").expect("review request pattern"),
        Regex::new(r"(?m)^\[SPAWN:([^\]]+)\]\s*(.*)$").expect("spawn pattern"),
        Regex::new(r"(?m)^\[WORKFLOW:([^\]]+)\]\s*(.*)$").expect("workflow pattern"),
    ]
});

/// Scan accumulated response text for markers, in source order per line.
/// Marker detection runs on full lines only, never mid-marker.
pub fn parse_markers(text: &str) -> Vec<AgentMarker> {
    let mut markers = Vec::new();
    for line in text.lines() {
        if !line.starts_with('[') {
            continue;
        }
        let patterns = &*MARKER_PATTERNS;
        if let Some(c) = patterns[0].captures(line) {
            if let Ok(n) = c[1].parse() {
                markers.push(AgentMarker::Goal {
                    n,
                    text: c[2].trim().to_string(),
                });
            }
        } else if let Some(c) = patterns[1].captures(line) {
            if let Ok(n) = c[1].parse() {
                markers.push(AgentMarker::GoalDone { n });
            }
        } else if let Some(c) = patterns[2].captures(line) {
            if let Ok(n) = c[1].parse() {
                markers.push(AgentMarker::GoalFailed {
                    n,
                    error: c[2].trim().to_string(),
                });
            }
        } else if let Some(c) = patterns[3].captures(line) {
            markers.push(AgentMarker::Checkpoint {
                name: c[1].to_string(),
                text: c[2].trim().to_string(),
            });
        } else if let Some(c) = patterns[4].captures(line) {
            markers.push(AgentMarker::Request {
                agent: c[1].to_string(),
                text: c[2].trim().to_string(),
            });
        } else if let Some(c) = patterns[5].captures(line) {
            markers.push(AgentMarker::ReviewRequest {
                text: c[1].trim().to_string(),
            });
        } else if let Some(c) = patterns[6].captures(line) {
            markers.push(AgentMarker::Spawn {
                agent: c[1].to_string(),
                task: c[2].trim().to_string(),
            });
        } else if let Some(c) = patterns[7].captures(line) {
            markers.push(AgentMarker::Workflow {
                name: c[1].to_string(),
                task: c[2].trim().to_string(),
            });
        }
    }
    markers
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    struct ScriptedAgent {
        chunks: Vec<String>,
    }

    #[async_trait]
    impl Agent for ScriptedAgent {
        fn id(&self) -> &str {
            "scripted"
        }

        async fn chat(
            &self,
            _messages: Vec<ChatMessage>,
            _context: Value,
            _overrides: ChatOverrides,
        ) -> Result<ChunkStream, AgentError> {
            let chunks = self.chunks.clone();
            Ok(Box::pin(stream::iter(chunks.into_iter().map(Ok))))
        }
    }

    #[tokio::test]
    async fn collect_suppresses_thinking_chunks() {
        let agent = ScriptedAgent {
            chunks: vec![
                "__THINKING: let me reason".to_string(),
                "Hello ".to_string(),
                "__THINKING more".to_string(),
                "world".to_string(),
            ],
        };
        let stream = agent
            .chat(vec![ChatMessage::user("hi")], Value::Null, ChatOverrides::default())
            .await
            .unwrap();
        let response = collect_response(stream).await.unwrap();
        assert_eq!(response, "Hello world");
    }

    #[tokio::test]
    async fn registry_lookup() {
        let registry = AgentRegistry::new();
        registry
            .register(Arc::new(ScriptedAgent { chunks: vec![] }))
            .await;
        assert!(registry.get("scripted").await.is_some());
        assert!(registry.get("missing").await.is_none());
    }

    #[test]
    fn parses_goal_lifecycle_markers() {
        let text = "[GOAL:1] Write the parser\nsome prose\n[GOAL_DONE:1]\n[GOAL_FAILED:2] ran out of ideas";
        let markers = parse_markers(text);
        assert_eq!(markers.len(), 3);
        assert_eq!(
            markers[0],
            AgentMarker::Goal {
                n: 1,
                text: "Write the parser".to_string()
            }
        );
        assert_eq!(markers[1], AgentMarker::GoalDone { n: 1 });
        assert_eq!(
            markers[2],
            AgentMarker::GoalFailed {
                n: 2,
                error: "ran out of ideas".to_string()
            }
        );
    }

    #[test]
    fn parses_checkpoint_and_handoff_markers() {
        let text = "[CHECKPOINT:schema] tables created\n[REQUEST:reviewer] check my diff\n[REVIEW_REQUEST] please look\n[SPAWN:tester] run the suite\n[WORKFLOW:deploy] ship it";
        let markers = parse_markers(text);
        assert_eq!(markers.len(), 5);
        assert!(matches!(markers[0], AgentMarker::Checkpoint { .. }));
        assert!(matches!(markers[1], AgentMarker::Request { .. }));
        assert!(matches!(markers[2], AgentMarker::ReviewRequest { .. }));
        assert!(matches!(markers[3], AgentMarker::Spawn { .. }));
        assert!(matches!(markers[4], AgentMarker::Workflow { .. }));
    }

    #[test]
    fn plain_text_has_no_markers() {
        assert!(parse_markers("just a normal response\nwith [brackets] mid-line").is_empty());
    }
}
