// Recovery policy
// Classifies failures by substring patterns and maps them to a recovery
// action: retry with exponential backoff, a fallback agent, a diagnostic
// pass, or abort.

use std::collections::VecDeque;
use std::sync::RwLock;
use std::time::Duration;

use serde::{Deserialize, Serialize};

// ============================================================================
// Classification
// ============================================================================

/// Failure categories derived from error text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Timeout,
    ApiRateLimit,
    ApiNetwork,
    ToolPermission,
    ToolMissingFile,
    AgentSyntax,
    AgentTestFail,
    Memory,
    Unknown,
}

/// What to do about a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    Retry,
    FallbackAgent,
    Diagnose,
    Abort,
}

/// Ordered substring patterns; the first match decides.
const ERROR_PATTERNS: [(&str, FailureKind, Strategy); 14] = [
    ("timeout", FailureKind::Timeout, Strategy::Retry),
    ("timed out", FailureKind::Timeout, Strategy::Retry),
    ("rate limit", FailureKind::ApiRateLimit, Strategy::Retry),
    ("rate_limit", FailureKind::ApiRateLimit, Strategy::Retry),
    ("429", FailureKind::ApiRateLimit, Strategy::Retry),
    ("connection", FailureKind::ApiNetwork, Strategy::Retry),
    ("network", FailureKind::ApiNetwork, Strategy::Retry),
    ("memory", FailureKind::Memory, Strategy::Retry),
    ("file not found", FailureKind::ToolMissingFile, Strategy::Diagnose),
    ("no such file", FailureKind::ToolMissingFile, Strategy::Diagnose),
    ("permission denied", FailureKind::ToolPermission, Strategy::Diagnose),
    ("syntax error", FailureKind::AgentSyntax, Strategy::FallbackAgent),
    ("compilation error", FailureKind::AgentSyntax, Strategy::FallbackAgent),
    ("test failed", FailureKind::AgentTestFail, Strategy::FallbackAgent),
];

pub fn classify_error(error: &str) -> (FailureKind, Strategy) {
    let lower = error.to_lowercase();
    for (pattern, kind, strategy) in ERROR_PATTERNS {
        if lower.contains(pattern) {
            return (kind, strategy);
        }
    }
    (FailureKind::Unknown, Strategy::Retry)
}

/// Static fallback chains: when an agent fails repeatedly, these agents are
/// tried in order.
pub fn fallback_agents_for(agent_id: &str) -> &'static [&'static str] {
    match agent_id {
        "coder" => &["reviewer", "architect"],
        "tester" => &["coder", "reviewer"],
        "reviewer" => &["architect"],
        "architect" => &["reviewer"],
        "docs" => &["coder", "reviewer"],
        "devops" => &["coder", "architect"],
        _ => &[],
    }
}

// ============================================================================
// Failure context and actions
// ============================================================================

/// Everything known about one failed attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureContext {
    pub task_id: String,
    pub agent_id: String,
    pub task_description: String,
    pub failure_kind: FailureKind,
    pub error_message: String,
    pub attempt: u32,
    pub max_attempts: u32,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub failed_at: chrono::DateTime<chrono::Utc>,
    pub duration_seconds: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_checkpoint: Option<String>,
    pub goals_completed: u32,
    pub goals_total: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_so_far: Option<String>,
}

/// The chosen recovery action.
#[derive(Debug, Clone)]
pub struct RecoveryAction {
    pub strategy: Strategy,
    /// Target agent for the fallback-agent strategy
    pub agent_id: Option<String>,
    /// Rewritten task description for the fallback agent
    pub modified_prompt: Option<String>,
    pub delay: Duration,
    pub diagnostic_prompt: Option<String>,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub enable_fallback: bool,
    pub enable_diagnosis: bool,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
            enable_fallback: true,
            enable_diagnosis: true,
        }
    }
}

/// Exponential backoff: base * 2^(attempt-1), capped.
pub fn backoff_delay(attempt: u32, config: &RecoveryConfig) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    let delay = config.base_delay * 2u32.pow(exponent);
    delay.min(config.max_delay)
}

/// Pick the recovery action for a failure.
pub fn determine_recovery_action(
    failure: &FailureContext,
    config: &RecoveryConfig,
) -> RecoveryAction {
    let (kind, suggested) = classify_error(&failure.error_message);

    if failure.attempt < config.max_retries && suggested == Strategy::Retry {
        let delay = backoff_delay(failure.attempt, config);
        return RecoveryAction {
            strategy: Strategy::Retry,
            agent_id: None,
            modified_prompt: None,
            delay,
            diagnostic_prompt: None,
            reason: format!(
                "Retriable error ({:?}), attempt {}/{}",
                kind,
                failure.attempt + 1,
                config.max_retries
            ),
        };
    }

    if config.enable_fallback && failure.attempt >= config.max_retries {
        let fallbacks = fallback_agents_for(&failure.agent_id);
        if let Some(fallback) = fallbacks.first() {
            return RecoveryAction {
                strategy: Strategy::FallbackAgent,
                agent_id: Some(fallback.to_string()),
                modified_prompt: Some(fallback_prompt(failure, fallback)),
                delay: Duration::ZERO,
                diagnostic_prompt: None,
                reason: format!("Max retries exceeded, falling back to {}", fallback),
            };
        }
    }

    if config.enable_diagnosis && failure.attempt >= config.max_retries {
        return RecoveryAction {
            strategy: Strategy::Diagnose,
            agent_id: Some("reviewer".to_string()),
            modified_prompt: None,
            delay: Duration::ZERO,
            diagnostic_prompt: Some(diagnostic_prompt(failure)),
            reason: "Max retries exceeded, requesting diagnosis".to_string(),
        };
    }

    RecoveryAction {
        strategy: Strategy::Abort,
        agent_id: None,
        modified_prompt: None,
        delay: Duration::ZERO,
        diagnostic_prompt: None,
        reason: format!("No recovery possible after {} attempts", failure.attempt),
    }
}

// ============================================================================
// Prompt templating
// ============================================================================

/// Neutralize text interpolated into prompts so a failing task cannot smuggle
/// fences or markers into the fallback agent's instructions.
pub fn escape_prompt_text(text: &str) -> String {
    text.replace('`', "&#96;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn fallback_prompt(failure: &FailureContext, fallback_agent: &str) -> String {
    let description = escape_prompt_text(&failure.task_description);
    let error = escape_prompt_text(&failure.error_message);
    let partial = failure
        .response_so_far
        .as_deref()
        .map(|r| escape_prompt_text(&r.chars().take(1000).collect::<String>()))
        .unwrap_or_else(|| "No response collected".to_string());

    match fallback_agent {
        "reviewer" => format!(
            "A task failed and needs your analysis to diagnose the issue.\n\n\
             **Original Task:**\n{}\n\n**Error:**\n{}\n\n\
             **Progress Before Failure:**\n\
             - Goals completed: {}/{}\n\
             - Last checkpoint: {}\n\n\
             **Partial Response (if any):**\n{}\n\n\
             Please analyze:\n\
             1. What likely caused this failure?\n\
             2. What needs to be fixed before retrying?\n\
             3. Provide specific recommendations.",
            description,
            error,
            failure.goals_completed,
            failure.goals_total,
            failure.last_checkpoint.as_deref().unwrap_or("none"),
            partial
        ),
        "architect" => format!(
            "A task failed and may need architectural changes.\n\n\
             **Original Task:**\n{}\n\n**Error:**\n{}\n\n\
             **Failure Type:** {:?}\n\n\
             Please provide:\n\
             1. Analysis of why this approach failed\n\
             2. Alternative approach or architecture\n\
             3. Specific steps to implement the alternative",
            description, error, failure.failure_kind
        ),
        _ => format!(
            "A previous attempt at this task failed. Please try a different approach.\n\n\
             **Task:**\n{}\n\n**Previous Error:**\n{}\n\n\
             **What to avoid:**\n\
             The previous approach resulted in: {:?}\n\n\
             Please attempt this task with a different strategy.",
            description, error, failure.failure_kind
        ),
    }
}

fn diagnostic_prompt(failure: &FailureContext) -> String {
    let description = escape_prompt_text(&failure.task_description);
    let error = escape_prompt_text(&failure.error_message);
    let partial = failure
        .response_so_far
        .as_deref()
        .map(|r| escape_prompt_text(&r.chars().take(2000).collect::<String>()))
        .unwrap_or_else(|| "No output captured".to_string());

    format!(
        "**DIAGNOSTIC REQUEST**\n\n\
         A subagent task has failed repeatedly and needs analysis.\n\n\
         **Task:** {}\n\n\
         **Agent:** {}\n\
         **Attempts:** {}\n\
         **Failure Type:** {:?}\n\
         **Error:** {}\n\n\
         **Progress:**\n\
         - Goals completed: {}/{}\n\
         - Last checkpoint: {}\n\
         - Duration: {:.1}s\n\n\
         **Partial Output:**\n{}\n\n\
         **Please analyze:**\n\
         1. Root cause of the failure\n\
         2. Whether this is a transient or permanent issue\n\
         3. Recommended fix or workaround\n\
         4. Whether the task should be retried, modified, or abandoned",
        description,
        failure.agent_id,
        failure.attempt,
        failure.failure_kind,
        error,
        failure.goals_completed,
        failure.goals_total,
        failure.last_checkpoint.as_deref().unwrap_or("none"),
        failure.duration_seconds,
        partial
    )
}

// ============================================================================
// Failure log
// ============================================================================

/// Ring-buffered record of failures for debugging and stats.
pub struct FailureLog {
    failures: RwLock<VecDeque<FailureContext>>,
    max_history: usize,
}

impl Default for FailureLog {
    fn default() -> Self {
        Self::new(100)
    }
}

impl FailureLog {
    pub fn new(max_history: usize) -> Self {
        Self {
            failures: RwLock::new(VecDeque::new()),
            max_history,
        }
    }

    pub fn record(&self, failure: FailureContext) {
        tracing::error!(
            "Agent failure: {} - {:?}; task {}; attempt {}/{}; error: {}",
            failure.agent_id,
            failure.failure_kind,
            failure.task_id,
            failure.attempt,
            failure.max_attempts,
            failure.error_message
        );
        let mut failures = self.failures.write().expect("failure log poisoned");
        while failures.len() >= self.max_history {
            failures.pop_front();
        }
        failures.push_back(failure);
    }

    pub fn recent(&self, agent_id: Option<&str>, limit: usize) -> Vec<FailureContext> {
        let failures = self.failures.read().expect("failure log poisoned");
        failures
            .iter()
            .filter(|f| agent_id.map_or(true, |a| f.agent_id == a))
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn stats(&self) -> serde_json::Value {
        let failures = self.failures.read().expect("failure log poisoned");
        let mut by_agent: std::collections::HashMap<String, usize> = Default::default();
        let mut by_kind: std::collections::HashMap<String, usize> = Default::default();
        for failure in failures.iter() {
            *by_agent.entry(failure.agent_id.clone()).or_default() += 1;
            *by_kind
                .entry(format!("{:?}", failure.failure_kind).to_lowercase())
                .or_default() += 1;
        }
        serde_json::json!({
            "total": failures.len(),
            "by_agent": by_agent,
            "by_kind": by_kind,
        })
    }
}

// ============================================================================
// Tests
// ============================================================================
