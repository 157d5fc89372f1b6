// Budget tracking
// Hard ceilings per session. check_* fails before incrementing; record_*
// commits after execution. The interpreter must call check then record.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Which ceiling was hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetKind {
    ToolLoops,
    ToolCallsPerMessage,
    ToolCallsPerSession,
    ShellTimeSeconds,
    OutputBytesTotal,
}

impl BudgetKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ToolLoops => "tool_loops",
            Self::ToolCallsPerMessage => "tool_calls_per_message",
            Self::ToolCallsPerSession => "tool_calls_per_session",
            Self::ShellTimeSeconds => "shell_time_seconds",
            Self::OutputBytesTotal => "output_bytes_total",
        }
    }
}

/// Typed budget-exceeded error.
#[derive(Debug, Clone, Error)]
#[error("Budget exceeded ({}): {current:.0}/{limit:.0}", .kind.as_str())]
pub struct BudgetExceeded {
    pub kind: BudgetKind,
    pub current: f64,
    pub limit: f64,
}

/// Ceilings applied to one session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetPolicy {
    pub max_tool_loops_per_message: u32,
    pub max_tool_calls_per_message: u32,
    pub max_tool_calls_per_session: u32,
    pub max_shell_time_seconds: f64,
    pub max_output_bytes: u64,
}

impl Default for BudgetPolicy {
    fn default() -> Self {
        Self {
            max_tool_loops_per_message: 6,
            max_tool_calls_per_message: 30,
            max_tool_calls_per_session: 500,
            max_shell_time_seconds: 300.0,
            max_output_bytes: 5 * 1024 * 1024,
        }
    }
}

/// Per-session counters. Per-message counters reset at the start of each
/// agent turn; per-session counters live as long as the session.
#[derive(Debug, Clone)]
pub struct BudgetTracker {
    policy: BudgetPolicy,
    pub session_id: Option<String>,
    pub agent_id: Option<String>,
    tool_loops_this_message: u32,
    tool_calls_this_message: u32,
    tool_calls_this_session: u32,
    shell_seconds: f64,
    output_bytes: u64,
}

impl BudgetTracker {
    pub fn new(policy: BudgetPolicy, session_id: Option<String>, agent_id: Option<String>) -> Self {
        Self {
            policy,
            session_id,
            agent_id,
            tool_loops_this_message: 0,
            tool_calls_this_message: 0,
            tool_calls_this_session: 0,
            shell_seconds: 0.0,
            output_bytes: 0,
        }
    }

    pub fn policy(&self) -> &BudgetPolicy {
        &self.policy
    }

    pub fn check_tool_loop(&self) -> Result<(), BudgetExceeded> {
        if self.tool_loops_this_message >= self.policy.max_tool_loops_per_message {
            return Err(BudgetExceeded {
                kind: BudgetKind::ToolLoops,
                current: self.tool_loops_this_message as f64,
                limit: self.policy.max_tool_loops_per_message as f64,
            });
        }
        Ok(())
    }

    pub fn record_tool_loop(&mut self) {
        self.tool_loops_this_message += 1;
    }

    pub fn check_tool_call(&self) -> Result<(), BudgetExceeded> {
        if self.tool_calls_this_message >= self.policy.max_tool_calls_per_message {
            return Err(BudgetExceeded {
                kind: BudgetKind::ToolCallsPerMessage,
                current: self.tool_calls_this_message as f64,
                limit: self.policy.max_tool_calls_per_message as f64,
            });
        }
        if self.tool_calls_this_session >= self.policy.max_tool_calls_per_session {
            return Err(BudgetExceeded {
                kind: BudgetKind::ToolCallsPerSession,
                current: self.tool_calls_this_session as f64,
                limit: self.policy.max_tool_calls_per_session as f64,
            });
        }
        if self.output_bytes >= self.policy.max_output_bytes {
            return Err(BudgetExceeded {
                kind: BudgetKind::OutputBytesTotal,
                current: self.output_bytes as f64,
                limit: self.policy.max_output_bytes as f64,
            });
        }
        Ok(())
    }

    pub fn record_tool_call(&mut self, output_size: usize) {
        self.tool_calls_this_message += 1;
        self.tool_calls_this_session += 1;
        self.output_bytes = self.output_bytes.saturating_add(output_size as u64);
    }

    pub fn check_shell_call(&self) -> Result<(), BudgetExceeded> {
        if self.shell_seconds >= self.policy.max_shell_time_seconds {
            return Err(BudgetExceeded {
                kind: BudgetKind::ShellTimeSeconds,
                current: self.shell_seconds,
                limit: self.policy.max_shell_time_seconds,
            });
        }
        Ok(())
    }

    pub fn record_shell_time(&mut self, seconds: f64) {
        self.shell_seconds += seconds.max(0.0);
    }

    pub fn reset_message_counters(&mut self) {
        self.tool_loops_this_message = 0;
        self.tool_calls_this_message = 0;
    }

    pub fn is_exhausted(&self) -> bool {
        self.check_tool_loop().is_err()
            || self.check_tool_call().is_err()
            || self.check_shell_call().is_err()
    }

    pub fn usage_summary(&self) -> serde_json::Value {
        serde_json::json!({
            "tool_loops_this_message": self.tool_loops_this_message,
            "tool_calls_this_message": self.tool_calls_this_message,
            "tool_calls_this_session": self.tool_calls_this_session,
            "shell_seconds": self.shell_seconds,
            "output_bytes": self.output_bytes,
            "limits": self.policy,
        })
    }

    pub fn remaining(&self) -> serde_json::Value {
        serde_json::json!({
            "tool_loops": self.policy.max_tool_loops_per_message
                .saturating_sub(self.tool_loops_this_message),
            "tool_calls_this_message": self.policy.max_tool_calls_per_message
                .saturating_sub(self.tool_calls_this_message),
            "tool_calls_this_session": self.policy.max_tool_calls_per_session
                .saturating_sub(self.tool_calls_this_session),
            "shell_seconds": (self.policy.max_shell_time_seconds - self.shell_seconds).max(0.0),
            "output_bytes": self.policy.max_output_bytes.saturating_sub(self.output_bytes),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_tracker() -> BudgetTracker {
        BudgetTracker::new(
            BudgetPolicy {
                max_tool_loops_per_message: 2,
                max_tool_calls_per_message: 3,
                max_tool_calls_per_session: 5,
                max_shell_time_seconds: 10.0,
                max_output_bytes: 100,
            },
            Some("s1".to_string()),
            Some("coder".to_string()),
        )
    }

    #[test]
    fn tool_call_ceiling_per_message() {
        let mut tracker = small_tracker();
        for _ in 0..3 {
            tracker.check_tool_call().unwrap();
            tracker.record_tool_call(0);
        }
        let err = tracker.check_tool_call().unwrap_err();
        assert_eq!(err.kind, BudgetKind::ToolCallsPerMessage);
    }

    #[test]
    fn message_reset_keeps_session_counters() {
        let mut tracker = small_tracker();
        for _ in 0..3 {
            tracker.record_tool_call(0);
        }
        tracker.reset_message_counters();
        // Per-message counter cleared, per-session counter persists.
        tracker.check_tool_call().unwrap();
        for _ in 0..2 {
            tracker.record_tool_call(0);
        }
        // 5 calls this session now: session ceiling reached.
        let err = tracker.check_tool_call().unwrap_err();
        assert_eq!(err.kind, BudgetKind::ToolCallsPerSession);
    }

    #[test]
    fn tool_loop_ceiling() {
        let mut tracker = small_tracker();
        tracker.record_tool_loop();
        tracker.record_tool_loop();
        let err = tracker.check_tool_loop().unwrap_err();
        assert_eq!(err.kind, BudgetKind::ToolLoops);
    }

    #[test]
    fn shell_time_accumulates() {
        let mut tracker = small_tracker();
        tracker.record_shell_time(6.0);
        tracker.check_shell_call().unwrap();
        tracker.record_shell_time(4.5);
        let err = tracker.check_shell_call().unwrap_err();
        assert_eq!(err.kind, BudgetKind::ShellTimeSeconds);
    }

    #[test]
    fn output_bytes_ceiling() {
        let mut tracker = small_tracker();
        tracker.record_tool_call(100);
        let err = tracker.check_tool_call().unwrap_err();
        assert_eq!(err.kind, BudgetKind::OutputBytesTotal);
    }

    #[test]
    fn error_message_names_the_kind() {
        let mut tracker = small_tracker();
        tracker.record_tool_loop();
        tracker.record_tool_loop();
        let err = tracker.check_tool_loop().unwrap_err();
        assert!(err.to_string().contains("tool_loops"));
    }

    #[test]
    fn defaults_match_documented_ceilings() {
        let policy = BudgetPolicy::default();
        assert_eq!(policy.max_tool_loops_per_message, 6);
        assert_eq!(policy.max_tool_calls_per_message, 30);
        assert_eq!(policy.max_tool_calls_per_session, 500);
        assert_eq!(policy.max_shell_time_seconds, 300.0);
        assert_eq!(policy.max_output_bytes, 5 * 1024 * 1024);
    }
}
