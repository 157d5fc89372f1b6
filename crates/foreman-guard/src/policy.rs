// Agent policies
// Maps an agent id to its allowed tools, filesystem jail, budget, and
// diff-approval rules. Unknown agents get the default-deny policy.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::budget::BudgetPolicy;

// ============================================================================
// Filesystem policy
// ============================================================================

/// Coarse filesystem permissions for an agent. The enforcer still runs the
/// full path validator on every mutation; this is the policy layer above it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilesystemPolicy {
    pub read_paths: Vec<String>,
    pub write_paths: Vec<String>,
    pub write_allowed: bool,
    pub workspace_only: bool,
    pub workspace_path: String,
}

impl Default for FilesystemPolicy {
    fn default() -> Self {
        // Read-only everywhere, no writes.
        Self {
            read_paths: vec!["*".to_string()],
            write_paths: Vec::new(),
            write_allowed: false,
            workspace_only: true,
            workspace_path: String::new(),
        }
    }
}

impl FilesystemPolicy {
    pub fn workspace(workspace_path: impl Into<String>) -> Self {
        let workspace_path = workspace_path.into();
        Self {
            read_paths: vec!["*".to_string()],
            write_paths: vec![workspace_path.clone()],
            write_allowed: true,
            workspace_only: true,
            workspace_path,
        }
    }
}

// ============================================================================
// Diff-approval policy
// ============================================================================

/// When a human must approve the proposed change before it executes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiffApprovalPolicy {
    pub enabled: bool,
    pub require_for_writes: bool,
    pub require_for_deletes: bool,
    pub require_for_shell: bool,
    /// Wildcard patterns of paths requiring approval; empty means all paths
    pub protected_patterns: Vec<String>,
    pub approval_timeout_secs: u64,
}

impl Default for DiffApprovalPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            require_for_writes: true,
            require_for_deletes: true,
            require_for_shell: true,
            protected_patterns: Vec::new(),
            approval_timeout_secs: 300,
        }
    }
}

impl DiffApprovalPolicy {
    pub fn requires_approval(&self, action: &str, path: &str) -> bool {
        if !self.enabled {
            return false;
        }
        match action {
            "write" => {
                if !self.require_for_writes {
                    return false;
                }
                if self.protected_patterns.is_empty() {
                    return true;
                }
                self.protected_patterns
                    .iter()
                    .any(|p| wildcard_matches(p, path))
            }
            "delete" => self.require_for_deletes,
            "shell" => self.require_for_shell,
            _ => false,
        }
    }
}

/// Minimal `*` wildcard match, anchored at both ends.
pub fn wildcard_matches(pattern: &str, value: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    let mut parts = pattern.split('*').peekable();
    let mut remainder = value;
    let mut first = true;
    while let Some(part) = parts.next() {
        if part.is_empty() {
            first = false;
            continue;
        }
        if first {
            if !remainder.starts_with(part) {
                return false;
            }
            remainder = &remainder[part.len()..];
        } else if parts.peek().is_none() && !pattern.ends_with('*') {
            return remainder.ends_with(part);
        } else {
            match remainder.find(part) {
                Some(idx) => remainder = &remainder[idx + part.len()..],
                None => return false,
            }
        }
        first = false;
    }
    true
}

// ============================================================================
// Agent policy
// ============================================================================

/// The complete policy bundle for one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentPolicy {
    pub agent_id: String,
    pub description: String,
    /// None means every registered tool is allowed
    pub allowed_tools: Option<Vec<String>>,
    pub filesystem: FilesystemPolicy,
    pub budget: BudgetPolicy,
    pub diff_approval: DiffApprovalPolicy,
}

impl AgentPolicy {
    pub fn is_tool_allowed(&self, tool_id: &str) -> bool {
        match &self.allowed_tools {
            None => true,
            Some(tools) => tools.iter().any(|t| t == tool_id),
        }
    }

    /// Default-deny policy for unknown agents: read-only filesystem, no
    /// shell, no network.
    pub fn default_deny() -> Self {
        Self {
            agent_id: "__default__".to_string(),
            description: "Default restrictive policy for unspecified agents".to_string(),
            allowed_tools: Some(vec!["filesystem".to_string()]),
            filesystem: FilesystemPolicy::default(),
            budget: BudgetPolicy::default(),
            diff_approval: DiffApprovalPolicy::default(),
        }
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Resolves agent ids to policies; unknown ids fall back to default-deny.
#[derive(Debug, Clone)]
pub struct PolicyRegistry {
    policies: HashMap<String, AgentPolicy>,
    workspace_path: String,
}

impl PolicyRegistry {
    /// Builtin policies for the standard agent roster, all jailed to the
    /// given workspace.
    pub fn builtin(workspace_path: impl Into<String>) -> Self {
        let workspace_path = workspace_path.into();
        let mut policies = HashMap::new();

        let full_tools = |tools: &[&str]| Some(tools.iter().map(|t| t.to_string()).collect());

        policies.insert(
            "coder".to_string(),
            AgentPolicy {
                agent_id: "coder".to_string(),
                description: "Implements code changes in the workspace".to_string(),
                allowed_tools: full_tools(&["filesystem", "shell", "web_search"]),
                filesystem: FilesystemPolicy::workspace(workspace_path.clone()),
                budget: BudgetPolicy::default(),
                diff_approval: DiffApprovalPolicy::default(),
            },
        );
        policies.insert(
            "tester".to_string(),
            AgentPolicy {
                agent_id: "tester".to_string(),
                description: "Runs and reports on tests".to_string(),
                allowed_tools: full_tools(&["filesystem", "shell"]),
                filesystem: FilesystemPolicy::workspace(workspace_path.clone()),
                budget: BudgetPolicy::default(),
                diff_approval: DiffApprovalPolicy::default(),
            },
        );
        policies.insert(
            "reviewer".to_string(),
            AgentPolicy {
                agent_id: "reviewer".to_string(),
                description: "Reviews changes; read-only".to_string(),
                allowed_tools: full_tools(&["filesystem"]),
                filesystem: FilesystemPolicy {
                    workspace_path: workspace_path.clone(),
                    ..FilesystemPolicy::default()
                },
                budget: BudgetPolicy::default(),
                diff_approval: DiffApprovalPolicy::default(),
            },
        );
        policies.insert(
            "architect".to_string(),
            AgentPolicy {
                agent_id: "architect".to_string(),
                description: "Plans work; read-only".to_string(),
                allowed_tools: full_tools(&["filesystem", "web_search"]),
                filesystem: FilesystemPolicy {
                    workspace_path: workspace_path.clone(),
                    ..FilesystemPolicy::default()
                },
                budget: BudgetPolicy::default(),
                diff_approval: DiffApprovalPolicy::default(),
            },
        );
        policies.insert(
            "docs".to_string(),
            AgentPolicy {
                agent_id: "docs".to_string(),
                description: "Writes documentation".to_string(),
                allowed_tools: full_tools(&["filesystem"]),
                filesystem: FilesystemPolicy::workspace(workspace_path.clone()),
                budget: BudgetPolicy::default(),
                diff_approval: DiffApprovalPolicy::default(),
            },
        );
        policies.insert(
            "devops".to_string(),
            AgentPolicy {
                agent_id: "devops".to_string(),
                description: "Build, deploy, and infrastructure tasks".to_string(),
                allowed_tools: full_tools(&["filesystem", "shell"]),
                filesystem: FilesystemPolicy::workspace(workspace_path.clone()),
                budget: BudgetPolicy::default(),
                diff_approval: DiffApprovalPolicy::default(),
            },
        );

        Self {
            policies,
            workspace_path,
        }
    }

    pub fn empty(workspace_path: impl Into<String>) -> Self {
        Self {
            policies: HashMap::new(),
            workspace_path: workspace_path.into(),
        }
    }

    pub fn insert(&mut self, policy: AgentPolicy) {
        self.policies.insert(policy.agent_id.clone(), policy);
    }

    pub fn workspace_path(&self) -> &str {
        &self.workspace_path
    }

    /// Resolve a policy; unknown agents receive default-deny.
    pub fn resolve(&self, agent_id: &str) -> AgentPolicy {
        self.policies
            .get(agent_id)
            .cloned()
            .unwrap_or_else(AgentPolicy::default_deny)
    }
}
