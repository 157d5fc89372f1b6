// Git subsystem
// Thin async wrappers over the git CLI. Failures are non-fatal at the
// orchestrator level: the task records the commit outcome either way.

use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;

pub struct GitOps {
    workspace: PathBuf,
}

impl GitOps {
    pub fn new(workspace: impl Into<PathBuf>) -> Self {
        Self {
            workspace: workspace.into(),
        }
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    async fn git(&self, args: &[&str]) -> Option<std::process::Output> {
        match tokio::process::Command::new("git")
            .args(args)
            .current_dir(&self.workspace)
            .output()
            .await
        {
            Ok(output) => Some(output),
            Err(e) => {
                tracing::warn!("git {:?} failed to spawn: {}", args, e);
                None
            }
        }
    }

    pub async fn is_repo(&self) -> bool {
        self.git(&["rev-parse", "--is-inside-work-tree"])
            .await
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    pub async fn init(&self) -> bool {
        self.git(&["init"])
            .await
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    pub async fn create_branch(&self, name: &str) -> bool {
        self.git(&["checkout", "-b", name])
            .await
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    pub async fn has_changes(&self) -> bool {
        self.git(&["status", "--porcelain"])
            .await
            .map(|o| o.status.success() && !o.stdout.is_empty())
            .unwrap_or(false)
    }

    pub async fn add_all(&self) -> bool {
        self.git(&["add", "-A"])
            .await
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    pub async fn commit(&self, message: &str) -> bool {
        // Identity flags keep commits working in bare CI environments.
        self.git(&[
            "-c",
            "user.email=foreman@localhost",
            "-c",
            "user.name=Foreman",
            "commit",
            "-m",
            message,
        ])
        .await
        .map(|o| o.status.success())
        .unwrap_or(false)
    }

    pub async fn last_commit(&self) -> Option<String> {
        let output = self.git(&["rev-parse", "--short", "HEAD"]).await?;
        if !output.status.success() {
            return None;
        }
        let sha = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if sha.is_empty() {
            None
        } else {
            Some(sha)
        }
    }

    pub async fn has_remote(&self) -> bool {
        self.git(&["remote"])
            .await
            .map(|o| o.status.success() && !String::from_utf8_lossy(&o.stdout).trim().is_empty())
            .unwrap_or(false)
    }

    pub async fn push(&self, branch: &str, set_upstream: bool) -> bool {
        let args: Vec<&str> = if set_upstream {
            vec!["push", "-u", "origin", branch]
        } else {
            vec!["push", "origin", branch]
        };
        self.git(&args)
            .await
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    /// Open a pull request through the forge CLI when present. Returns the
    /// PR url on success.
    pub async fn create_pull_request(
        &self,
        title: &str,
        body: &str,
        base: &str,
        head: &str,
    ) -> Option<String> {
        let output = tokio::process::Command::new("gh")
            .args([
                "pr", "create", "--title", title, "--body", body, "--base", base, "--head", head,
            ])
            .current_dir(&self.workspace)
            .output()
            .await
            .ok()?;
        if !output.status.success() {
            tracing::warn!(
                "gh pr create failed: {}",
                String::from_utf8_lossy(&output.stderr)
            );
            return None;
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        stdout
            .lines()
            .rev()
            .find(|line| line.starts_with("http"))
            .map(str::to_string)
    }
}

static BRANCH_UNSAFE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^a-zA-Z0-9-]").expect("branch pattern"));
static DASH_RUNS: Lazy<Regex> = Lazy::new(|| Regex::new(r"-+").expect("dash pattern"));

/// Sanitize a run name for use in a branch: `auto/<run-id>-<slug>`.
pub fn sanitize_branch_name(name: &str) -> String {
    let lowered = name.to_lowercase();
    let replaced = BRANCH_UNSAFE.replace_all(&lowered, "-");
    let collapsed = DASH_RUNS.replace_all(&replaced, "-");
    collapsed.trim_matches('-').chars().take(30).collect()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn branch_names_are_sanitized() {
        assert_eq!(sanitize_branch_name("Build a Todo API!"), "build-a-todo-api");
        assert_eq!(sanitize_branch_name("weird///name"), "weird-name");
        assert_eq!(sanitize_branch_name("---"), "");
        let long = sanitize_branch_name(&"x".repeat(100));
        assert_eq!(long.len(), 30);
    }

    #[tokio::test]
    async fn init_commit_and_last_sha_round_trip() {
        let temp = tempdir().unwrap();
        let git = GitOps::new(temp.path());

        assert!(!git.is_repo().await);
        assert!(git.init().await);
        assert!(git.is_repo().await);

        std::fs::write(temp.path().join("file.txt"), "content").unwrap();
        assert!(git.has_changes().await);
        assert!(git.add_all().await);
        assert!(git.commit("feat: first file").await);
        assert!(!git.has_changes().await);
        assert!(git.last_commit().await.is_some());
        assert!(!git.has_remote().await);
    }
}
