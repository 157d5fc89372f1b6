// Quality gates
// Post-attempt checks in declared order; the first failure stops evaluation
// and produces the retry feedback for the next attempt.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::json;

use foreman_types::{GateKind, Task};

use crate::agents::{collect_response, AgentRegistry, ChatMessage, ChatOverrides};

/// Gate behavior knobs. Ambiguous tester output counts as a pass, matching
/// the historical behavior; flip `ambiguous_is_pass` to tighten it.
#[derive(Debug, Clone)]
pub struct GateConfig {
    pub ambiguous_is_pass: bool,
    pub lint_timeout: Duration,
    pub type_check_timeout: Duration,
    pub build_timeout: Duration,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            ambiguous_is_pass: true,
            lint_timeout: Duration::from_secs(60),
            type_check_timeout: Duration::from_secs(120),
            build_timeout: Duration::from_secs(300),
        }
    }
}

/// Runs quality gates for tasks in one workspace.
pub struct GateRunner {
    agents: AgentRegistry,
    workspace: PathBuf,
    config: GateConfig,
}

impl GateRunner {
    pub fn new(agents: AgentRegistry, workspace: PathBuf, config: GateConfig) -> Self {
        Self {
            agents,
            workspace,
            config,
        }
    }

    /// Check one gate. Returns (passed, error_message).
    pub async fn check(
        &self,
        task: &Task,
        gate: GateKind,
        agent_response: &str,
    ) -> (bool, Option<String>) {
        match gate {
            GateKind::TestsPass => self.run_tests(task).await,
            GateKind::ReviewApproved => self.run_review(task, agent_response).await,
            GateKind::LintClean => self.run_lint(task).await,
            GateKind::TypeCheck => self.run_type_check(task).await,
            GateKind::BuildSuccess => self.run_build().await,
        }
    }

    async fn run_tests(&self, task: &Task) -> (bool, Option<String>) {
        let Some(tester) = self.agents.get("tester").await else {
            // No tester agent registered: soft pass.
            return (true, None);
        };

        let files = if task.target_files.is_empty() {
            "All relevant tests".to_string()
        } else {
            task.target_files.join(", ")
        };
        let prompt = format!(
            "Run tests for the following files/functionality:\n{}\n\n\
             Workspace: {}\n\nReport any test failures with details.\n",
            files,
            self.workspace.display()
        );

        let response = match tester
            .chat(
                vec![ChatMessage::user(prompt)],
                json!({ "workspace": self.workspace.display().to_string() }),
                ChatOverrides::default(),
            )
            .await
        {
            Ok(stream) => match collect_response(stream).await {
                Ok(response) => response,
                Err(e) => return (false, Some(format!("Tester agent error: {}", e))),
            },
            Err(e) => return (false, Some(format!("Tester agent error: {}", e))),
        };

        let lower = response.to_lowercase();
        let passed_phrases = ["all tests pass", "tests passed", "0 failed", "success"];
        let failed_phrases = ["failed", "error", "failure"];

        if passed_phrases.iter().any(|p| lower.contains(p)) {
            (true, None)
        } else if failed_phrases.iter().any(|p| lower.contains(p)) {
            (false, Some(truncate(&response, 4000)))
        } else {
            // Neither a pass nor an explicit fail phrase.
            (self.config.ambiguous_is_pass, None)
        }
    }

    async fn run_review(&self, task: &Task, agent_response: &str) -> (bool, Option<String>) {
        let Some(reviewer) = self.agents.get("reviewer").await else {
            return (true, None);
        };

        let files = if task.target_files.is_empty() {
            "See implementation".to_string()
        } else {
            task.target_files.join(", ")
        };
        let prompt = format!(
            "Review this code implementation:\n\n## Task\n{}\n\n## Implementation\n{}\n\n\
             ## Files\n{}\n\n\
             Provide a verdict: APPROVED or CHANGES_REQUESTED with specific feedback.\n",
            task.title,
            truncate(agent_response, 5000),
            files
        );

        let response = match reviewer
            .chat(
                vec![ChatMessage::user(prompt)],
                json!({ "workspace": self.workspace.display().to_string() }),
                ChatOverrides::default(),
            )
            .await
        {
            Ok(stream) => match collect_response(stream).await {
                Ok(response) => response,
                Err(e) => return (false, Some(format!("Reviewer agent error: {}", e))),
            },
            Err(e) => return (false, Some(format!("Reviewer agent error: {}", e))),
        };

        let lower = response.to_lowercase();
        if lower.contains("approved") && !lower.contains("changes_requested") {
            (true, None)
        } else {
            (false, Some(truncate(&response, 1000)))
        }
    }

    async fn run_lint(&self, task: &Task) -> (bool, Option<String>) {
        let py_files: Vec<&str> = task
            .target_files
            .iter()
            .map(String::as_str)
            .filter(|f| f.ends_with(".py"))
            .collect();
        let js_files: Vec<&str> = task
            .target_files
            .iter()
            .map(String::as_str)
            .filter(|f| {
                f.ends_with(".js") || f.ends_with(".ts") || f.ends_with(".tsx") || f.ends_with(".jsx")
            })
            .collect();

        if py_files.is_empty() && js_files.is_empty() {
            return (true, None);
        }

        let mut errors = Vec::new();
        if !py_files.is_empty() {
            let mut args = vec!["check"];
            args.extend(py_files.iter().copied());
            if let Some(output) =
                run_command("ruff", &args, &self.workspace, self.config.lint_timeout).await
            {
                if !output.success {
                    errors.push(output.text);
                }
            }
        }
        if !js_files.is_empty() {
            if let Some(output) =
                run_command("eslint", &js_files, &self.workspace, self.config.lint_timeout).await
            {
                if !output.success {
                    errors.push(output.text);
                }
            }
        }

        if errors.is_empty() {
            (true, None)
        } else {
            (false, Some(truncate(&errors.join("\n"), 1000)))
        }
    }

    async fn run_type_check(&self, task: &Task) -> (bool, Option<String>) {
        let py_files: Vec<&str> = task
            .target_files
            .iter()
            .map(String::as_str)
            .filter(|f| f.ends_with(".py"))
            .collect();
        let has_ts = task
            .target_files
            .iter()
            .any(|f| f.ends_with(".ts") || f.ends_with(".tsx"));

        let mut errors = Vec::new();
        if !py_files.is_empty() {
            if let Some(output) = run_command(
                "mypy",
                &py_files,
                &self.workspace,
                self.config.type_check_timeout,
            )
            .await
            {
                if !output.success {
                    errors.push(output.text);
                }
            }
        }
        if has_ts {
            if let Some(output) = run_command(
                "npx",
                &["tsc", "--noEmit"],
                &self.workspace,
                self.config.type_check_timeout,
            )
            .await
            {
                if !output.success {
                    errors.push(output.text);
                }
            }
        }

        if errors.is_empty() {
            (true, None)
        } else {
            (false, Some(truncate(&errors.join("\n"), 4000)))
        }
    }

    /// Try a sequence of build commands; the first whose binary exists
    /// decides. Absence of all of them is a soft pass.
    async fn run_build(&self) -> (bool, Option<String>) {
        let commands: [(&str, &[&str]); 4] = [
            ("npm", &["run", "build"]),
            ("yarn", &["build"]),
            ("make", &[]),
            ("cargo", &["build"]),
        ];

        for (program, args) in commands {
            let Some(output) =
                run_command(program, args, &self.workspace, self.config.build_timeout).await
            else {
                continue;
            };
            if output.success {
                return (true, None);
            }
            // The command exists but failed; "not found" in its output means
            // the project has no such build target, so keep trying.
            if !output.text.to_lowercase().contains("not found") {
                return (false, Some(truncate(&output.text, 4000)));
            }
        }

        (true, None)
    }
}

struct CommandOutput {
    success: bool,
    text: String,
}

/// Run a command with a timeout. Returns None when the binary is missing
/// (soft pass for the caller); a timeout is reported as failure.
async fn run_command(
    program: &str,
    args: &[&str],
    cwd: &Path,
    timeout: Duration,
) -> Option<CommandOutput> {
    let child = tokio::process::Command::new(program)
        .args(args)
        .current_dir(cwd)
        .kill_on_drop(true)
        .output();

    match tokio::time::timeout(timeout, child).await {
        Ok(Ok(output)) => {
            let mut text = String::from_utf8_lossy(&output.stdout).to_string();
            text.push_str(&String::from_utf8_lossy(&output.stderr));
            Some(CommandOutput {
                success: output.status.success(),
                text,
            })
        }
        Ok(Err(_)) => None,
        Err(_) => Some(CommandOutput {
            success: false,
            text: format!("{} timed out after {:?}", program, timeout),
        }),
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        text.chars().take(max).collect()
    }
}

/// Retry feedback derived from the first failing gate.
pub fn fix_feedback(gate: GateKind, error: Option<&str>) -> String {
    let error = error.unwrap_or("(no details)");
    match gate {
        GateKind::TestsPass => format!(
            "Tests failed. Please fix the following issues:\n\n{}\n\n\
             Make sure to:\n\
             1. Fix any failing tests\n\
             2. Update tests if behavior changed intentionally\n\
             3. Add missing test cases\n",
            error
        ),
        GateKind::ReviewApproved => format!(
            "Code review requested changes:\n\n{}\n\n\
             Please address the reviewer's feedback and update your implementation.\n",
            error
        ),
        GateKind::LintClean => format!(
            "Linter errors found:\n\n{}\n\n\
             Please fix the linting issues and ensure code style compliance.\n",
            error
        ),
        GateKind::TypeCheck => format!(
            "Type checking errors:\n\n{}\n\n\
             Please fix the type errors and ensure proper type annotations.\n",
            error
        ),
        GateKind::BuildSuccess => format!(
            "Build failed:\n\n{}\n\nPlease fix the build errors.\n",
            error
        ),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::{Agent, AgentError, ChunkStream};
    use async_trait::async_trait;
    use futures::stream;
    use serde_json::Value;
    use std::sync::Arc;
    use tempfile::tempdir;

    struct FixedAgent {
        id: String,
        response: String,
    }

    #[async_trait]
    impl Agent for FixedAgent {
        fn id(&self) -> &str {
            &self.id
        }

        async fn chat(
            &self,
            _messages: Vec<ChatMessage>,
            _context: Value,
            _overrides: ChatOverrides,
        ) -> Result<ChunkStream, AgentError> {
            let response = self.response.clone();
            Ok(Box::pin(stream::once(async move { Ok(response) })))
        }
    }

    async fn runner_with(agent_id: &str, response: &str) -> (GateRunner, tempfile::TempDir) {
        let temp = tempdir().unwrap();
        let agents = AgentRegistry::new();
        agents
            .register(Arc::new(FixedAgent {
                id: agent_id.to_string(),
                response: response.to_string(),
            }))
            .await;
        let runner = GateRunner::new(agents, temp.path().to_path_buf(), GateConfig::default());
        (runner, temp)
    }

    fn task() -> Task {
        Task::new(
            "run1".to_string(),
            "Write file".to_string(),
            "desc".to_string(),
            "coder".to_string(),
        )
    }

    #[tokio::test]
    async fn tests_gate_passes_on_explicit_pass() {
        let (runner, _temp) = runner_with("tester", "All tests pass, 14 total.").await;
        let (passed, error) = runner.check(&task(), GateKind::TestsPass, "").await;
        assert!(passed);
        assert!(error.is_none());
    }

    #[tokio::test]
    async fn tests_gate_fails_with_output() {
        let (runner, _temp) = runner_with("tester", "3 tests failed:\n- test_a\n- test_b").await;
        let (passed, error) = runner.check(&task(), GateKind::TestsPass, "").await;
        assert!(!passed);
        assert!(error.as_deref().unwrap().contains("3 tests failed"));
    }

    #[tokio::test]
    async fn ambiguous_tester_output_is_a_pass() {
        let (runner, _temp) = runner_with("tester", "I looked at the test suite.").await;
        let (passed, _) = runner.check(&task(), GateKind::TestsPass, "").await;
        assert!(passed);
    }

    #[tokio::test]
    async fn ambiguous_pass_is_configurable() {
        let temp = tempdir().unwrap();
        let agents = AgentRegistry::new();
        agents
            .register(Arc::new(FixedAgent {
                id: "tester".to_string(),
                response: "I looked at the test suite.".to_string(),
            }))
            .await;
        let runner = GateRunner::new(
            agents,
            temp.path().to_path_buf(),
            GateConfig {
                ambiguous_is_pass: false,
                ..GateConfig::default()
            },
        );
        let (passed, _) = runner.check(&task(), GateKind::TestsPass, "").await;
        assert!(!passed);
    }

    #[tokio::test]
    async fn missing_tester_is_soft_pass() {
        let temp = tempdir().unwrap();
        let runner = GateRunner::new(
            AgentRegistry::new(),
            temp.path().to_path_buf(),
            GateConfig::default(),
        );
        let (passed, _) = runner.check(&task(), GateKind::TestsPass, "").await;
        assert!(passed);
    }

    #[tokio::test]
    async fn review_gate_requires_approved_without_changes_requested() {
        let (runner, _temp) = runner_with("reviewer", "APPROVED - looks clean").await;
        let (passed, _) = runner.check(&task(), GateKind::ReviewApproved, "code").await;
        assert!(passed);

        let (runner, _temp) =
            runner_with("reviewer", "Approved in parts but CHANGES_REQUESTED overall").await;
        let (passed, error) = runner.check(&task(), GateKind::ReviewApproved, "code").await;
        assert!(!passed);
        assert!(error.is_some());
    }

    #[tokio::test]
    async fn lint_gate_soft_passes_without_lintable_files() {
        let (runner, _temp) = runner_with("tester", "").await;
        let (passed, _) = runner.check(&task(), GateKind::LintClean, "").await;
        assert!(passed);
    }

    #[test]
    fn feedback_wording_per_gate() {
        let feedback = fix_feedback(GateKind::TestsPass, Some("3 test(s) failed"));
        assert!(feedback.contains("Tests failed"));
        assert!(feedback.contains("3 test(s) failed"));

        let feedback = fix_feedback(GateKind::ReviewApproved, Some("rename this"));
        assert!(feedback.contains("review requested changes"));

        let feedback = fix_feedback(GateKind::BuildSuccess, None);
        assert!(feedback.contains("Build failed"));
    }
}
