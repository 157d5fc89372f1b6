// Plan parsing
// Turns the planner agent's response into tasks: fenced JSON preferred,
// first balanced bracketed array as fallback, and a single task wrapping
// the original prompt when nothing parses.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use foreman_types::{GateKind, QualityGate, Run, Task};

static FENCED_JSON: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```json\s*(.*?)\s*```").expect("fenced json pattern"));

/// Build the planning prompt from the original request and workspace.
pub fn build_planning_prompt(run: &Run) -> String {
    format!(
        "Analyze this development request and create a detailed task breakdown.\n\n\
         ## Request\n{}\n\n\
         ## Workspace\n{}\n\n\
         ## Instructions\n\
         1. Break down the work into discrete tasks\n\
         2. Identify dependencies between tasks\n\
         3. For each task, specify:\n\
            - A clear title\n\
            - A detailed description of what needs to be done\n\
            - The agent that should handle it (coder, tester, reviewer, docs, devops)\n\
            - Any quality gates needed (tests_pass, review_approved, lint_clean, type_check, build_success)\n\
            - Dependencies on other tasks (by task number)\n\
            - Files that will be created or modified\n\n\
         ## Output Format\n\
         Return your analysis as a JSON array of tasks:\n\
         ```json\n\
         [\n\
           {{\n\
             \"title\": \"Task title\",\n\
             \"description\": \"Detailed description\",\n\
             \"agent\": \"coder\",\n\
             \"quality_gates\": [\"tests_pass\"],\n\
             \"depends_on\": [],\n\
             \"target_files\": [\"src/main.rs\"]\n\
           }}\n\
         ]\n\
         ```\n\n\
         Be thorough but practical. Include testing and documentation tasks. \
         Number dependencies by their position in the array (0-indexed).\n",
        run.original_prompt, run.workspace_path
    )
}

/// Parse the planner's task list. Never fails: an unparseable response
/// falls back to a single task carrying the original prompt.
pub fn parse_task_list(response: &str, run: &Run) -> Vec<Task> {
    let mut tasks = Vec::new();

    if let Some(json_str) = extract_json(response) {
        match serde_json::from_str::<Vec<Value>>(&json_str) {
            Ok(entries) => {
                let total = entries.len();
                for (i, entry) in entries.iter().enumerate() {
                    tasks.push(task_from_entry(entry, i, total, &tasks, run));
                }
            }
            Err(e) => {
                tracing::error!("Failed to parse task JSON from planner: {}", e);
            }
        }
    }

    if tasks.is_empty() {
        tracing::warn!("Planner produced no parseable tasks; falling back to a single task");
        let mut task = Task::new(
            run.id.clone(),
            "Implement request".to_string(),
            run.original_prompt.clone(),
            "coder".to_string(),
        );
        task.max_attempts = run.config.max_attempts;
        tasks.push(task);
    }

    tasks
}

fn extract_json(response: &str) -> Option<String> {
    if let Some(captures) = FENCED_JSON.captures(response) {
        return Some(captures[1].to_string());
    }
    balanced_array(response)
}

/// First balanced `[...]` containing at least one object, scanning with a
/// bracket depth counter so nested arrays inside task entries survive.
fn balanced_array(text: &str) -> Option<String> {
    let start = text.find('[')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    let mut saw_object = false;

    for (offset, ch) in text[start..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '[' if !in_string => depth += 1,
            '{' if !in_string => saw_object = true,
            ']' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    if !saw_object {
                        return None;
                    }
                    return Some(text[start..start + offset + ch.len_utf8()].to_string());
                }
            }
            _ => {}
        }
    }
    None
}

fn task_from_entry(
    entry: &Value,
    index: usize,
    total: usize,
    parsed_so_far: &[Task],
    run: &Run,
) -> Task {
    let title = entry
        .get("title")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| format!("Task {}", index + 1));
    let description = entry
        .get("description")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    let agent_id = entry
        .get("agent")
        .or_else(|| entry.get("agent_type"))
        .and_then(Value::as_str)
        .unwrap_or("coder")
        .to_string();

    let mut task = Task::new(run.id.clone(), title, description, agent_id);
    task.max_attempts = run.config.max_attempts;
    // Earlier tasks get higher priority.
    task.priority = (total - index) as i32;

    // Unknown quality gate names are dropped with a log.
    if let Some(gates) = entry.get("quality_gates").and_then(Value::as_array) {
        for gate in gates {
            if let Some(name) = gate.as_str() {
                match GateKind::parse(name) {
                    Some(kind) => task.quality_gates.push(QualityGate::new(kind)),
                    None => tracing::warn!("Unknown quality gate type: {}", name),
                }
            }
        }
    }

    // depends_on entries that are integers refer to array positions.
    if let Some(deps) = entry.get("depends_on").and_then(Value::as_array) {
        for dep in deps {
            match dep {
                Value::Number(n) => {
                    if let Some(idx) = n.as_u64() {
                        if let Some(earlier) = parsed_so_far.get(idx as usize) {
                            task.depends_on.push(earlier.id.clone());
                        }
                    }
                }
                Value::String(s) => {
                    if let Ok(idx) = s.parse::<usize>() {
                        if let Some(earlier) = parsed_so_far.get(idx) {
                            task.depends_on.push(earlier.id.clone());
                        }
                    } else {
                        task.depends_on.push(s.clone());
                    }
                }
                _ => {}
            }
        }
    }

    if let Some(files) = entry.get("target_files").and_then(Value::as_array) {
        task.target_files = files
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect();
    }

    task
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use foreman_types::RunConfig;

    fn run() -> Run {
        Run::new(
            "demo".to_string(),
            "Build a todo API".to_string(),
            "/tmp/ws".to_string(),
            RunConfig::default(),
        )
    }

    #[test]
    fn parses_fenced_json_plan() {
        let response = r#"Here is my plan:
```json
[
  {"title": "Write API", "description": "impl", "agent": "coder",
   "quality_gates": ["tests_pass"], "depends_on": [], "target_files": ["src/api.rs"]},
  {"title": "Review API", "description": "review", "agent": "reviewer",
   "quality_gates": ["review_approved"], "depends_on": [0]}
]
```
Good luck!"#;
        let run = run();
        let tasks = parse_task_list(response, &run);
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].title, "Write API");
        assert_eq!(tasks[0].agent_id, "coder");
        assert_eq!(tasks[0].target_files, vec!["src/api.rs"]);
        assert_eq!(tasks[0].quality_gates[0].kind, GateKind::TestsPass);
        // Integer dependency resolved to the first task's fresh id.
        assert_eq!(tasks[1].depends_on, vec![tasks[0].id.clone()]);
        // Earlier tasks carry higher priority.
        assert!(tasks[0].priority > tasks[1].priority);
    }

    #[test]
    fn parses_bare_array_without_fence() {
        let response = r#"Tasks: [{"title": "Only task", "agent": "coder", "depends_on": []}] done"#;
        let run = run();
        let tasks = parse_task_list(response, &run);
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].title, "Only task");
    }

    #[test]
    fn unknown_gates_are_dropped() {
        let response = r#"```json
[{"title": "T", "agent": "coder", "quality_gates": ["tests_pass", "vibes_good"]}]
```"#;
        let run = run();
        let tasks = parse_task_list(response, &run);
        assert_eq!(tasks[0].quality_gates.len(), 1);
        assert_eq!(tasks[0].quality_gates[0].kind, GateKind::TestsPass);
    }

    #[test]
    fn string_index_dependencies_resolve() {
        let response = r#"```json
[{"title": "A"}, {"title": "B", "depends_on": ["0"]}, {"title": "C", "depends_on": ["custom-id"]}]
```"#;
        let run = run();
        let tasks = parse_task_list(response, &run);
        assert_eq!(tasks[1].depends_on, vec![tasks[0].id.clone()]);
        assert_eq!(tasks[2].depends_on, vec!["custom-id".to_string()]);
    }

    #[test]
    fn unparseable_response_falls_back_to_single_task() {
        let run = run();
        let tasks = parse_task_list("I couldn't come up with a plan, sorry.", &run);
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].title, "Implement request");
        assert_eq!(tasks[0].description, "Build a todo API");
        assert_eq!(tasks[0].agent_id, "coder");
    }

    #[test]
    fn broken_json_falls_back_to_single_task() {
        let run = run();
        let tasks = parse_task_list("```json\n[{\"title\": broken]\n```", &run);
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].title, "Implement request");
    }

    #[test]
    fn nested_arrays_survive_balanced_scan() {
        let response =
            r#"[{"title": "T", "target_files": ["a.rs", "b.rs"], "quality_gates": []}]"#;
        let run = run();
        let tasks = parse_task_list(response, &run);
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].target_files, vec!["a.rs", "b.rs"]);
    }

    #[test]
    fn planning_prompt_mentions_request_and_workspace() {
        let run = run();
        let prompt = build_planning_prompt(&run);
        assert!(prompt.contains("Build a todo API"));
        assert!(prompt.contains("/tmp/ws"));
        assert!(prompt.contains("```json"));
    }
}
