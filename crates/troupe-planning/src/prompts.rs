//! Prompt builders for controller and worker runs
//!
//! The kernel talks to workers only through text. These builders assemble that
//! text from the goal, the plan and earlier task outputs.

use troupe_core::{Plan, Task, TaskResult, TaskStatus};

/// Output contract appended to planning and repair prompts
const PLAN_FORMAT: &str = r#"Respond with a single JSON object in a ```json fenced block:

{
  "summary": "one paragraph describing the approach",
  "tasks": [
    {
      "id": "short-kebab-id",
      "title": "Short title",
      "role": "role-name",
      "description": "What the worker must do",
      "dependsOn": ["ids of tasks that must finish first"],
      "acceptanceCriteria": ["observable condition"]
    }
  ]
}

Dependencies must refer to ids in the same plan and must not form a cycle."#;

/// Ask the controller to decompose a goal into a plan
pub fn build_planning_prompt(goal: &str, known_roles: &[String]) -> String {
    let mut prompt = String::new();

    prompt.push_str("# PLAN THIS GOAL\n\n");
    prompt.push_str(goal.trim());
    prompt.push_str("\n\n");

    prompt.push_str("## AVAILABLE ROLES\n\n");
    if known_roles.is_empty() {
        prompt.push_str("No roles are pre-registered. Name the roles you need; workers will be created for them.\n\n");
    } else {
        for role in known_roles {
            prompt.push_str(&format!("- {}\n", role));
        }
        prompt.push_str("\nPrefer these roles. A new role name creates a new worker.\n\n");
    }

    prompt.push_str("## OUTPUT FORMAT\n\n");
    prompt.push_str(PLAN_FORMAT);
    prompt.push('\n');
    prompt
}

/// Ask the controller to fix a plan that failed validation
pub fn build_repair_prompt(goal: &str, previous_output: &str, error: &str) -> String {
    let mut prompt = String::new();

    prompt.push_str("# REPAIR THIS PLAN\n\n");
    prompt.push_str("Your previous plan could not be used.\n\n");
    prompt.push_str(&format!("**Error:** {}\n\n", error));

    prompt.push_str("## GOAL\n\n");
    prompt.push_str(goal.trim());
    prompt.push_str("\n\n");

    prompt.push_str("## PREVIOUS OUTPUT\n\n");
    prompt.push_str(previous_output.trim());
    prompt.push_str("\n\n");

    prompt.push_str("## OUTPUT FORMAT\n\n");
    prompt.push_str(PLAN_FORMAT);
    prompt.push('\n');
    prompt
}

/// Build the prompt a worker receives for one task attempt
pub fn build_task_prompt(
    goal: &str,
    plan: &Plan,
    task: &Task,
    dependency_outputs: &[(String, String)],
) -> String {
    let mut prompt = String::new();

    prompt.push_str(&format!("# TASK {}: {}\n\n", task.id, task.title));

    prompt.push_str("## GOAL\n\n");
    prompt.push_str(goal.trim());
    prompt.push_str("\n\n");

    prompt.push_str("## PLAN SUMMARY\n\n");
    prompt.push_str(&plan.summary);
    prompt.push_str("\n\n");

    prompt.push_str("## YOUR TASK\n\n");
    prompt.push_str(&task.description);
    prompt.push_str("\n\n");

    if !dependency_outputs.is_empty() {
        prompt.push_str("## INPUTS FROM COMPLETED TASKS\n\n");
        for (task_id, output) in dependency_outputs {
            prompt.push_str(&format!("### {}\n\n{}\n\n", task_id, output.trim()));
        }
    }

    if !task.acceptance_criteria.is_empty() {
        prompt.push_str("## ACCEPTANCE CRITERIA\n\n");
        for criterion in &task.acceptance_criteria {
            prompt.push_str(&format!("- [ ] {}\n", criterion));
        }
        prompt.push('\n');
    }

    prompt.push_str("Use the agent_* messaging tools if you need to coordinate with other workers.\n");
    prompt
}

/// Ask the controller to report on a finished goal
pub fn build_summary_prompt(goal: &str, plan: &Plan, results: &[TaskResult]) -> String {
    let mut prompt = String::new();

    prompt.push_str("# SUMMARIZE THIS RUN\n\n");
    prompt.push_str("## GOAL\n\n");
    prompt.push_str(goal.trim());
    prompt.push_str("\n\n");

    prompt.push_str("## PLAN\n\n");
    prompt.push_str(&plan.summary);
    prompt.push_str("\n\n");

    let completed: Vec<&TaskResult> = results.iter().filter(|r| r.is_completed()).collect();
    let unfinished: Vec<&TaskResult> = results.iter().filter(|r| !r.is_completed()).collect();

    prompt.push_str("## COMPLETED\n\n");
    if completed.is_empty() {
        prompt.push_str("None\n");
    }
    for result in &completed {
        prompt.push_str(&format!(
            "- [x] {} ({})\n",
            result.task_id, result.role
        ));
    }
    prompt.push('\n');

    prompt.push_str("## FAILED OR NOT STARTED\n\n");
    if unfinished.is_empty() {
        prompt.push_str("None\n");
    }
    for result in &unfinished {
        let reason = result.error.as_deref().unwrap_or("no error recorded");
        let label = if result.status == TaskStatus::Failed {
            "failed"
        } else {
            "not started"
        };
        prompt.push_str(&format!(
            "- [ ] {} ({}, {}): {}\n",
            result.task_id, result.role, label, reason
        ));
    }
    prompt.push('\n');

    prompt.push_str("Summarize what was achieved and propose concrete next steps.\n");
    prompt
}

/// Ask the controller to write a system prompt for a role nobody registered
///
/// `goal` is optional context; pass an empty string when there is none.
pub fn build_role_prompt_request(role: &str, goal: &str) -> String {
    let mut prompt = String::new();

    prompt.push_str("# WRITE A SYSTEM PROMPT\n\n");
    prompt.push_str(&format!(
        "A task needs a worker with the role \"{}\".\n\n",
        role
    ));

    if !goal.trim().is_empty() {
        prompt.push_str("## GOAL\n\n");
        prompt.push_str(goal.trim());
        prompt.push_str("\n\n");
    }

    prompt.push_str("Write the system prompt for this worker. Cover:\n");
    prompt.push_str(&format!("- Responsibilities of the {} role\n", role));
    prompt.push_str("- When to use tools, including the agent_* messaging tools\n");
    prompt.push_str("- The expected output format for task results\n\n");
    prompt.push_str("Respond with the system prompt text only.\n");
    prompt
}

/// Fallback system prompt when the controller cannot write one
pub fn default_role_prompt(role: &str) -> String {
    format!(
        "You are a {role} worker in a multi-agent team. Complete the task you are given, \
         stay within the responsibilities of a {role}, use the agent_* messaging tools to \
         coordinate with other workers when needed, and finish with a concise report of \
         what you produced.",
        role = role
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan() -> Plan {
        Plan::new(
            "Build a blog",
            vec![
                Task::new("design", "Design", "designer", "Draw the layout"),
                Task::new("frontend", "Frontend", "coder", "Implement the layout")
                    .with_depends_on(["design"])
                    .with_acceptance_criteria(["matches the design"]),
            ],
        )
    }

    #[test]
    fn test_planning_prompt_lists_roles() {
        let prompt = build_planning_prompt(
            "Launch a blog",
            &["designer".to_string(), "coder".to_string()],
        );
        assert!(prompt.contains("Launch a blog"));
        assert!(prompt.contains("- designer"));
        assert!(prompt.contains("\"dependsOn\""));
    }

    #[test]
    fn test_repair_prompt_carries_error_and_previous_output() {
        let prompt = build_repair_prompt("goal", "{broken", "plan is not valid JSON");
        assert!(prompt.contains("plan is not valid JSON"));
        assert!(prompt.contains("{broken"));
    }

    #[test]
    fn test_task_prompt_includes_inputs_and_criteria() {
        let plan = plan();
        let prompt = build_task_prompt(
            "Launch a blog",
            &plan,
            &plan.tasks[1],
            &[("design".to_string(), "wireframe v1".to_string())],
        );
        assert!(prompt.contains("# TASK frontend: Frontend"));
        assert!(prompt.contains("Build a blog"));
        assert!(prompt.contains("### design"));
        assert!(prompt.contains("wireframe v1"));
        assert!(prompt.contains("- [ ] matches the design"));
    }

    #[test]
    fn test_summary_prompt_splits_outcomes() {
        let plan = plan();
        let mut done = TaskResult::pending(&plan.tasks[0]);
        done.status = TaskStatus::Completed;
        let mut failed = TaskResult::pending(&plan.tasks[1]);
        failed.status = TaskStatus::Failed;
        failed.error = Some("compiler error".to_string());

        let prompt = build_summary_prompt("goal", &plan, &[done, failed]);
        assert!(prompt.contains("- [x] design (designer)"));
        assert!(prompt.contains("- [ ] frontend (coder, failed): compiler error"));
    }

    #[test]
    fn test_role_prompt_request_goal_is_optional() {
        let with_goal = build_role_prompt_request("translator", "Ship the French site");
        assert!(with_goal.contains("\"translator\""));
        assert!(with_goal.contains("## GOAL\n\nShip the French site"));

        let without_goal = build_role_prompt_request("translator", "  ");
        assert!(!without_goal.contains("## GOAL"));
    }

    #[test]
    fn test_default_role_prompt_mentions_role() {
        assert!(default_role_prompt("data-analyst").contains("data-analyst"));
    }
}
