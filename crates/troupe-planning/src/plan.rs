//! Plan extraction, shape validation and normalization
//!
//! Controller output is free-form text. [`parse_plan`] finds the JSON object in
//! it, checks the shape, normalizes identifiers and finally hands the result to
//! [`validate_plan`](crate::dag::validate_plan) for the graph checks.

use regex::Regex;
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::OnceLock;
use tracing::debug;
use troupe_core::{Plan, Result, Task, TroupeError};

use crate::dag::validate_plan;

static FENCED_JSON: OnceLock<Regex> = OnceLock::new();

fn fenced_json() -> &'static Regex {
    FENCED_JSON.get_or_init(|| {
        Regex::new(r"(?is)```json[ \t]*\r?\n?(.*?)```").expect("fenced json pattern is valid")
    })
}

#[derive(Debug, Deserialize)]
struct RawPlan {
    summary: Option<String>,
    tasks: Option<Vec<RawTask>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawTask {
    id: Option<String>,
    title: Option<String>,
    role: Option<String>,
    description: Option<String>,
    #[serde(default, alias = "depends_on")]
    depends_on: Vec<String>,
    #[serde(default, alias = "acceptance_criteria")]
    acceptance_criteria: Vec<String>,
}

/// Locate the JSON object inside free-form text
///
/// Prefers a ```` ```json ```` fenced block, then the span from the first `{`
/// to the last `}`, then the trimmed text itself.
pub fn extract_json(raw: &str) -> &str {
    if let Some(block) = fenced_json().captures(raw).and_then(|c| c.get(1)) {
        return block.as_str().trim();
    }

    if let (Some(start), Some(end)) = (raw.find('{'), raw.rfind('}')) {
        if start < end {
            return &raw[start..=end];
        }
    }

    raw.trim()
}

/// Parse and validate a plan from controller output
pub fn parse_plan(raw: &str) -> Result<Plan> {
    let json = extract_json(raw);
    debug!("Parsing plan from {} bytes of JSON", json.len());

    let raw_plan: RawPlan = serde_json::from_str(json)
        .map_err(|e| TroupeError::PlanFormat(format!("plan is not valid JSON: {}", e)))?;

    let plan = normalize(raw_plan)?;
    validate_plan(&plan)?;
    Ok(plan)
}

/// Serialize a plan in the wire format accepted by [`parse_plan`]
pub fn plan_to_wire(plan: &Plan) -> Result<String> {
    Ok(serde_json::to_string_pretty(plan)?)
}

fn required(value: Option<String>, field: &str, index: usize) -> Result<String> {
    let value = value.map(|v| v.trim().to_string()).unwrap_or_default();
    if value.is_empty() {
        return Err(TroupeError::PlanFormat(format!(
            "task {} is missing a non-empty \"{}\"",
            index, field
        )));
    }
    Ok(value)
}

fn normalize(raw: RawPlan) -> Result<Plan> {
    let summary = raw.summary.map(|s| s.trim().to_string()).unwrap_or_default();
    if summary.is_empty() {
        return Err(TroupeError::PlanFormat(
            "plan is missing a non-empty \"summary\"".to_string(),
        ));
    }

    let raw_tasks = raw.tasks.unwrap_or_default();
    if raw_tasks.is_empty() {
        return Err(TroupeError::PlanFormat(
            "plan must contain at least one task".to_string(),
        ));
    }

    let mut tasks = Vec::with_capacity(raw_tasks.len());
    for (index, raw_task) in raw_tasks.into_iter().enumerate() {
        let task = Task {
            id: required(raw_task.id, "id", index)?,
            title: required(raw_task.title, "title", index)?,
            role: required(raw_task.role, "role", index)?,
            description: required(raw_task.description, "description", index)?,
            depends_on: raw_task
                .depends_on
                .iter()
                .map(|d| d.trim().to_string())
                .filter(|d| !d.is_empty())
                .collect(),
            acceptance_criteria: raw_task
                .acceptance_criteria
                .iter()
                .map(|c| c.trim().to_string())
                .filter(|c| !c.is_empty())
                .collect(),
        };
        tasks.push(task);
    }

    dedupe_ids(&mut tasks);
    prune_dependencies(&mut tasks);

    Ok(Plan { summary, tasks })
}

/// Rename repeated ids to `<id>-2`, `<id>-3`, ... keeping the first occurrence
fn dedupe_ids(tasks: &mut [Task]) {
    let original: HashSet<String> = tasks.iter().map(|t| t.id.clone()).collect();
    let mut used: HashSet<String> = HashSet::new();

    for task in tasks.iter_mut() {
        if used.insert(task.id.clone()) {
            continue;
        }

        let base = task.id.clone();
        let mut suffix = 2;
        let renamed = loop {
            let candidate = format!("{}-{}", base, suffix);
            if !used.contains(&candidate) && !original.contains(&candidate) {
                break candidate;
            }
            suffix += 1;
        };
        debug!("Renamed duplicate task id {} to {}", base, renamed);
        used.insert(renamed.clone());
        task.id = renamed;
    }
}

/// Drop self, repeated and unresolvable dependency entries
fn prune_dependencies(tasks: &mut [Task]) {
    let known: HashSet<String> = tasks.iter().map(|t| t.id.clone()).collect();

    for task in tasks.iter_mut() {
        let mut seen: HashSet<String> = HashSet::new();
        let own_id = task.id.clone();
        task.depends_on.retain(|dep| {
            if *dep == own_id || !known.contains(dep) {
                debug!("Dropping dependency {} from task {}", dep, own_id);
                return false;
            }
            seen.insert(dep.clone())
        });
    }
}
