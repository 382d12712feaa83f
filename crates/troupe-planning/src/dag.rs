//! Dependency graph checks for plans
//!
//! A plan is runnable when every `dependsOn` entry names a task in the same plan
//! and following dependencies never leads back to where it started.

use std::collections::{HashMap, HashSet};
use troupe_core::{Plan, Result, TroupeError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Visited,
}

/// Check that dependencies resolve and the graph is acyclic
///
/// Works on any [`Plan`], not only ones produced by the parser, so it reports
/// dangling references instead of assuming they were pruned.
pub fn validate_plan(plan: &Plan) -> Result<()> {
    if plan.tasks.is_empty() {
        return Err(TroupeError::PlanFormat(
            "plan must contain at least one task".to_string(),
        ));
    }

    let mut index: HashMap<&str, usize> = HashMap::with_capacity(plan.tasks.len());
    for (i, task) in plan.tasks.iter().enumerate() {
        if index.insert(task.id.as_str(), i).is_some() {
            return Err(TroupeError::PlanFormat(format!(
                "duplicate task id \"{}\"",
                task.id
            )));
        }
    }

    for task in &plan.tasks {
        for dep in &task.depends_on {
            if !index.contains_key(dep.as_str()) {
                return Err(TroupeError::PlanFormat(format!(
                    "task \"{}\" depends on unknown task \"{}\"",
                    task.id, dep
                )));
            }
        }
    }

    let mut marks: HashMap<&str, Mark> = HashMap::new();
    for task in &plan.tasks {
        walk_from(plan, &index, task.id.as_str(), &mut marks)?;
    }

    Ok(())
}

/// Depth-first walk from `root` on an explicit stack of (task id, next dependency)
fn walk_from<'a>(
    plan: &'a Plan,
    index: &HashMap<&'a str, usize>,
    root: &'a str,
    marks: &mut HashMap<&'a str, Mark>,
) -> Result<()> {
    if marks.contains_key(root) {
        return Ok(());
    }
    marks.insert(root, Mark::Visiting);
    let mut stack: Vec<(&'a str, usize)> = vec![(root, 0)];

    while let Some(frame) = stack.last_mut() {
        let (id, next) = *frame;
        let Some(&i) = index.get(id) else {
            return Err(TroupeError::PlanFormat(format!(
                "dependency on unknown task \"{}\"",
                id
            )));
        };
        let Some(dep) = plan.tasks[i].depends_on.get(next) else {
            marks.insert(id, Mark::Visited);
            stack.pop();
            continue;
        };
        frame.1 += 1;
        let dep = dep.as_str();

        match marks.get(dep) {
            Some(Mark::Visited) => {}
            Some(Mark::Visiting) => {
                let start = stack.iter().position(|(p, _)| *p == dep).unwrap_or(0);
                let mut cycle: Vec<&str> = stack[start..].iter().map(|(p, _)| *p).collect();
                cycle.push(dep);
                return Err(TroupeError::PlanFormat(format!(
                    "dependency cycle detected: {}",
                    cycle.join(" -> ")
                )));
            }
            None => {
                marks.insert(dep, Mark::Visiting);
                stack.push((dep, 0));
            }
        }
    }
    Ok(())
}

/// Deterministic topological order, preferring plan order among ready tasks
pub fn execution_order(plan: &Plan) -> Result<Vec<String>> {
    validate_plan(plan)?;

    let mut done: HashSet<&str> = HashSet::new();
    let mut order = Vec::with_capacity(plan.tasks.len());

    while order.len() < plan.tasks.len() {
        let next = plan.tasks.iter().find(|t| {
            !done.contains(t.id.as_str())
                && t.depends_on.iter().all(|d| done.contains(d.as_str()))
        });

        match next {
            Some(task) => {
                done.insert(task.id.as_str());
                order.push(task.id.clone());
            }
            // validate_plan rules this out
            None => {
                return Err(TroupeError::PlanFormat(
                    "no runnable task left in plan".to_string(),
                ))
            }
        }
    }

    Ok(order)
}
