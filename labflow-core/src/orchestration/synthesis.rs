//! Folding task outcomes into one result
//!
//! All strategies put the workflow name under `workflow`.
//!
//! - `sequential`: successful object results are merged in execution order
//!   (later keys win), plus a `tasks` list with every task's own result.
//!   Non-object results are stored under their task id. `workflow` and
//!   `tasks` cannot be overwritten by merged content.
//! - `parallel`: `results` maps agent type to result content.
//! - `hierarchical`: `structure` maps agent type to `{result, children}`;
//!   a task with dependencies is also listed in each dependency's `children`.

use super::models::{SynthesisStrategy, TaskOutcome, WorkflowTask};
use serde_json::{json, Map, Value};

const WORKFLOW_KEY: &str = "workflow";
const TASKS_KEY: &str = "tasks";

/// Synthesize `outcomes`, which must be in execution order
pub fn synthesize(
    strategy: SynthesisStrategy,
    workflow_name: &str,
    outcomes: &[TaskOutcome],
    tasks: &[WorkflowTask],
) -> Value {
    match strategy {
        SynthesisStrategy::Sequential => sequential(workflow_name, outcomes),
        SynthesisStrategy::Parallel => parallel(workflow_name, outcomes),
        SynthesisStrategy::Hierarchical => hierarchical(workflow_name, outcomes, tasks),
    }
}

fn sequential(workflow_name: &str, outcomes: &[TaskOutcome]) -> Value {
    let mut merged = Map::new();
    let mut entries = Vec::with_capacity(outcomes.len());

    for outcome in outcomes {
        entries.push(json!({
            "task": outcome.agent_type,
            "task_id": outcome.task_id,
            "success": outcome.success(),
            "result": outcome.result.content.clone().unwrap_or(Value::Null),
        }));

        match outcome.content() {
            Some(Value::Object(content)) => {
                for (key, value) in content {
                    merged.insert(key.clone(), value.clone());
                }
            }
            Some(Value::Null) | None => {}
            Some(other) => {
                merged.insert(outcome.task_id.clone(), other.clone());
            }
        }
    }

    merged.insert(WORKFLOW_KEY.to_string(), json!(workflow_name));
    merged.insert(TASKS_KEY.to_string(), Value::Array(entries));
    Value::Object(merged)
}

fn parallel(workflow_name: &str, outcomes: &[TaskOutcome]) -> Value {
    let results: Map<String, Value> = outcomes
        .iter()
        .filter_map(|outcome| {
            outcome
                .content()
                .map(|content| (outcome.agent_type.clone(), content.clone()))
        })
        .collect();

    json!({ "workflow": workflow_name, "results": results })
}

fn hierarchical(workflow_name: &str, outcomes: &[TaskOutcome], tasks: &[WorkflowTask]) -> Value {
    let mut structure = Map::new();

    for outcome in outcomes {
        let Some(content) = outcome.content() else {
            continue;
        };

        if let Some(entry) = node(&mut structure, &outcome.agent_type, Value::Null) {
            entry.insert("result".to_string(), content.clone());
        }

        let dependencies = tasks
            .iter()
            .find(|t| t.id == outcome.task_id)
            .map(|t| t.dependencies.as_slice())
            .unwrap_or_default();

        for dependency in dependencies {
            let Some(parent) = outcomes.iter().find(|o| &o.task_id == dependency) else {
                continue;
            };
            let parent_content = parent.content().cloned().unwrap_or(Value::Null);
            let children = node(&mut structure, &parent.agent_type, parent_content)
                .and_then(|entry| entry.get_mut("children"))
                .and_then(Value::as_object_mut);
            if let Some(children) = children {
                children.insert(outcome.agent_type.clone(), content.clone());
            }
        }
    }

    json!({ "workflow": workflow_name, "structure": structure })
}

/// Entry for `key`, created with `result` when absent
fn node<'a>(
    structure: &'a mut Map<String, Value>,
    key: &str,
    result: Value,
) -> Option<&'a mut Map<String, Value>> {
    structure
        .entry(key.to_string())
        .or_insert_with(|| json!({ "result": result, "children": {} }))
        .as_object_mut()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentResult;

    fn outcome(task_id: &str, agent_type: &str, result: AgentResult) -> TaskOutcome {
        TaskOutcome {
            task_id: task_id.into(),
            agent_type: agent_type.into(),
            result,
        }
    }

    #[test]
    fn test_sequential_later_results_win() {
        let outcomes = vec![
            outcome("t1", "reader", AgentResult::success(json!({ "x": 1 }))),
            outcome("t2", "writer", AgentResult::success(json!({ "x": 2, "y": 3 }))),
        ];

        let result = synthesize(SynthesisStrategy::Sequential, "draft", &outcomes, &[]);
        assert_eq!(result["x"], json!(2));
        assert_eq!(result["y"], json!(3));
        assert_eq!(result["workflow"], json!("draft"));

        let tasks = result["tasks"].as_array().unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0]["task_id"], json!("t1"));
        assert_eq!(tasks[0]["result"], json!({ "x": 1 }));
        assert_eq!(tasks[1]["task"], json!("writer"));
    }

    #[test]
    fn test_sequential_keeps_reserved_keys_and_failures() {
        let outcomes = vec![
            outcome(
                "t1",
                "reader",
                AgentResult::success(json!({ "workflow": "spoofed", "tasks": 7 })),
            ),
            outcome("t2", "writer", AgentResult::failure("quota exceeded")),
            outcome("t3", "counter", AgentResult::success(json!(42))),
        ];

        let result = synthesize(SynthesisStrategy::Sequential, "draft", &outcomes, &[]);
        assert_eq!(result["workflow"], json!("draft"));
        assert_eq!(result["t3"], json!(42));

        let tasks = result["tasks"].as_array().unwrap();
        assert_eq!(tasks.len(), 3);
        assert_eq!(tasks[1]["success"], json!(false));
        assert_eq!(tasks[1]["result"], Value::Null);
    }

    #[test]
    fn test_parallel_maps_agent_types() {
        let outcomes = vec![
            outcome("t1", "reader", AgentResult::success(json!({ "x": 1 }))),
            outcome("t2", "writer", AgentResult::failure("boom")),
            outcome("t3", "critic", AgentResult::success(json!("fine"))),
        ];

        let result = synthesize(SynthesisStrategy::Parallel, "review", &outcomes, &[]);
        assert_eq!(
            result,
            json!({
                "workflow": "review",
                "results": { "reader": { "x": 1 }, "critic": "fine" }
            })
        );
    }

    #[test]
    fn test_hierarchical_nests_dependents() {
        let tasks = vec![
            WorkflowTask::new("a", "outline", json!({})),
            WorkflowTask::new("b", "draft", json!({})).depends_on("a"),
            WorkflowTask::new("c", "review", json!({})).with_dependencies(["a", "b"]),
        ];
        let outcomes = vec![
            outcome("a", "outline", AgentResult::success(json!({ "sections": 3 }))),
            outcome("b", "draft", AgentResult::success(json!({ "words": 900 }))),
            outcome("c", "review", AgentResult::failure("timeout")),
        ];

        let result = synthesize(SynthesisStrategy::Hierarchical, "paper", &outcomes, &tasks);
        let structure = &result["structure"];

        assert_eq!(structure["outline"]["result"], json!({ "sections": 3 }));
        assert_eq!(
            structure["outline"]["children"],
            json!({ "draft": { "words": 900 } })
        );
        assert_eq!(structure["draft"]["result"], json!({ "words": 900 }));
        assert_eq!(structure["draft"]["children"], json!({}));
        assert!(structure.get("review").is_none());
    }
}
