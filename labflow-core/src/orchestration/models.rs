//! Workflow definitions and results

use crate::agent::{AgentConfig, AgentFactory, AgentResult};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use uuid::Uuid;

/// How task results are folded into one output
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SynthesisStrategy {
    /// Merge result objects in execution order, later keys win
    #[default]
    Sequential,
    /// Map each agent type to its result
    Parallel,
    /// Nest results under the results they depend on
    Hierarchical,
}

/// One unit of work in a workflow
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowTask {
    /// Unique within a definition
    pub id: String,
    /// Registry key of the agent that runs this task
    pub agent_type: String,
    #[serde(default)]
    pub input: Value,
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Higher runs earlier among unblocked tasks
    #[serde(default)]
    pub priority: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<AgentConfig>,
}

impl WorkflowTask {
    pub fn new(id: impl Into<String>, agent_type: impl Into<String>, input: Value) -> Self {
        Self {
            id: id.into(),
            agent_type: agent_type.into(),
            input,
            dependencies: Vec::new(),
            priority: 0,
            config: None,
        }
    }

    pub fn depends_on(mut self, task_id: impl Into<String>) -> Self {
        self.dependencies.push(task_id.into());
        self
    }

    pub fn with_dependencies<I, S>(mut self, task_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies.extend(task_ids.into_iter().map(Into::into));
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_config(mut self, config: AgentConfig) -> Self {
        self.config = Some(config);
        self
    }
}

/// A named graph of tasks plus a synthesis strategy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub tasks: Vec<WorkflowTask>,
    #[serde(default)]
    pub synthesis_strategy: SynthesisStrategy,
}

impl WorkflowDefinition {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            tasks: Vec::new(),
            synthesis_strategy: SynthesisStrategy::Sequential,
        }
    }

    pub fn with_task(mut self, task: WorkflowTask) -> Self {
        self.tasks.push(task);
        self
    }

    pub fn with_strategy(mut self, strategy: SynthesisStrategy) -> Self {
        self.synthesis_strategy = strategy;
        self
    }

    pub fn task(&self, task_id: &str) -> Option<&WorkflowTask> {
        self.tasks.iter().find(|t| t.id == task_id)
    }

    /// Check the definition is executable with the given agents
    ///
    /// Rejects an empty task list, duplicate task ids, unsupported agent
    /// types and dependencies on tasks that do not exist.
    pub fn validate(&self, agents: &dyn AgentFactory) -> Result<()> {
        if self.tasks.is_empty() {
            return Err(Error::validation(format!(
                "Workflow '{}' must have at least one task",
                self.name
            )));
        }

        let mut ids = HashSet::with_capacity(self.tasks.len());
        for task in &self.tasks {
            if task.id.trim().is_empty() {
                return Err(Error::validation("Task id cannot be empty"));
            }
            if !ids.insert(task.id.as_str()) {
                return Err(Error::validation(format!(
                    "Duplicate task id '{}'",
                    task.id
                )));
            }
        }

        for task in &self.tasks {
            if !agents.is_agent_supported(&task.agent_type) {
                return Err(Error::unsupported_agent(&task.agent_type));
            }
        }

        for task in &self.tasks {
            if let Some(missing) = task.dependencies.iter().find(|d| !ids.contains(d.as_str())) {
                return Err(Error::dependency(
                    missing,
                    format!("Task '{}' depends on a task that does not exist", task.id),
                ));
            }
        }

        Ok(())
    }
}

/// Result of one task in a run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskOutcome {
    pub task_id: String,
    pub agent_type: String,
    #[serde(flatten)]
    pub result: AgentResult,
}

impl TaskOutcome {
    pub fn success(&self) -> bool {
        self.result.success
    }

    pub fn content(&self) -> Option<&Value> {
        self.result.successful_content()
    }

    pub fn error(&self) -> Option<&str> {
        self.result.error.as_deref()
    }

    pub fn duration_ms(&self) -> Option<u64> {
        self.result.metadata.duration_ms
    }
}

/// Aggregate details for a run
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct WorkflowMetadata {
    /// Distinct agent types in first-use order
    pub agents_used: Vec<String>,
    /// Sum over tasks that reported usage
    pub total_tokens: Option<u64>,
    /// USD estimate derived from `total_tokens`
    pub estimated_cost: Option<f64>,
    pub total_retries: u32,
    pub execution_order: Vec<String>,
}

/// Outcome of one workflow execution
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowResult {
    pub workflow_id: Uuid,
    pub workflow_name: String,
    /// True iff every task succeeded
    pub success: bool,
    /// Per-task outcomes in execution order
    pub tasks: Vec<TaskOutcome>,
    pub synthesized_result: Value,
    pub total_duration_ms: u64,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub metadata: WorkflowMetadata,
}

impl WorkflowResult {
    pub fn task(&self, task_id: &str) -> Option<&TaskOutcome> {
        self.tasks.iter().find(|t| t.task_id == task_id)
    }

    pub fn failed_tasks(&self) -> impl Iterator<Item = &TaskOutcome> {
        self.tasks.iter().filter(|t| !t.success())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{Agent, AgentContext, AgentRegistry};
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Arc;

    struct Noop(&'static str);

    #[async_trait]
    impl Agent for Noop {
        fn agent_type(&self) -> &str {
            self.0
        }

        async fn execute(
            &self,
            _input: &Value,
            _context: &AgentContext,
            _config: Option<&AgentConfig>,
        ) -> Result<AgentResult> {
            Ok(AgentResult::success(json!({})))
        }
    }

    fn registry() -> AgentRegistry {
        let mut registry = AgentRegistry::new();
        registry
            .register_instance(Arc::new(Noop("reader")))
            .register_instance(Arc::new(Noop("writer")));
        registry
    }

    #[test]
    fn test_definition_deserializes_with_defaults() {
        let definition: WorkflowDefinition = serde_json::from_value(json!({
            "name": "draft",
            "tasks": [
                { "id": "read", "agent_type": "reader" },
                { "id": "write", "agent_type": "writer", "dependencies": ["read"], "priority": 2 }
            ]
        }))
        .unwrap();

        assert_eq!(definition.synthesis_strategy, SynthesisStrategy::Sequential);
        assert_eq!(definition.tasks[0].priority, 0);
        assert_eq!(definition.tasks[0].input, Value::Null);
        assert_eq!(definition.task("write").unwrap().dependencies, vec!["read"]);
        assert!(definition.validate(&registry()).is_ok());
    }

    #[test]
    fn test_validation_rejects_structural_problems() {
        let registry = registry();

        let empty = WorkflowDefinition::new("empty", "");
        assert!(empty.validate(&registry).unwrap_err().is_validation());

        let unsupported = WorkflowDefinition::new("w", "")
            .with_task(WorkflowTask::new("a", "ghost", json!({})));
        assert_matches!(
            unsupported.validate(&registry),
            Err(Error::UnsupportedAgent { agent_type }) if agent_type == "ghost"
        );

        let dangling = WorkflowDefinition::new("w", "")
            .with_task(WorkflowTask::new("a", "reader", json!({})).depends_on("missing"));
        assert_matches!(
            dangling.validate(&registry),
            Err(Error::Dependency { dependency, .. }) if dependency == "missing"
        );

        let duplicate = WorkflowDefinition::new("w", "")
            .with_task(WorkflowTask::new("a", "reader", json!({})))
            .with_task(WorkflowTask::new("a", "writer", json!({})));
        assert!(duplicate.validate(&registry).unwrap_err().is_validation());
    }

    #[test]
    fn test_task_outcome_serializes_flat() {
        let outcome = TaskOutcome {
            task_id: "a".into(),
            agent_type: "reader".into(),
            result: AgentResult::success(json!({ "rows": 3 })),
        };
        let value = serde_json::to_value(&outcome).unwrap();
        assert_eq!(value["task_id"], json!("a"));
        assert_eq!(value["success"], json!(true));
        assert_eq!(value["content"], json!({ "rows": 3 }));
    }
}
