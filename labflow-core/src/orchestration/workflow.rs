//! Workflow execution
//!
//! The orchestrator validates a definition, orders its tasks, runs every task
//! through its agent and synthesizes the outcomes. A failing task never aborts
//! the run: it is recorded and its dependents still execute without its
//! result. Only structural problems with the definition are returned as
//! errors.

use super::models::{
    TaskOutcome, WorkflowDefinition, WorkflowMetadata, WorkflowResult, WorkflowTask,
};
use super::placeholders::PlaceholderResolver;
use super::scheduler::{execution_order, execution_order_ids};
use super::synthesis::synthesize;
use crate::agent::{AgentContext, AgentFactory, AgentResult};
use crate::config::{ExecutionMode, OrchestratorSettings};
use crate::{Error, Result};
use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Key under which successful dependency results are passed to a task
pub const DEPENDENCIES_KEY: &str = "dependencies";

/// Runs workflow definitions against a set of agents
#[derive(Clone)]
pub struct WorkflowOrchestrator {
    agents: Arc<dyn AgentFactory>,
    settings: OrchestratorSettings,
}

impl std::fmt::Debug for WorkflowOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowOrchestrator")
            .field("agents", &self.agents.supported_agents())
            .field("settings", &self.settings)
            .finish()
    }
}

impl WorkflowOrchestrator {
    pub fn new(agents: Arc<dyn AgentFactory>, settings: OrchestratorSettings) -> Self {
        Self { agents, settings }
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    pub fn validate(&self, definition: &WorkflowDefinition) -> Result<()> {
        definition.validate(self.agents.as_ref())
    }

    /// Validate and order a definition without running it
    pub fn plan(&self, definition: &WorkflowDefinition) -> Result<Vec<String>> {
        self.validate(definition)?;
        execution_order_ids(&definition.tasks, self.settings.cycle_policy)
    }

    /// Execute a workflow
    ///
    /// Returns an error only when the definition is not executable. Task
    /// failures are reported through the returned [`WorkflowResult`].
    pub async fn execute(
        &self,
        definition: &WorkflowDefinition,
        context: &AgentContext,
    ) -> Result<WorkflowResult> {
        let workflow_id = Uuid::new_v4();
        let started_at = Utc::now();
        let start = Instant::now();

        self.validate(definition)?;
        let order = execution_order(&definition.tasks, self.settings.cycle_policy)?;
        let resolver = PlaceholderResolver::new()?;

        info!(
            workflow = %definition.name,
            workflow_id = %workflow_id,
            tasks = order.len(),
            mode = ?self.settings.execution_mode,
            "Starting workflow"
        );

        let mut results = match self.settings.execution_mode {
            ExecutionMode::Sequential => {
                self.run_sequential(definition, &order, context, &resolver)
                    .await
            }
            ExecutionMode::Parallel => {
                self.run_parallel(definition, &order, context, &resolver)
                    .await
            }
        };

        let outcomes: Vec<TaskOutcome> = order
            .iter()
            .map(|&i| {
                let task = &definition.tasks[i];
                TaskOutcome {
                    task_id: task.id.clone(),
                    agent_type: task.agent_type.clone(),
                    result: results
                        .remove(&task.id)
                        .unwrap_or_else(|| AgentResult::failure("Task was not executed")),
                }
            })
            .collect();

        let success = outcomes.iter().all(TaskOutcome::success);
        let synthesized_result = synthesize(
            definition.synthesis_strategy,
            &definition.name,
            &outcomes,
            &definition.tasks,
        );
        let metadata = self.aggregate_metadata(&outcomes);
        let total_duration_ms = start.elapsed().as_millis() as u64;

        if success {
            info!(
                workflow = %definition.name,
                workflow_id = %workflow_id,
                duration_ms = total_duration_ms,
                "Workflow completed"
            );
        } else {
            let failed: Vec<&str> = outcomes
                .iter()
                .filter(|o| !o.success())
                .map(|o| o.task_id.as_str())
                .collect();
            warn!(
                workflow = %definition.name,
                workflow_id = %workflow_id,
                duration_ms = total_duration_ms,
                failed_tasks = %failed.join(", "),
                "Workflow completed with failed tasks"
            );
        }

        Ok(WorkflowResult {
            workflow_id,
            workflow_name: definition.name.clone(),
            success,
            tasks: outcomes,
            synthesized_result,
            total_duration_ms,
            started_at,
            completed_at: Utc::now(),
            metadata,
        })
    }

    async fn run_sequential(
        &self,
        definition: &WorkflowDefinition,
        order: &[usize],
        context: &AgentContext,
        resolver: &PlaceholderResolver,
    ) -> HashMap<String, AgentResult> {
        let mut results = HashMap::with_capacity(order.len());

        for &i in order {
            let task = &definition.tasks[i];
            let input = enrich_input(task, resolver, &results);
            let result = self.run_task(task, &input, context).await;
            results.insert(task.id.clone(), result);
        }

        results
    }

    /// Run every task whose earlier-ordered dependencies have finished,
    /// at most `max_parallel_tasks` at a time
    async fn run_parallel(
        &self,
        definition: &WorkflowDefinition,
        order: &[usize],
        context: &AgentContext,
        resolver: &PlaceholderResolver,
    ) -> HashMap<String, AgentResult> {
        let tasks = &definition.tasks;
        let position: HashMap<&str, usize> = order
            .iter()
            .enumerate()
            .map(|(p, &i)| (tasks[i].id.as_str(), p))
            .collect();

        let limit = self.settings.max_parallel_tasks.max(1);
        let mut results: HashMap<String, AgentResult> = HashMap::with_capacity(order.len());
        let mut launched = vec![false; order.len()];
        let mut in_flight = FuturesUnordered::new();

        loop {
            for (p, &i) in order.iter().enumerate() {
                if in_flight.len() >= limit {
                    break;
                }
                if launched[p] {
                    continue;
                }

                let task = &tasks[i];
                // dependencies placed later only occur under the lenient cycle policy
                let ready = task.dependencies.iter().all(|dep| match position.get(dep.as_str()) {
                    Some(&dp) if dp < p => results.contains_key(dep),
                    _ => true,
                });
                if !ready {
                    continue;
                }

                launched[p] = true;
                let input = enrich_input(task, resolver, &results);
                in_flight.push(async move {
                    let result = self.run_task(task, &input, context).await;
                    (task.id.clone(), result)
                });
            }

            match in_flight.next().await {
                Some((task_id, result)) => {
                    results.insert(task_id, result);
                }
                None => break,
            }
        }

        results
    }

    /// Invoke a task's agent with retries and the optional timeout
    async fn run_task(
        &self,
        task: &WorkflowTask,
        input: &Value,
        context: &AgentContext,
    ) -> AgentResult {
        let started = Instant::now();
        debug!(task_id = %task.id, agent_type = %task.agent_type, "Running task");

        let agent = match self.agents.create_agent(&task.agent_type) {
            Ok(agent) => agent,
            Err(e) => {
                warn!(
                    task_id = %task.id,
                    agent_type = %task.agent_type,
                    error = %e,
                    "Agent unavailable"
                );
                let mut result = AgentResult::failure(e.to_string());
                result.metadata.duration_ms = Some(started.elapsed().as_millis() as u64);
                return result;
            }
        };

        let mut retry_count = 0;
        let mut result = loop {
            let attempt = agent.execute(input, context, task.config.as_ref());
            let outcome = match self.settings.task_timeout() {
                Some(limit) => match tokio::time::timeout(limit, attempt).await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(Error::timeout(
                        format!("task '{}'", task.id),
                        limit.as_millis() as u64,
                    )),
                },
                None => attempt.await,
            };

            match outcome {
                Ok(result) => break result,
                Err(e) => {
                    if retry_count >= self.settings.max_retries {
                        warn!(
                            task_id = %task.id,
                            agent_type = %task.agent_type,
                            retries = retry_count,
                            error = %e,
                            "Task failed"
                        );
                        break AgentResult::failure(e.to_string());
                    }

                    retry_count += 1;
                    warn!(
                        task_id = %task.id,
                        attempt = retry_count,
                        error = %e,
                        "Task attempt failed, retrying"
                    );

                    // Wait before retry
                    tokio::time::sleep(self.settings.retry_delay()).await;
                }
            }
        };

        result.metadata.duration_ms = Some(started.elapsed().as_millis() as u64);
        result.metadata.retries = retry_count;

        if !result.success {
            debug!(
                task_id = %task.id,
                error = result.error.as_deref().unwrap_or("unknown"),
                "Agent reported failure"
            );
        }

        result
    }

    fn aggregate_metadata(&self, outcomes: &[TaskOutcome]) -> WorkflowMetadata {
        let mut agents_used: Vec<String> = Vec::new();
        for outcome in outcomes {
            if !agents_used.contains(&outcome.agent_type) {
                agents_used.push(outcome.agent_type.clone());
            }
        }

        let total_tokens = outcomes
            .iter()
            .filter_map(|o| o.result.metadata.tokens_used)
            .fold(None, |sum: Option<u64>, tokens| Some(sum.unwrap_or(0) + tokens));

        let estimated_cost = total_tokens
            .map(|tokens| tokens as f64 / 1_000_000.0 * self.settings.cost_per_million_tokens);

        WorkflowMetadata {
            agents_used,
            total_tokens,
            estimated_cost,
            total_retries: outcomes.iter().map(|o| o.result.metadata.retries).sum(),
            execution_order: outcomes.iter().map(|o| o.task_id.clone()).collect(),
        }
    }
}

/// Build a task's effective input
///
/// Placeholders are resolved first. The result is always an object: a null
/// input becomes `{}` and any other non-object input is kept under `input`.
/// Tasks with dependencies also get a `dependencies` map holding the content
/// of each dependency that succeeded.
fn enrich_input(
    task: &WorkflowTask,
    resolver: &PlaceholderResolver,
    results: &HashMap<String, AgentResult>,
) -> Value {
    let mut input = match resolver.resolve(&task.input, &task.dependencies, results) {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert("input".to_string(), other);
            map
        }
    };

    if !task.dependencies.is_empty() {
        let dependencies: Map<String, Value> = task
            .dependencies
            .iter()
            .filter_map(|dep| {
                results
                    .get(dep)
                    .and_then(AgentResult::successful_content)
                    .map(|content| (dep.clone(), content.clone()))
            })
            .collect();
        input.insert(DEPENDENCIES_KEY.to_string(), Value::Object(dependencies));
    }

    Value::Object(input)
}
