//! Workflow orchestration
//!
//! Runs a static graph of agent tasks and folds their results into one
//! output.
//!
//! # Overview
//!
//! ```text
//! Template Registry (optional)
//!     |
//!     v
//! Workflow Definition
//!     |
//!     v
//! Scheduler (priority-aware topological order)
//!     |
//!     v
//! Orchestrator (placeholder resolution, agent calls, retries)
//!     |
//!     v
//! Synthesis (sequential | parallel | hierarchical)
//! ```
//!
//! # Examples
//!
//! ```rust,no_run
//! use labflow_core::agent::{AgentContext, AgentRegistry};
//! use labflow_core::config::OrchestratorSettings;
//! use labflow_core::orchestration::{WorkflowOrchestrator, WorkflowTemplateRegistry};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # async fn example(agents: AgentRegistry) -> labflow_core::Result<()> {
//! let templates = WorkflowTemplateRegistry::with_defaults();
//! let context = AgentContext::for_user("researcher-7");
//! let definition = templates.create_workflow_from_template(
//!     "literature-review",
//!     &json!({ "topic": "protein folding" }),
//!     &context,
//! )?;
//!
//! let orchestrator = WorkflowOrchestrator::new(Arc::new(agents), OrchestratorSettings::default());
//! let result = orchestrator.execute(&definition, &context).await?;
//! println!("success: {}", result.success);
//! # Ok(())
//! # }
//! ```

pub mod models;
pub mod placeholders;
pub mod scheduler;
pub mod synthesis;
pub mod templates;
pub mod workflow;

pub use models::{
    SynthesisStrategy, TaskOutcome, WorkflowDefinition, WorkflowMetadata, WorkflowResult,
    WorkflowTask,
};
pub use placeholders::PlaceholderResolver;
pub use scheduler::{execution_order, execution_order_ids};
pub use synthesis::synthesize;
pub use templates::{
    builtin_templates, InputField, TemplateCategory, WorkflowBuilder, WorkflowTemplate,
    WorkflowTemplateRegistry,
};
pub use workflow::{WorkflowOrchestrator, DEPENDENCIES_KEY};
