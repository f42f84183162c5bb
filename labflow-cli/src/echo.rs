//! Echo agents for dry runs

use async_trait::async_trait;
use labflow_core::agent::{Agent, AgentConfig, AgentContext, AgentRegistry, AgentResult};
use labflow_core::Result;
use serde_json::Value;
use std::sync::Arc;

/// Returns its enriched input as content
#[derive(Debug, Clone)]
pub struct EchoAgent {
    agent_type: String,
}

impl EchoAgent {
    pub fn new(agent_type: impl Into<String>) -> Self {
        Self {
            agent_type: agent_type.into(),
        }
    }
}

#[async_trait]
impl Agent for EchoAgent {
    fn agent_type(&self) -> &str {
        &self.agent_type
    }

    async fn execute(
        &self,
        input: &Value,
        _context: &AgentContext,
        config: Option<&AgentConfig>,
    ) -> Result<AgentResult> {
        let model = config
            .and_then(|c| c.model.clone())
            .unwrap_or_else(|| "echo".to_string());
        Ok(AgentResult::success(input.clone()).with_model("simulation", model))
    }
}

/// Registry with an echo agent for each of `agent_types`
pub fn echo_registry<'a>(agent_types: impl IntoIterator<Item = &'a str>) -> AgentRegistry {
    let mut registry = AgentRegistry::new();
    for agent_type in agent_types {
        let owned = agent_type.to_string();
        registry.register(agent_type, move || -> Arc<dyn Agent> {
            Arc::new(EchoAgent::new(owned.clone()))
        });
    }
    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use labflow_core::agent::AgentFactory;
    use serde_json::json;

    #[tokio::test]
    async fn test_echo_registry() {
        let registry = echo_registry(["reader", "writer"]);
        assert_eq!(registry.supported_agents(), vec!["reader", "writer"]);

        let agent = registry.create_agent("writer").unwrap();
        assert_eq!(agent.agent_type(), "writer");

        let result = agent
            .execute(&json!({ "topic": "yeast" }), &AgentContext::new(), None)
            .await
            .unwrap();
        assert_eq!(result.content, Some(json!({ "topic": "yeast" })));
        assert_eq!(result.metadata.model.as_deref(), Some("echo"));
    }
}
