//! Shared fixtures for integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use labflow_core::agent::{Agent, AgentConfig, AgentContext, AgentRegistry, AgentResult};
use labflow_core::Result;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub enum Script {
    /// Return the enriched input as content
    Echo,
    Succeed(Value),
    Fail(String),
}

/// Agent with a fixed behaviour that counts its invocations
pub struct ScriptedAgent {
    agent_type: String,
    script: Script,
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl Agent for ScriptedAgent {
    fn agent_type(&self) -> &str {
        &self.agent_type
    }

    async fn execute(
        &self,
        input: &Value,
        _context: &AgentContext,
        _config: Option<&AgentConfig>,
    ) -> Result<AgentResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(match &self.script {
            Script::Echo => AgentResult::success(input.clone()),
            Script::Succeed(content) => AgentResult::success(content.clone()),
            Script::Fail(error) => AgentResult::failure(error.clone()),
        })
    }
}

/// Registry builder sharing one invocation counter across all agents
#[derive(Default)]
pub struct TestAgents {
    registry: AgentRegistry,
    calls: Arc<AtomicUsize>,
}

impl TestAgents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, agent_type: &str, script: Script) -> Self {
        self.registry.register_instance(Arc::new(ScriptedAgent {
            agent_type: agent_type.to_string(),
            script,
            calls: self.calls.clone(),
        }));
        self
    }

    pub fn calls(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }

    pub fn registry(&self) -> Arc<AgentRegistry> {
        Arc::new(self.registry.clone())
    }
}
