//! Agent contract and registry
//!
//! An agent is an opaque unit of work identified by a string type key. The
//! coordination layer never inspects what an agent does with its input; it
//! only needs `execute` and a factory that can tell whether a type exists.
//!
//! # Examples
//!
//! ```rust
//! use labflow_core::agent::*;
//! use async_trait::async_trait;
//! use serde_json::{json, Value};
//! use std::sync::Arc;
//!
//! struct Upper;
//!
//! #[async_trait]
//! impl Agent for Upper {
//!     fn agent_type(&self) -> &str {
//!         "upper"
//!     }
//!
//!     async fn execute(
//!         &self,
//!         input: &Value,
//!         _context: &AgentContext,
//!         _config: Option<&AgentConfig>,
//!     ) -> labflow_core::Result<AgentResult> {
//!         let text = input["text"].as_str().unwrap_or_default().to_uppercase();
//!         Ok(AgentResult::success(json!({ "text": text })))
//!     }
//! }
//!
//! let mut registry = AgentRegistry::new();
//! registry.register_instance(Arc::new(Upper));
//! assert!(registry.is_agent_supported("upper"));
//! ```

use crate::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Key under `additional_data` holding the acting user's id
pub const USER_ID_KEY: &str = "user_id";

/// A capability unit invoked by the orchestrator
///
/// Returning `Err` means the agent could not run at all; a business failure
/// should be reported as `Ok(AgentResult::failure(..))`. The orchestrator
/// records both as failed tasks, but only `Err` is eligible for retry.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Registry key for this agent
    fn agent_type(&self) -> &str;

    /// Run the agent against an input payload
    async fn execute(
        &self,
        input: &Value,
        context: &AgentContext,
        config: Option<&AgentConfig>,
    ) -> Result<AgentResult>;
}

/// Supplies agents by type key
pub trait AgentFactory: Send + Sync {
    /// Create (or hand out) the agent registered for `agent_type`
    fn create_agent(&self, agent_type: &str) -> Result<Arc<dyn Agent>>;

    /// Whether `agent_type` can be created
    fn is_agent_supported(&self, agent_type: &str) -> bool;

    /// All supported agent types, sorted
    fn supported_agents(&self) -> Vec<String>;
}

type AgentConstructor = Arc<dyn Fn() -> Arc<dyn Agent> + Send + Sync>;

/// Explicitly constructed agent factory
///
/// Agent types map to constructor closures, so a registry can hand out a
/// fresh agent per call or share one instance.
#[derive(Clone, Default)]
pub struct AgentRegistry {
    constructors: HashMap<String, AgentConstructor>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a constructor for an agent type, replacing any previous one
    pub fn register<F>(&mut self, agent_type: impl Into<String>, constructor: F) -> &mut Self
    where
        F: Fn() -> Arc<dyn Agent> + Send + Sync + 'static,
    {
        self.constructors
            .insert(agent_type.into(), Arc::new(constructor));
        self
    }

    /// Register a shared instance under its own `agent_type`
    pub fn register_instance(&mut self, agent: Arc<dyn Agent>) -> &mut Self {
        let agent_type = agent.agent_type().to_string();
        self.register(agent_type, move || agent.clone())
    }

    /// Remove an agent type, returning whether it was registered
    pub fn unregister(&mut self, agent_type: &str) -> bool {
        self.constructors.remove(agent_type).is_some()
    }

    pub fn len(&self) -> usize {
        self.constructors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.constructors.is_empty()
    }
}

impl AgentFactory for AgentRegistry {
    fn create_agent(&self, agent_type: &str) -> Result<Arc<dyn Agent>> {
        self.constructors
            .get(agent_type)
            .map(|constructor| constructor())
            .ok_or_else(|| Error::unsupported_agent(agent_type))
    }

    fn is_agent_supported(&self, agent_type: &str) -> bool {
        self.constructors.contains_key(agent_type)
    }

    fn supported_agents(&self) -> Vec<String> {
        let mut agents: Vec<String> = self.constructors.keys().cloned().collect();
        agents.sort();
        agents
    }
}

impl fmt::Debug for AgentRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentRegistry")
            .field("agents", &self.supported_agents())
            .finish()
    }
}

/// Read-only data shared by every task in one workflow run
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AgentContext {
    /// Retrieved user profile and history
    #[serde(default)]
    pub user_context: Option<Value>,
    #[serde(default)]
    pub conversation_history: Vec<Value>,
    #[serde(default)]
    pub additional_data: Map<String, Value>,
}

impl AgentContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Context for a specific acting user
    pub fn for_user(user_id: impl Into<String>) -> Self {
        Self::new().with_user_id(user_id)
    }

    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.additional_data
            .insert(USER_ID_KEY.to_string(), Value::String(user_id.into()));
        self
    }

    pub fn with_user_context(mut self, user_context: Value) -> Self {
        self.user_context = Some(user_context);
        self
    }

    pub fn with_data(mut self, key: impl Into<String>, value: Value) -> Self {
        self.additional_data.insert(key.into(), value);
        self
    }

    /// The acting user's id, if one was supplied
    pub fn user_id(&self) -> Option<&str> {
        self.additional_data.get(USER_ID_KEY).and_then(Value::as_str)
    }
}

/// Per-task execution configuration passed through to the agent
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AgentConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Outcome of one agent invocation
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AgentResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub metadata: AgentMetadata,
}

/// Usage and timing details reported alongside a result
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AgentMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_used: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub retries: u32,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl AgentResult {
    /// Successful result carrying `content`
    pub fn success(content: Value) -> Self {
        Self {
            success: true,
            content: Some(content),
            ..Default::default()
        }
    }

    /// Failed result carrying an error message
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn with_tokens(mut self, tokens_used: u64) -> Self {
        self.metadata.tokens_used = Some(tokens_used);
        self
    }

    pub fn with_model(mut self, provider: impl Into<String>, model: impl Into<String>) -> Self {
        self.metadata.provider = Some(provider.into());
        self.metadata.model = Some(model.into());
        self
    }

    /// Content of a successful result
    pub fn successful_content(&self) -> Option<&Value> {
        if self.success {
            self.content.as_ref()
        } else {
            None
        }
    }
}
