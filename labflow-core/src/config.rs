//! Settings for the coordination layer
//!
//! Settings are layered with the `config` crate: built-in defaults, then the
//! optional `config/default` and `config/local` files, then an explicit file
//! if one is given, then `LABFLOW_*` environment variables.
//!
//! # Examples
//!
//! ```rust,no_run
//! use labflow_core::config::Settings;
//!
//! let settings = Settings::load(None).unwrap();
//! assert!(settings.orchestrator.max_parallel_tasks > 0);
//! ```
//!
//! Environment overrides use a double underscore between sections:
//!
//! ```text
//! LABFLOW_PROTOCOL__DEFAULT_REQUEST_TIMEOUT_MS=5000
//! LABFLOW_ORCHESTRATOR__EXECUTION_MODE=parallel
//! ```

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Top-level settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Settings {
    #[serde(default)]
    pub orchestrator: OrchestratorSettings,
    #[serde(default)]
    pub protocol: ProtocolSettings,
    #[serde(default)]
    pub negotiation: NegotiationSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

/// How the orchestrator schedules tasks within one run
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// One task at a time, in execution order
    Sequential,
    /// Every task whose dependencies have finished may run, up to `max_parallel_tasks`
    Parallel,
}

/// What to do when the dependency graph cannot be fully ordered
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CyclePolicy {
    /// Fail the run before any task executes
    Reject,
    /// Append the unorderable tasks in definition order and keep going
    AppendRemaining,
}

/// Orchestrator settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OrchestratorSettings {
    pub execution_mode: ExecutionMode,
    pub max_parallel_tasks: usize,
    pub cycle_policy: CyclePolicy,
    /// Upper bound for a single agent invocation
    pub task_timeout_seconds: Option<u64>,
    /// Retries for agents that return an error (not for reported failures)
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    /// USD per one million tokens used for cost estimates
    pub cost_per_million_tokens: f64,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            execution_mode: ExecutionMode::Sequential,
            max_parallel_tasks: 4,
            cycle_policy: CyclePolicy::Reject,
            task_timeout_seconds: None,
            max_retries: 0,
            retry_delay_ms: 500,
            cost_per_million_tokens: 2.0,
        }
    }
}

impl OrchestratorSettings {
    pub fn task_timeout(&self) -> Option<Duration> {
        self.task_timeout_seconds.map(Duration::from_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// Communication protocol settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProtocolSettings {
    pub default_request_timeout_ms: u64,
    pub event_channel_capacity: usize,
}

impl Default for ProtocolSettings {
    fn default() -> Self {
        Self {
            default_request_timeout_ms: 30_000,
            event_channel_capacity: 1000,
        }
    }
}

impl ProtocolSettings {
    pub fn default_request_timeout(&self) -> Duration {
        Duration::from_millis(self.default_request_timeout_ms)
    }
}

/// Negotiation engine settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NegotiationSettings {
    pub default_proposal_priority: u8,
    pub proposal_timeout_ms: u64,
    pub event_channel_capacity: usize,
}

impl Default for NegotiationSettings {
    fn default() -> Self {
        Self {
            default_proposal_priority: 50,
            proposal_timeout_ms: 30_000,
            event_channel_capacity: 1000,
        }
    }
}

impl NegotiationSettings {
    pub fn proposal_timeout(&self) -> Duration {
        Duration::from_millis(self.proposal_timeout_ms)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
    /// `pretty` or `json`
    pub format: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl Settings {
    /// Load settings from defaults, config files and the environment
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder()
            .set_default("orchestrator.execution_mode", "sequential")?
            .set_default("orchestrator.max_parallel_tasks", 4)?
            .set_default("orchestrator.cycle_policy", "reject")?
            .set_default("orchestrator.max_retries", 0)?
            .set_default("orchestrator.retry_delay_ms", 500)?
            .set_default("orchestrator.cost_per_million_tokens", 2.0)?
            .set_default("protocol.default_request_timeout_ms", 30_000)?
            .set_default("protocol.event_channel_capacity", 1000)?
            .set_default("negotiation.default_proposal_priority", 50)?
            .set_default("negotiation.proposal_timeout_ms", 30_000)?
            .set_default("negotiation.event_channel_capacity", 1000)?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "pretty")?
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(config::File::with_name("config/local").required(false));

        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(true));
        }

        let settings: Settings = builder
            .add_source(
                config::Environment::with_prefix("LABFLOW")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        settings.validate()?;
        Ok(settings)
    }

    /// Validate settings values
    pub fn validate(&self) -> Result<()> {
        if self.orchestrator.max_parallel_tasks == 0 {
            return Err(Error::configuration(
                "orchestrator.max_parallel_tasks must be greater than zero",
            ));
        }
        if self.orchestrator.task_timeout_seconds == Some(0) {
            return Err(Error::configuration(
                "orchestrator.task_timeout_seconds must be greater than zero when set",
            ));
        }
        if !self.orchestrator.cost_per_million_tokens.is_finite()
            || self.orchestrator.cost_per_million_tokens < 0.0
        {
            return Err(Error::configuration(
                "orchestrator.cost_per_million_tokens must be a non-negative number",
            ));
        }
        if self.protocol.default_request_timeout_ms == 0 {
            return Err(Error::configuration(
                "protocol.default_request_timeout_ms must be greater than zero",
            ));
        }
        if self.protocol.event_channel_capacity == 0
            || self.negotiation.event_channel_capacity == 0
        {
            return Err(Error::configuration(
                "event channel capacity must be greater than zero",
            ));
        }
        if self.negotiation.default_proposal_priority > 100 {
            return Err(Error::configuration(
                "negotiation.default_proposal_priority must be between 0 and 100",
            ));
        }
        if self.negotiation.proposal_timeout_ms == 0 {
            return Err(Error::configuration(
                "negotiation.proposal_timeout_ms must be greater than zero",
            ));
        }
        match self.logging.format.as_str() {
            "pretty" | "json" => Ok(()),
            other => Err(Error::configuration(format!(
                "logging.format must be 'pretty' or 'json', got '{}'",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    #[test]
    fn test_default_settings_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.orchestrator.execution_mode, ExecutionMode::Sequential);
        assert_eq!(settings.orchestrator.cycle_policy, CyclePolicy::Reject);
        assert_eq!(settings.protocol.default_request_timeout_ms, 30_000);
        assert_eq!(settings.negotiation.default_proposal_priority, 50);
    }

    #[test]
    #[serial]
    fn test_load_without_files() {
        let settings = Settings::load(None).expect("defaults should load");
        assert_eq!(settings.orchestrator.max_parallel_tasks, 4);
        assert_eq!(settings.logging.level, "info");
    }

    #[test]
    #[serial]
    fn test_environment_variable_override() {
        std::env::set_var("LABFLOW_PROTOCOL__DEFAULT_REQUEST_TIMEOUT_MS", "1234");
        let result = Settings::load(None);
        std::env::remove_var("LABFLOW_PROTOCOL__DEFAULT_REQUEST_TIMEOUT_MS");

        let settings = result.expect("settings should load");
        assert_eq!(settings.protocol.default_request_timeout_ms, 1234);
    }

    #[test]
    #[serial]
    fn test_load_explicit_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[orchestrator]\nexecution_mode = \"parallel\"\nmax_parallel_tasks = 2\ncycle_policy = \"append_remaining\"\n"
        )
        .unwrap();

        let path = file.path().to_string_lossy().to_string();
        let settings = Settings::load(Some(&path)).unwrap();
        assert_eq!(settings.orchestrator.execution_mode, ExecutionMode::Parallel);
        assert_eq!(settings.orchestrator.max_parallel_tasks, 2);
        assert_eq!(
            settings.orchestrator.cycle_policy,
            CyclePolicy::AppendRemaining
        );
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut settings = Settings::default();
        settings.orchestrator.max_parallel_tasks = 0;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.logging.format = "xml".to_string();
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.orchestrator.cost_per_million_tokens = -1.0;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.negotiation.default_proposal_priority = 101;
        assert!(settings.validate().is_err());
    }
}
