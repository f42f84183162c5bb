//! Error types for the coordination layer

use thiserror::Error;

/// Core error type for protocol, negotiation and orchestration operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("Validation error: {message}")]
    Validation { message: String },

    #[error("Entity not found: {entity_type} with id {id}")]
    NotFound { entity_type: String, id: String },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("State transition error: {message}")]
    StateTransition { message: String },

    #[error("Operation timeout: {operation} exceeded {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("Operation cancelled: {operation}")]
    Cancelled { operation: String },

    #[error("No pending request found for correlation id: {correlation_id}")]
    NoPendingRequest { correlation_id: String },

    #[error("Permission denied: {action} - {reason}")]
    PermissionDenied { action: String, reason: String },

    #[error("Unsupported agent type: {agent_type}")]
    UnsupportedAgent { agent_type: String },

    #[error("Dependency error: {dependency} - {message}")]
    Dependency { dependency: String, message: String },

    #[error("Required input missing: {field} - {description}")]
    MissingInput { field: String, description: String },

    #[error("Negotiation {negotiation_id} ended with status {status}")]
    NegotiationFailed {
        negotiation_id: String,
        status: String,
    },

    #[error("Agent {agent_type} failed: {message}")]
    Agent { agent_type: String, message: String },
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::Configuration {
            message: err.to_string(),
        }
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Internal(err.to_string())
    }
}

impl Error {
    /// Create a validation error with a formatted message
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Create a not found error for a specific entity type and ID
    pub fn not_found<S1: Into<String>, S2: Into<String>>(entity_type: S1, id: S2) -> Self {
        Self::NotFound {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a state transition error
    pub fn state_transition<S: Into<String>>(message: S) -> Self {
        Self::StateTransition {
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout<S: Into<String>>(operation: S, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Create a cancellation error
    pub fn cancelled<S: Into<String>>(operation: S) -> Self {
        Self::Cancelled {
            operation: operation.into(),
        }
    }

    /// Create an error for a response that matches no pending request
    pub fn no_pending_request<S: Into<String>>(correlation_id: S) -> Self {
        Self::NoPendingRequest {
            correlation_id: correlation_id.into(),
        }
    }

    /// Create a permission denied error
    pub fn permission_denied<S1: Into<String>, S2: Into<String>>(action: S1, reason: S2) -> Self {
        Self::PermissionDenied {
            action: action.into(),
            reason: reason.into(),
        }
    }

    /// Create an unsupported agent error
    pub fn unsupported_agent<S: Into<String>>(agent_type: S) -> Self {
        Self::UnsupportedAgent {
            agent_type: agent_type.into(),
        }
    }

    /// Create a dependency error
    pub fn dependency<S1: Into<String>, S2: Into<String>>(dependency: S1, message: S2) -> Self {
        Self::Dependency {
            dependency: dependency.into(),
            message: message.into(),
        }
    }

    /// Create a missing template input error
    pub fn missing_input<S1: Into<String>, S2: Into<String>>(field: S1, description: S2) -> Self {
        Self::MissingInput {
            field: field.into(),
            description: description.into(),
        }
    }

    /// Create an error for an agent that failed to execute
    pub fn agent<S1: Into<String>, S2: Into<String>>(agent_type: S1, message: S2) -> Self {
        Self::Agent {
            agent_type: agent_type.into(),
            message: message.into(),
        }
    }

    /// Check if this error is a validation error
    pub fn is_validation(&self) -> bool {
        matches!(self, Error::Validation { .. })
    }

    /// Check if this error is a not found error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    /// Check if this error is a timeout error
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }

    /// Check if this error is a cancellation error
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled { .. })
    }

    /// Check if this error describes a malformed workflow definition
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Error::Validation { .. } | Error::UnsupportedAgent { .. } | Error::Dependency { .. }
        )
    }

    /// Check if this error is recoverable (caller can retry)
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::Timeout { .. } | Error::Agent { .. })
    }

    /// Get the error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            Error::Validation { .. } => "validation",
            Error::NotFound { .. } => "not_found",
            Error::Serialization(_) => "serialization",
            Error::Internal(_) => "internal",
            Error::Configuration { .. } => "configuration",
            Error::StateTransition { .. } => "state_transition",
            Error::Timeout { .. } => "timeout",
            Error::Cancelled { .. } => "cancelled",
            Error::NoPendingRequest { .. } => "no_pending_request",
            Error::PermissionDenied { .. } => "permission_denied",
            Error::UnsupportedAgent { .. } => "unsupported_agent",
            Error::Dependency { .. } => "dependency",
            Error::MissingInput { .. } => "missing_input",
            Error::NegotiationFailed { .. } => "negotiation_failed",
            Error::Agent { .. } => "agent",
        }
    }
}

/// Convenience result type for core operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let validation_err = Error::validation("Test validation error");
        assert!(validation_err.is_validation());
        assert!(!validation_err.is_not_found());
        assert_eq!(validation_err.category(), "validation");

        let not_found_err = Error::not_found("Negotiation", "neg_123");
        assert!(not_found_err.is_not_found());
        assert_eq!(not_found_err.category(), "not_found");

        let timeout_err = Error::timeout("request req_1", 50);
        assert!(timeout_err.is_timeout());
        assert!(!timeout_err.is_cancelled());
        assert!(timeout_err.is_recoverable());
        assert_eq!(timeout_err.category(), "timeout");
    }

    #[test]
    fn test_protocol_failures_are_distinguishable() {
        let timeout = Error::timeout("request req_1", 50);
        let cancelled = Error::cancelled("request req_1");
        let orphan = Error::no_pending_request("req_1");

        assert_ne!(timeout.category(), cancelled.category());
        assert_ne!(cancelled.category(), orphan.category());
        assert!(cancelled.is_cancelled());
        assert!(!orphan.is_timeout());
        assert!(!orphan.is_cancelled());
    }

    #[test]
    fn test_structural_errors() {
        assert!(Error::validation("empty").is_structural());
        assert!(Error::unsupported_agent("ghost").is_structural());
        assert!(Error::dependency("a", "not found").is_structural());
        assert!(!Error::agent("writer", "boom").is_structural());
    }

    #[test]
    fn test_error_from_conversions() {
        let json_err = serde_json::from_str::<serde_json::Value>("invalid json").unwrap_err();
        let core_err: Error = json_err.into();
        assert_eq!(core_err.category(), "serialization");

        let any_err: Error = anyhow::anyhow!("something broke").into();
        assert_eq!(any_err.category(), "internal");
    }

    #[test]
    fn test_error_display() {
        let err = Error::missing_input("research_question", "Main research question");
        let display_str = format!("{}", err);
        assert!(display_str.contains("Required input missing"));
        assert!(display_str.contains("research_question"));
        assert!(display_str.contains("Main research question"));
    }
}
