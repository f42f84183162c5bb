//! Protocol message model
//!
//! Every message exchanged between agents is a [`ProtocolMessage`]. The
//! communication pattern that governs delivery is carried as a flattened,
//! tagged [`CommunicationPattern`], so a message serializes as one flat JSON
//! object with a `protocol` field.
//!
//! # Examples
//!
//! Creating a request and the matching response:
//!
//! ```rust
//! use labflow_core::message::*;
//! use serde_json::json;
//!
//! let request = ProtocolMessage::request("planner", "writer", json!({ "section": "intro" }))
//!     .with_timeout(5_000)
//!     .with_priority(MessagePriority::High);
//! assert!(request.validate().is_ok());
//!
//! let response = ProtocolMessage::response(&request, json!({ "text": "..." }), true).unwrap();
//! assert_eq!(response.correlation_id, request.request_id().map(str::to_string));
//! ```
//!
//! Publishing to a topic:
//!
//! ```rust
//! use labflow_core::message::*;
//! use serde_json::json;
//!
//! let message = ProtocolMessage::publish("planner", "experiments", json!({ "status": "done" }));
//! assert!(message.is_broadcast());
//! assert_eq!(message.topic(), Some("experiments"));
//! ```

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

/// Recipient literal used for fan-out messages
pub const BROADCAST_RECIPIENT: &str = "broadcast";

/// A message routed between named agents
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProtocolMessage {
    pub message_id: String,
    pub from: String,
    /// Agent id, `"broadcast"`, or `None` for fan-out patterns
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub content: Value,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub priority: MessagePriority,
    /// Time to live in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_ms: Option<u64>,
    #[serde(flatten)]
    pub protocol: CommunicationPattern,
}

/// Kind of message
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Request,
    Response,
    Notification,
    Query,
    Result,
}

/// Priority of a message
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum MessagePriority {
    Low,
    #[default]
    #[serde(alias = "medium")]
    Normal,
    High,
    Urgent,
}

/// Delivery pattern and its pattern-specific fields
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "protocol", rename_all = "kebab-case")]
pub enum CommunicationPattern {
    RequestResponse {
        request_id: String,
        expects_response: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<u64>,
    },
    PublishSubscribe {
        topic: String,
    },
    Broadcast {
        #[serde(default)]
        scope: BroadcastScope,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filter: Option<BroadcastFilter>,
    },
    Direct,
    Routed {
        route: Vec<String>,
        #[serde(default)]
        current_hop: usize,
    },
}

impl CommunicationPattern {
    /// Wire name of the pattern
    pub fn name(&self) -> &'static str {
        match self {
            CommunicationPattern::RequestResponse { .. } => "request-response",
            CommunicationPattern::PublishSubscribe { .. } => "publish-subscribe",
            CommunicationPattern::Broadcast { .. } => "broadcast",
            CommunicationPattern::Direct => "direct",
            CommunicationPattern::Routed { .. } => "routed",
        }
    }
}

/// Which registered agents a broadcast targets
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum BroadcastScope {
    #[default]
    All,
    Capability,
    Expertise,
}

/// Optional narrowing of broadcast recipients
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BroadcastFilter {
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub expertise: Vec<String>,
    #[serde(default)]
    pub availability: Vec<String>,
}

fn new_message_id() -> String {
    format!("msg_{}", Uuid::new_v4().simple())
}

fn new_request_id() -> String {
    format!("req_{}", Uuid::new_v4().simple())
}

impl ProtocolMessage {
    fn base(
        from: impl Into<String>,
        to: Option<String>,
        kind: MessageKind,
        content: Value,
        protocol: CommunicationPattern,
    ) -> Self {
        Self {
            message_id: new_message_id(),
            from: from.into(),
            to,
            kind,
            content,
            timestamp: Utc::now(),
            correlation_id: None,
            priority: MessagePriority::Normal,
            ttl_ms: None,
            protocol,
        }
    }

    /// Request that expects a response; the timeout falls back to the protocol default
    pub fn request(from: impl Into<String>, to: impl Into<String>, content: Value) -> Self {
        Self::base(
            from,
            Some(to.into()),
            MessageKind::Request,
            content,
            CommunicationPattern::RequestResponse {
                request_id: new_request_id(),
                expects_response: true,
                timeout_ms: None,
            },
        )
    }

    /// Response to `request`, wrapping `result` as `{success, result}`
    pub fn response(request: &ProtocolMessage, result: Value, success: bool) -> Result<Self> {
        let request_id = request
            .request_id()
            .ok_or_else(|| {
                Error::validation("Responses can only answer request-response messages")
            })?
            .to_string();
        let responder = request
            .to
            .clone()
            .ok_or_else(|| Error::validation("Request has no recipient to respond from"))?;

        let mut message = Self::base(
            responder,
            Some(request.from.clone()),
            MessageKind::Response,
            json!({ "success": success, "result": result }),
            CommunicationPattern::RequestResponse {
                request_id: request_id.clone(),
                expects_response: false,
                timeout_ms: None,
            },
        );
        message.correlation_id = Some(request_id);
        message.priority = request.priority;
        Ok(message)
    }

    /// Notification published on a topic
    pub fn publish(from: impl Into<String>, topic: impl Into<String>, content: Value) -> Self {
        Self::base(
            from,
            Some(BROADCAST_RECIPIENT.to_string()),
            MessageKind::Notification,
            content,
            CommunicationPattern::PublishSubscribe {
                topic: topic.into(),
            },
        )
    }

    /// Notification fanned out to registered agents
    pub fn broadcast(
        from: impl Into<String>,
        content: Value,
        scope: BroadcastScope,
        filter: Option<BroadcastFilter>,
    ) -> Self {
        Self::base(
            from,
            Some(BROADCAST_RECIPIENT.to_string()),
            MessageKind::Notification,
            content,
            CommunicationPattern::Broadcast { scope, filter },
        )
    }

    /// Point-to-point notification
    pub fn direct(from: impl Into<String>, to: impl Into<String>, content: Value) -> Self {
        Self::base(
            from,
            Some(to.into()),
            MessageKind::Notification,
            content,
            CommunicationPattern::Direct,
        )
    }

    /// Message forwarded along `route`, addressed to its first hop
    pub fn routed(from: impl Into<String>, route: Vec<String>, content: Value) -> Result<Self> {
        let first = route
            .first()
            .cloned()
            .ok_or_else(|| Error::validation("Route must contain at least one agent"))?;

        Ok(Self::base(
            from,
            Some(first),
            MessageKind::Request,
            content,
            CommunicationPattern::Routed {
                route,
                current_hop: 0,
            },
        ))
    }

    /// Set the request timeout; ignored for other patterns
    pub fn with_timeout(mut self, timeout: u64) -> Self {
        if let CommunicationPattern::RequestResponse { timeout_ms, .. } = &mut self.protocol {
            *timeout_ms = Some(timeout);
        }
        self
    }

    pub fn with_priority(mut self, priority: MessagePriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_ttl(mut self, ttl_ms: u64) -> Self {
        self.ttl_ms = Some(ttl_ms);
        self
    }

    /// Request id for request-response messages
    pub fn request_id(&self) -> Option<&str> {
        match &self.protocol {
            CommunicationPattern::RequestResponse { request_id, .. } => Some(request_id),
            _ => None,
        }
    }

    /// Topic for publish-subscribe messages
    pub fn topic(&self) -> Option<&str> {
        match &self.protocol {
            CommunicationPattern::PublishSubscribe { topic } => Some(topic),
            _ => None,
        }
    }

    /// Whether the message is addressed to no single agent
    pub fn is_broadcast(&self) -> bool {
        self.to.as_deref().map_or(true, |to| to == BROADCAST_RECIPIENT)
    }

    /// Whether this is a request that suspends the sender until answered
    pub fn expects_response(&self) -> bool {
        self.kind == MessageKind::Request
            && matches!(
                self.protocol,
                CommunicationPattern::RequestResponse {
                    expects_response: true,
                    ..
                }
            )
    }

    /// `success` flag of a response body built by [`ProtocolMessage::response`]
    pub fn response_success(&self) -> bool {
        self.content
            .get("success")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// `result` of a response body built by [`ProtocolMessage::response`]
    pub fn response_result(&self) -> Option<&Value> {
        self.content.get("result")
    }

    /// Validate message structure before dispatch
    pub fn validate(&self) -> Result<()> {
        if self.from.trim().is_empty() {
            return Err(Error::validation("Message must have a sender (from)"));
        }

        let fan_out = matches!(
            self.protocol,
            CommunicationPattern::Broadcast { .. } | CommunicationPattern::PublishSubscribe { .. }
        );
        let has_recipient = self.to.as_deref().is_some_and(|to| !to.trim().is_empty());
        if !fan_out && !has_recipient {
            return Err(Error::validation("Message must have a recipient (to)"));
        }

        let empty_content = match &self.content {
            Value::Null => true,
            Value::String(s) => s.is_empty(),
            _ => false,
        };
        if empty_content {
            return Err(Error::validation("Message must have content"));
        }

        match &self.protocol {
            CommunicationPattern::RequestResponse { request_id, .. } => {
                if request_id.trim().is_empty() {
                    return Err(Error::validation("Request message must have a request id"));
                }
                if self.kind == MessageKind::Response && self.correlation_id.is_none() {
                    return Err(Error::validation(
                        "Response message must have a correlation id",
                    ));
                }
            }
            CommunicationPattern::PublishSubscribe { topic } => {
                if topic.trim().is_empty() {
                    return Err(Error::validation(
                        "Publish-subscribe message must have a topic",
                    ));
                }
            }
            CommunicationPattern::Routed { route, .. } => {
                if route.is_empty() {
                    return Err(Error::validation("Routed message must have a route"));
                }
            }
            CommunicationPattern::Broadcast { .. } | CommunicationPattern::Direct => {}
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_request_creation() {
        let request = ProtocolMessage::request("planner", "writer", json!({ "task": "draft" }))
            .with_timeout(250);

        assert!(request.message_id.starts_with("msg_"));
        assert!(request.request_id().unwrap().starts_with("req_"));
        assert!(request.expects_response());
        assert_eq!(request.priority, MessagePriority::Normal);
        assert_matches!(
            request.protocol,
            CommunicationPattern::RequestResponse {
                timeout_ms: Some(250),
                ..
            }
        );
        assert!(request.validate().is_ok());
    }

    #[test]
    fn test_response_correlates_with_request() {
        let request = ProtocolMessage::request("planner", "writer", json!("draft intro"));
        let response =
            ProtocolMessage::response(&request, json!({ "text": "Intro" }), true).unwrap();

        assert_eq!(response.kind, MessageKind::Response);
        assert_eq!(response.from, "writer");
        assert_eq!(response.to.as_deref(), Some("planner"));
        assert_eq!(response.correlation_id.as_deref(), request.request_id());
        assert!(response.response_success());
        assert_eq!(response.response_result(), Some(&json!({ "text": "Intro" })));
        assert!(!response.expects_response());
    }

    #[test]
    fn test_response_requires_request_pattern() {
        let direct = ProtocolMessage::direct("a", "b", json!("hi"));
        assert!(ProtocolMessage::response(&direct, json!(null), true).is_err());
    }

    #[test]
    fn test_routed_requires_route() {
        assert!(ProtocolMessage::routed("a", vec![], json!("x")).is_err());

        let routed =
            ProtocolMessage::routed("a", vec!["b".into(), "c".into()], json!("x")).unwrap();
        assert_eq!(routed.to.as_deref(), Some("b"));
    }

    #[test]
    fn test_validation_rules() {
        let mut message = ProtocolMessage::direct("a", "b", json!("hi"));
        message.from = String::new();
        assert!(message.validate().unwrap_err().is_validation());

        let mut message = ProtocolMessage::direct("a", "b", json!("hi"));
        message.to = None;
        assert!(message.validate().is_err());

        let message = ProtocolMessage::direct("a", "b", Value::Null);
        assert!(message.validate().is_err());

        let message = ProtocolMessage::publish("a", "", json!({ "x": 1 }));
        assert!(message.validate().is_err());

        // Fan-out patterns need no concrete recipient
        let mut message = ProtocolMessage::broadcast("a", json!("hi"), BroadcastScope::All, None);
        message.to = None;
        assert!(message.validate().is_ok());

        let mut message = ProtocolMessage::request("a", "b", json!("hi"));
        message.protocol = CommunicationPattern::RequestResponse {
            request_id: String::new(),
            expects_response: true,
            timeout_ms: None,
        };
        assert!(message.validate().is_err());
    }

    #[test]
    fn test_serialized_shape() {
        let message = ProtocolMessage::publish("a", "lab.updates", json!({ "n": 1 }));
        let value = serde_json::to_value(&message).unwrap();

        assert_eq!(value["protocol"], json!("publish-subscribe"));
        assert_eq!(value["topic"], json!("lab.updates"));
        assert_eq!(value["type"], json!("notification"));

        let back: ProtocolMessage = serde_json::from_value(value).unwrap();
        assert_eq!(back, message);
    }

    #[test]
    fn test_priority_accepts_medium_alias() {
        let priority: MessagePriority = serde_json::from_value(json!("medium")).unwrap();
        assert_eq!(priority, MessagePriority::Normal);
        assert!(MessagePriority::Urgent > MessagePriority::Low);
    }
}
