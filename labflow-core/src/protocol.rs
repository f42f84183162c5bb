//! Agent communication protocol
//!
//! [`CommunicationProtocol`] dispatches each [`ProtocolMessage`] to one of five
//! handlers according to its pattern. It owns the pending-request table, the
//! topic subscriber table and the agent directory used to resolve broadcast
//! recipients. Delivery is observable through a typed [`ProtocolEvent`]
//! channel.
//!
//! Only request-response suspends the caller. Publish, broadcast, direct and
//! routed sends return as soon as their events are emitted.

use crate::config::ProtocolSettings;
use crate::message::{
    BroadcastFilter, BroadcastScope, CommunicationPattern, MessageKind, ProtocolMessage,
    BROADCAST_RECIPIENT,
};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, trace, warn};

/// Typed protocol events
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolEvent {
    RequestSent(ProtocolMessage),
    ResponseReceived(ProtocolMessage),
    RequestTimedOut {
        request_id: String,
        timeout_ms: u64,
    },
    RequestCancelled {
        request_id: String,
    },
    /// One delivery per subscriber present at publish time
    Published {
        topic: String,
        recipient: String,
        message: ProtocolMessage,
    },
    PublishCompleted {
        topic: String,
        subscribers: Vec<String>,
    },
    SubscriptionCreated {
        agent: String,
        topic: String,
    },
    SubscriptionRemoved {
        agent: String,
        topic: String,
    },
    Broadcast {
        message: ProtocolMessage,
        recipients: Vec<String>,
    },
    DirectDelivered(ProtocolMessage),
    RoutedForwarded(ProtocolMessage),
    RoutedArrived(ProtocolMessage),
}

/// Directory entry describing what an agent can do
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentProfile {
    pub agent_id: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub expertise: Vec<String>,
    #[serde(default = "default_availability")]
    pub availability: String,
}

fn default_availability() -> String {
    "available".to_string()
}

impl AgentProfile {
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            capabilities: Vec::new(),
            expertise: Vec::new(),
            availability: default_availability(),
        }
    }

    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_expertise<I, S>(mut self, expertise: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.expertise = expertise.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_availability(mut self, availability: impl Into<String>) -> Self {
        self.availability = availability.into();
        self
    }

    fn matches(&self, scope: BroadcastScope, filter: Option<&BroadcastFilter>) -> bool {
        let in_scope = match scope {
            BroadcastScope::All => true,
            BroadcastScope::Capability => filter.is_some_and(|f| {
                f.capabilities.iter().any(|c| self.capabilities.contains(c))
            }),
            BroadcastScope::Expertise => {
                filter.is_some_and(|f| f.expertise.iter().any(|e| self.expertise.contains(e)))
            }
        };

        let available = filter.map_or(true, |f| {
            f.availability.is_empty() || f.availability.contains(&self.availability)
        });

        in_scope && available
    }
}

/// Request awaiting its response
#[derive(Debug)]
pub struct PendingRequest {
    pub request: ProtocolMessage,
    pub timeout: Duration,
    pub created_at: DateTime<Utc>,
    response_sender: oneshot::Sender<Result<ProtocolMessage>>,
}

/// Handle to a registered request
///
/// The request is pending from the moment [`CommunicationProtocol::dispatch_request`]
/// returns, and its timer runs from then on whether or not anyone waits.
/// [`PendingResponse::wait`] suspends until the matching response arrives,
/// the timer fires or the request is cancelled. Dropping the handle without
/// waiting withdraws the request.
#[derive(Debug)]
pub struct PendingResponse {
    request_id: String,
    timeout: Duration,
    receiver: oneshot::Receiver<Result<ProtocolMessage>>,
    pending: Arc<DashMap<String, PendingRequest>>,
    settled: bool,
}

impl PendingResponse {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Wait for the response
    pub async fn wait(mut self) -> Result<ProtocolMessage> {
        trace!(
            "Waiting for response: request_id={}, timeout={:?}",
            self.request_id,
            self.timeout
        );
        let outcome = (&mut self.receiver).await;
        self.settled = true;

        match outcome {
            Ok(result) => result,
            Err(_) => {
                warn!("Request dropped without response: request_id={}", self.request_id);
                Err(Error::cancelled(format!("request {}", self.request_id)))
            }
        }
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        if !self.settled && self.pending.remove(&self.request_id).is_some() {
            debug!("Withdrew unawaited request: request_id={}", self.request_id);
        }
    }
}

/// Routes messages between agents
#[derive(Debug)]
pub struct CommunicationProtocol {
    pending_requests: Arc<DashMap<String, PendingRequest>>,
    subscribers: DashMap<String, BTreeSet<String>>,
    agents: DashMap<String, AgentProfile>,
    events: broadcast::Sender<ProtocolEvent>,
    default_timeout: Duration,
}

impl Default for CommunicationProtocol {
    fn default() -> Self {
        Self::new(&ProtocolSettings::default())
    }
}

impl CommunicationProtocol {
    pub fn new(settings: &ProtocolSettings) -> Self {
        let (events, _) = broadcast::channel(settings.event_channel_capacity.max(1));
        Self {
            pending_requests: Arc::new(DashMap::new()),
            subscribers: DashMap::new(),
            agents: DashMap::new(),
            events,
            default_timeout: settings.default_request_timeout(),
        }
    }

    /// Timeout applied to requests that carry none
    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Observe protocol events
    pub fn subscribe_events(&self) -> broadcast::Receiver<ProtocolEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: ProtocolEvent) {
        if self.events.send(event).is_err() {
            trace!("No protocol event listeners");
        }
    }

    /// Validate and dispatch a message by its pattern
    ///
    /// Returns the response for requests that expect one, the resolved
    /// response for responses, and the forwarded message for routed messages
    /// that have hops left.
    pub async fn send(&self, message: ProtocolMessage) -> Result<Option<ProtocolMessage>> {
        message.validate()?;
        debug!(
            "Sending {} message {} from {}",
            message.protocol.name(),
            message.message_id,
            message.from
        );

        match message.protocol {
            CommunicationPattern::RequestResponse { .. } => {
                if message.expects_response() {
                    let pending = self.dispatch_request(message)?;
                    pending.wait().await.map(Some)
                } else if message.kind == MessageKind::Response {
                    self.resolve_response(message).map(Some)
                } else {
                    self.emit(ProtocolEvent::DirectDelivered(message));
                    Ok(None)
                }
            }
            CommunicationPattern::PublishSubscribe { .. } => {
                self.deliver_published(message);
                Ok(None)
            }
            CommunicationPattern::Broadcast { .. } => {
                self.deliver_broadcast(message);
                Ok(None)
            }
            CommunicationPattern::Direct => {
                self.deliver_direct(message)?;
                Ok(None)
            }
            CommunicationPattern::Routed { .. } => Ok(self.forward_routed(message)),
        }
    }

    /// Register a request as pending without waiting for its response
    ///
    /// Starts the request timer, so it must be called within a Tokio runtime.
    pub fn dispatch_request(&self, message: ProtocolMessage) -> Result<PendingResponse> {
        message.validate()?;
        if !message.expects_response() {
            return Err(Error::validation(
                "Only requests that expect a response can be dispatched",
            ));
        }

        let (request_id, timeout) = match &message.protocol {
            CommunicationPattern::RequestResponse {
                request_id,
                timeout_ms,
                ..
            } => (
                request_id.clone(),
                timeout_ms
                    .map(Duration::from_millis)
                    .unwrap_or(self.default_timeout),
            ),
            _ => return Err(Error::validation("Request message must have a request id")),
        };

        let (tx, rx) = oneshot::channel();
        match self.pending_requests.entry(request_id.clone()) {
            Entry::Occupied(_) => {
                return Err(Error::validation(format!(
                    "Request {} is already pending",
                    request_id
                )));
            }
            Entry::Vacant(entry) => {
                trace!("Registering pending request: request_id={}", request_id);
                entry.insert(PendingRequest {
                    request: message.clone(),
                    timeout,
                    created_at: Utc::now(),
                    response_sender: tx,
                });
            }
        }

        self.spawn_expiry(&request_id, &message.message_id, timeout);
        self.emit(ProtocolEvent::RequestSent(message));

        Ok(PendingResponse {
            request_id,
            timeout,
            receiver: rx,
            pending: Arc::clone(&self.pending_requests),
            settled: false,
        })
    }

    /// Reject the request with a timeout once `timeout` has elapsed since registration
    fn spawn_expiry(&self, request_id: &str, message_id: &str, timeout: Duration) {
        let pending = Arc::clone(&self.pending_requests);
        let events = self.events.clone();
        let request_id = request_id.to_string();
        let message_id = message_id.to_string();

        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;

            // only expire the registration this timer was started for
            let Some((_, expired)) =
                pending.remove_if(&request_id, |_, p| p.request.message_id == message_id)
            else {
                return;
            };

            let timeout_ms = timeout.as_millis() as u64;
            warn!(
                "Request timeout for request_id={} after {}ms",
                request_id, timeout_ms
            );
            let _ = expired.response_sender.send(Err(Error::timeout(
                format!("request {}", request_id),
                timeout_ms,
            )));
            let _ = events.send(ProtocolEvent::RequestTimedOut {
                request_id,
                timeout_ms,
            });
        });
    }

    fn resolve_response(&self, message: ProtocolMessage) -> Result<ProtocolMessage> {
        let correlation_id = message
            .correlation_id
            .clone()
            .ok_or_else(|| Error::validation("Response message must have a correlation id"))?;

        let (_, pending) = self
            .pending_requests
            .remove(&correlation_id)
            .ok_or_else(|| Error::no_pending_request(&correlation_id))?;

        debug!("Resolved pending request: request_id={}", correlation_id);
        if pending.response_sender.send(Ok(message.clone())).is_err() {
            warn!("Failed to deliver response for request {}", correlation_id);
        }
        self.emit(ProtocolEvent::ResponseReceived(message.clone()));
        Ok(message)
    }

    /// Reject a pending request with a cancellation error
    pub fn cancel_request(&self, request_id: &str) -> bool {
        match self.pending_requests.remove(request_id) {
            Some((_, pending)) => {
                debug!("Cancelling request: request_id={}", request_id);
                let _ = pending
                    .response_sender
                    .send(Err(Error::cancelled(format!("request {}", request_id))));
                self.emit(ProtocolEvent::RequestCancelled {
                    request_id: request_id.to_string(),
                });
                true
            }
            None => false,
        }
    }

    /// Ids of requests still awaiting a response, sorted
    pub fn pending_requests(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .pending_requests
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn is_pending(&self, request_id: &str) -> bool {
        self.pending_requests.contains_key(request_id)
    }

    /// Add `agent` to a topic's subscribers
    pub fn subscribe(&self, agent: &str, topic: &str) {
        self.subscribers
            .entry(topic.to_string())
            .or_default()
            .insert(agent.to_string());
        debug!("Agent {} subscribed to {}", agent, topic);
        self.emit(ProtocolEvent::SubscriptionCreated {
            agent: agent.to_string(),
            topic: topic.to_string(),
        });
    }

    /// Remove `agent` from a topic; the topic disappears with its last subscriber
    pub fn unsubscribe(&self, agent: &str, topic: &str) -> bool {
        let removed = match self.subscribers.get_mut(topic) {
            Some(mut agents) => agents.remove(agent),
            None => return false,
        };
        self.subscribers.remove_if(topic, |_, agents| agents.is_empty());

        if removed {
            debug!("Agent {} unsubscribed from {}", agent, topic);
            self.emit(ProtocolEvent::SubscriptionRemoved {
                agent: agent.to_string(),
                topic: topic.to_string(),
            });
        }
        removed
    }

    /// Current subscribers of a topic, sorted
    pub fn subscribers(&self, topic: &str) -> Vec<String> {
        self.subscribers
            .get(topic)
            .map(|agents| agents.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Topics with at least one subscriber, sorted
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self
            .subscribers
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        topics.sort();
        topics
    }

    /// Add or replace an agent in the broadcast directory
    pub fn register_agent(&self, profile: AgentProfile) {
        debug!("Registered agent {} in directory", profile.agent_id);
        self.agents.insert(profile.agent_id.clone(), profile);
    }

    pub fn unregister_agent(&self, agent_id: &str) -> Option<AgentProfile> {
        self.agents.remove(agent_id).map(|(_, profile)| profile)
    }

    pub fn agent(&self, agent_id: &str) -> Option<AgentProfile> {
        self.agents.get(agent_id).map(|profile| profile.value().clone())
    }

    fn deliver_published(&self, message: ProtocolMessage) {
        if message.kind != MessageKind::Notification {
            trace!(
                "Ignoring non-notification publish {} ({:?})",
                message.message_id,
                message.kind
            );
            return;
        }
        let Some(topic) = message.topic().map(str::to_string) else {
            return;
        };

        let recipients = self.subscribers(&topic);
        for recipient in &recipients {
            let mut delivered = message.clone();
            delivered.to = Some(recipient.clone());
            self.emit(ProtocolEvent::Published {
                topic: topic.clone(),
                recipient: recipient.clone(),
                message: delivered,
            });
        }

        debug!("Published to {} subscriber(s) of {}", recipients.len(), topic);
        self.emit(ProtocolEvent::PublishCompleted {
            topic,
            subscribers: recipients,
        });
    }

    /// Directory agents a broadcast from `sender` reaches, sorted
    pub fn broadcast_recipients(
        &self,
        sender: &str,
        scope: BroadcastScope,
        filter: Option<&BroadcastFilter>,
    ) -> Vec<String> {
        let mut recipients: Vec<String> = self
            .agents
            .iter()
            .filter(|entry| entry.key() != sender && entry.value().matches(scope, filter))
            .map(|entry| entry.key().clone())
            .collect();
        recipients.sort();
        recipients
    }

    fn deliver_broadcast(&self, message: ProtocolMessage) {
        let recipients = match &message.protocol {
            CommunicationPattern::Broadcast { scope, filter } => {
                self.broadcast_recipients(&message.from, *scope, filter.as_ref())
            }
            _ => Vec::new(),
        };
        debug!(
            "Broadcast {} reaches {} agent(s)",
            message.message_id,
            recipients.len()
        );
        self.emit(ProtocolEvent::Broadcast {
            message,
            recipients,
        });
    }

    fn deliver_direct(&self, message: ProtocolMessage) -> Result<()> {
        match message.to.as_deref() {
            Some(to) if to != BROADCAST_RECIPIENT => {
                self.emit(ProtocolEvent::DirectDelivered(message));
                Ok(())
            }
            _ => Err(Error::validation(
                "Direct message must have a specific target",
            )),
        }
    }

    fn forward_routed(&self, message: ProtocolMessage) -> Option<ProtocolMessage> {
        let CommunicationPattern::Routed { route, current_hop } = &message.protocol else {
            return None;
        };

        if *current_hop >= route.len() {
            debug!("Routed message {} arrived", message.message_id);
            self.emit(ProtocolEvent::RoutedArrived(message));
            return None;
        }

        let mut forwarded = message.clone();
        forwarded.to = Some(route[*current_hop].clone());
        forwarded.protocol = CommunicationPattern::Routed {
            route: route.clone(),
            current_hop: current_hop + 1,
        };
        trace!(
            "Forwarding routed message {} to {}",
            forwarded.message_id,
            route[*current_hop]
        );
        self.emit(ProtocolEvent::RoutedForwarded(forwarded.clone()));
        Some(forwarded)
    }
}
