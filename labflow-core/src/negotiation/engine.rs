//! Negotiation engine
//!
//! The engine owns the negotiation table and drives each negotiation through
//! its state machine. Proposals travel over the [`CommunicationProtocol`] as
//! timed requests; the engine awaits each one on a background task and turns
//! the recipient's answer (or the timeout) into a state change.

use super::models::{
    negotiation_topic, ConflictResolutionTerms, Negotiation, NegotiationAction,
    NegotiationOptions, NegotiationStatus, NegotiationType, Proposal, ProposalOptions,
    ResourceAllocationTerms, TaskAssignmentTerms,
};
use crate::config::NegotiationSettings;
use crate::message::ProtocolMessage;
use crate::protocol::{CommunicationProtocol, PendingResponse};
use crate::{Error, Result};
use dashmap::DashMap;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, trace, warn};

/// Sender id used for negotiation notifications
pub const NEGOTIATION_SYSTEM_AGENT: &str = "negotiation_system";

/// Typed negotiation events
#[derive(Debug, Clone, PartialEq)]
pub enum NegotiationEvent {
    Initiated(Negotiation),
    ProposalSent(Proposal),
    Countered {
        negotiation: Negotiation,
        proposal: Proposal,
    },
    Accepted {
        negotiation: Negotiation,
        proposal: Proposal,
        agent: String,
    },
    Rejected {
        negotiation: Negotiation,
        proposal: Proposal,
        agent: String,
        reason: Option<String>,
    },
    TimedOut {
        negotiation: Negotiation,
        proposal: Proposal,
    },
    Cancelled {
        negotiation: Negotiation,
        agent: String,
    },
}

impl NegotiationEvent {
    pub fn negotiation_id(&self) -> &str {
        match self {
            NegotiationEvent::Initiated(negotiation) => &negotiation.negotiation_id,
            NegotiationEvent::ProposalSent(proposal) => &proposal.negotiation_id,
            NegotiationEvent::Countered { negotiation, .. }
            | NegotiationEvent::Accepted { negotiation, .. }
            | NegotiationEvent::Rejected { negotiation, .. }
            | NegotiationEvent::TimedOut { negotiation, .. }
            | NegotiationEvent::Cancelled { negotiation, .. } => &negotiation.negotiation_id,
        }
    }
}

/// Proposal request that has not been answered yet
#[derive(Debug, Clone)]
struct OutstandingProposal {
    negotiation_id: String,
    request: ProtocolMessage,
}

/// Drives negotiations over the communication protocol
///
/// Cloning the engine yields another handle to the same negotiation table.
#[derive(Debug, Clone)]
pub struct NegotiationEngine {
    protocol: Arc<CommunicationProtocol>,
    negotiations: Arc<RwLock<HashMap<String, Negotiation>>>,
    outstanding: Arc<DashMap<String, OutstandingProposal>>,
    events: broadcast::Sender<NegotiationEvent>,
    settings: NegotiationSettings,
}

impl NegotiationEngine {
    pub fn new(protocol: Arc<CommunicationProtocol>, settings: NegotiationSettings) -> Self {
        let (events, _) = broadcast::channel(settings.event_channel_capacity.max(1));
        Self {
            protocol,
            negotiations: Arc::new(RwLock::new(HashMap::new())),
            outstanding: Arc::new(DashMap::new()),
            events,
            settings,
        }
    }

    pub fn protocol(&self) -> &Arc<CommunicationProtocol> {
        &self.protocol
    }

    /// Observe negotiation events
    pub fn subscribe_events(&self) -> broadcast::Receiver<NegotiationEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: NegotiationEvent) {
        if self.events.send(event).is_err() {
            trace!("No negotiation event listeners");
        }
    }

    /// Start a negotiation and send the first proposal to `participants[0]`
    pub async fn initiate_negotiation(
        &self,
        negotiation_type: NegotiationType,
        initiator: &str,
        participants: Vec<String>,
        terms: Value,
        options: NegotiationOptions,
    ) -> Result<Negotiation> {
        if initiator.trim().is_empty() {
            return Err(Error::validation("Negotiation must have an initiator"));
        }
        let recipient = match participants.first() {
            Some(first) if !first.trim().is_empty() => first.clone(),
            _ => {
                return Err(Error::validation(
                    "Negotiation needs at least one participant besides the initiator",
                ))
            }
        };

        let mut negotiation = Negotiation::new(negotiation_type, initiator, participants, &options);
        let proposal = Proposal::new(
            &negotiation.negotiation_id,
            initiator,
            recipient,
            negotiation_type,
            terms,
            &options.proposal,
            self.settings.default_proposal_priority,
        );
        negotiation.push_proposal(proposal.clone());
        negotiation.transition_to(NegotiationStatus::Proposed)?;
        negotiation.record(
            NegotiationAction::Proposed,
            initiator,
            Some(json!({ "proposal_id": proposal.proposal_id })),
        );

        let topic = negotiation.topic();
        for participant in &negotiation.participants {
            self.protocol.subscribe(participant, &topic);
        }

        let negotiation_id = negotiation.negotiation_id.clone();
        self.negotiations
            .write()
            .await
            .insert(negotiation_id.clone(), negotiation.clone());

        if let Err(e) = self.send_proposal(&proposal) {
            warn!(
                "Failed to send initial proposal for negotiation {}: {}",
                negotiation_id, e
            );
            self.negotiations.write().await.remove(&negotiation_id);
            for participant in &negotiation.participants {
                self.protocol.unsubscribe(participant, &topic);
            }
            return Err(e);
        }

        info!(
            "Initiated {:?} negotiation {} between {:?}",
            negotiation_type, negotiation_id, negotiation.participants
        );
        self.emit(NegotiationEvent::Initiated(negotiation.clone()));
        Ok(negotiation)
    }

    /// Dispatch a proposal as a timed request and await it in the background
    fn send_proposal(&self, proposal: &Proposal) -> Result<()> {
        let timeout = proposal.response_timeout(self.settings.proposal_timeout());
        let request = ProtocolMessage::request(
            &proposal.from,
            &proposal.to,
            json!({
                "type": "negotiation_proposal",
                "negotiation_id": proposal.negotiation_id,
                "proposal": proposal,
            }),
        )
        .with_timeout(timeout.as_millis() as u64)
        .with_priority(proposal.message_priority());

        let pending = self.protocol.dispatch_request(request.clone())?;
        self.outstanding.insert(
            proposal.proposal_id.clone(),
            OutstandingProposal {
                negotiation_id: proposal.negotiation_id.clone(),
                request,
            },
        );
        debug!(
            "Sent proposal {} from {} to {} (timeout {:?})",
            proposal.proposal_id, proposal.from, proposal.to, timeout
        );
        self.emit(NegotiationEvent::ProposalSent(proposal.clone()));

        let engine = self.clone();
        let proposal = proposal.clone();
        tokio::spawn(async move {
            engine.await_proposal_response(proposal, pending).await;
        });
        Ok(())
    }

    async fn await_proposal_response(&self, proposal: Proposal, pending: PendingResponse) {
        let outcome = pending.wait().await;
        self.outstanding.remove(&proposal.proposal_id);

        match outcome {
            Ok(response) => self.apply_proposal_response(&proposal, &response).await,
            Err(e) if e.is_timeout() => self.expire_proposal(&proposal).await,
            Err(e) => debug!("Proposal {} request ended: {}", proposal.proposal_id, e),
        }
    }

    /// Turn a recipient's answer into the matching operation
    async fn apply_proposal_response(&self, proposal: &Proposal, response: &ProtocolMessage) {
        let result = response.response_result().cloned().unwrap_or(Value::Null);
        let action = result.get("action").and_then(Value::as_str);
        let responder = response.from.as_str();

        let outcome = match action {
            Some("accept") => self
                .accept_proposal(&proposal.negotiation_id, &proposal.proposal_id, responder)
                .await
                .map(|_| ()),
            Some("reject") => {
                let reason = result
                    .get("reason")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                self.reject_proposal(
                    &proposal.negotiation_id,
                    &proposal.proposal_id,
                    responder,
                    reason,
                )
                .await
                .map(|_| ())
            }
            Some("counter") => {
                let terms = result.get("terms").cloned().unwrap_or(Value::Null);
                let options = ProposalOptions {
                    priority: result
                        .get("priority")
                        .and_then(Value::as_u64)
                        .map(|p| p.min(100) as u8),
                    expires_at: None,
                };
                self.counter_proposal(
                    &proposal.negotiation_id,
                    &proposal.proposal_id,
                    responder,
                    &proposal.from,
                    terms,
                    options,
                )
                .await
                .map(|_| ())
            }
            Some("acknowledged") => Ok(()),
            _ if !response.response_success() => self
                .reject_proposal(
                    &proposal.negotiation_id,
                    &proposal.proposal_id,
                    responder,
                    Some("declined".to_string()),
                )
                .await
                .map(|_| ()),
            other => {
                trace!(
                    "Ignoring proposal {} response without action ({:?})",
                    proposal.proposal_id,
                    other
                );
                Ok(())
            }
        };

        if let Err(e) = outcome {
            warn!(
                "Could not apply response to proposal {}: {}",
                proposal.proposal_id, e
            );
        }
    }

    /// Move an open negotiation to `timeout` if `proposal` is still current
    async fn expire_proposal(&self, proposal: &Proposal) {
        let snapshot = {
            let mut negotiations = self.negotiations.write().await;
            let Some(negotiation) = negotiations.get_mut(&proposal.negotiation_id) else {
                return;
            };
            if negotiation.status.is_terminal()
                || !negotiation.is_current_proposal(&proposal.proposal_id)
            {
                return;
            }
            if negotiation.transition_to(NegotiationStatus::Timeout).is_err() {
                return;
            }
            negotiation.record(
                NegotiationAction::TimedOut,
                &proposal.to,
                Some(json!({ "proposal_id": proposal.proposal_id })),
            );
            negotiation.clone()
        };

        info!(
            "Negotiation {} timed out waiting on {}",
            snapshot.negotiation_id, proposal.to
        );
        self.notify_participants(
            &snapshot,
            NegotiationAction::TimedOut,
            json!({ "proposal_id": proposal.proposal_id }),
        )
        .await;
        self.emit(NegotiationEvent::TimedOut {
            negotiation: snapshot,
            proposal: proposal.clone(),
        });
    }

    /// Accept the current proposal; only its recipient may do so
    pub async fn accept_proposal(
        &self,
        negotiation_id: &str,
        proposal_id: &str,
        agent: &str,
    ) -> Result<Negotiation> {
        let (snapshot, proposal) = {
            let mut negotiations = self.negotiations.write().await;
            let negotiation = negotiations
                .get_mut(negotiation_id)
                .ok_or_else(|| Error::not_found("Negotiation", negotiation_id))?;
            negotiation.ensure_open()?;

            let proposal = negotiation
                .find_proposal(proposal_id)
                .cloned()
                .ok_or_else(|| Error::not_found("Proposal", proposal_id))?;
            if proposal.to != agent {
                return Err(Error::permission_denied(
                    "accept proposal",
                    format!("agent {} is not the recipient of proposal {}", agent, proposal_id),
                ));
            }
            if !negotiation.is_current_proposal(proposal_id) {
                return Err(Error::state_transition(format!(
                    "Proposal {} has been superseded",
                    proposal_id
                )));
            }
            if proposal.is_expired() {
                return Err(Error::state_transition(format!(
                    "Proposal {} has expired",
                    proposal_id
                )));
            }

            negotiation.transition_to(NegotiationStatus::Accepted)?;
            negotiation.accepted_proposal = Some(proposal.clone());
            negotiation.record(
                NegotiationAction::Accepted,
                agent,
                Some(json!({ "proposal_id": proposal_id })),
            );
            (negotiation.clone(), proposal)
        };

        info!("Negotiation {} accepted by {}", negotiation_id, agent);
        self.settle_outstanding(negotiation_id, NegotiationStatus::Accepted)
            .await;
        self.notify_participants(
            &snapshot,
            NegotiationAction::Accepted,
            json!({ "proposal_id": proposal_id, "agent": agent }),
        )
        .await;
        self.emit(NegotiationEvent::Accepted {
            negotiation: snapshot.clone(),
            proposal,
            agent: agent.to_string(),
        });
        Ok(snapshot)
    }

    /// Reject a proposal; any participant may do so
    pub async fn reject_proposal(
        &self,
        negotiation_id: &str,
        proposal_id: &str,
        agent: &str,
        reason: Option<String>,
    ) -> Result<Negotiation> {
        let (snapshot, proposal) = {
            let mut negotiations = self.negotiations.write().await;
            let negotiation = negotiations
                .get_mut(negotiation_id)
                .ok_or_else(|| Error::not_found("Negotiation", negotiation_id))?;
            negotiation.ensure_open()?;

            let proposal = negotiation
                .find_proposal(proposal_id)
                .cloned()
                .ok_or_else(|| Error::not_found("Proposal", proposal_id))?;
            if !negotiation.is_participant(agent) {
                return Err(Error::permission_denied(
                    "reject proposal",
                    format!("agent {} is not a participant", agent),
                ));
            }

            negotiation.transition_to(NegotiationStatus::Rejected)?;
            negotiation.record(
                NegotiationAction::Rejected,
                agent,
                Some(json!({ "proposal_id": proposal_id, "reason": reason })),
            );
            (negotiation.clone(), proposal)
        };

        info!("Negotiation {} rejected by {}", negotiation_id, agent);
        self.settle_outstanding(negotiation_id, NegotiationStatus::Rejected)
            .await;
        self.notify_participants(
            &snapshot,
            NegotiationAction::Rejected,
            json!({ "proposal_id": proposal_id, "agent": agent, "reason": reason }),
        )
        .await;
        self.emit(NegotiationEvent::Rejected {
            negotiation: snapshot.clone(),
            proposal,
            agent: agent.to_string(),
            reason,
        });
        Ok(snapshot)
    }

    /// Answer a proposal with new terms, which become the current proposal
    pub async fn counter_proposal(
        &self,
        negotiation_id: &str,
        original_proposal_id: &str,
        from: &str,
        to: &str,
        terms: Value,
        options: ProposalOptions,
    ) -> Result<Proposal> {
        let (snapshot, counter) = {
            let mut negotiations = self.negotiations.write().await;
            let negotiation = negotiations
                .get_mut(negotiation_id)
                .ok_or_else(|| Error::not_found("Negotiation", negotiation_id))?;
            negotiation.ensure_open()?;

            if negotiation.find_proposal(original_proposal_id).is_none() {
                return Err(Error::not_found("Proposal", original_proposal_id));
            }
            for agent in [from, to] {
                if !negotiation.is_participant(agent) {
                    return Err(Error::permission_denied(
                        "counter proposal",
                        format!("agent {} is not a participant", agent),
                    ));
                }
            }
            if from == to {
                return Err(Error::validation(
                    "A counter proposal must be addressed to another participant",
                ));
            }

            let counter = Proposal::new(
                negotiation_id,
                from,
                to,
                negotiation.negotiation_type,
                terms,
                &options,
                self.settings.default_proposal_priority,
            );
            negotiation.transition_to(NegotiationStatus::Countered)?;
            negotiation.push_proposal(counter.clone());
            negotiation.record(
                NegotiationAction::Countered,
                from,
                Some(json!({
                    "original_proposal_id": original_proposal_id,
                    "counter_proposal_id": counter.proposal_id,
                })),
            );
            (negotiation.clone(), counter)
        };

        debug!(
            "Negotiation {} countered by {} with {}",
            negotiation_id, from, counter.proposal_id
        );
        self.settle_outstanding(negotiation_id, NegotiationStatus::Countered)
            .await;
        self.send_proposal(&counter)?;
        self.notify_participants(
            &snapshot,
            NegotiationAction::Countered,
            json!({
                "original_proposal_id": original_proposal_id,
                "counter_proposal_id": counter.proposal_id,
                "agent": from,
            }),
        )
        .await;
        self.emit(NegotiationEvent::Countered {
            negotiation: snapshot,
            proposal: counter.clone(),
        });
        Ok(counter)
    }

    /// Abandon a negotiation; only the initiator may do so
    pub async fn cancel_negotiation(
        &self,
        negotiation_id: &str,
        agent: &str,
    ) -> Result<Negotiation> {
        let snapshot = {
            let mut negotiations = self.negotiations.write().await;
            let negotiation = negotiations
                .get_mut(negotiation_id)
                .ok_or_else(|| Error::not_found("Negotiation", negotiation_id))?;
            negotiation.ensure_open()?;

            if negotiation.initiator != agent {
                return Err(Error::permission_denied(
                    "cancel negotiation",
                    format!("agent {} did not initiate {}", agent, negotiation_id),
                ));
            }

            negotiation.transition_to(NegotiationStatus::Cancelled)?;
            negotiation.record(NegotiationAction::Cancelled, agent, None);
            negotiation.clone()
        };

        info!("Negotiation {} cancelled by {}", negotiation_id, agent);
        self.settle_outstanding(negotiation_id, NegotiationStatus::Cancelled)
            .await;
        self.notify_participants(
            &snapshot,
            NegotiationAction::Cancelled,
            json!({ "agent": agent }),
        )
        .await;
        self.emit(NegotiationEvent::Cancelled {
            negotiation: snapshot.clone(),
            agent: agent.to_string(),
        });
        Ok(snapshot)
    }

    /// Answer every open proposal request of a negotiation so none stays pending
    async fn settle_outstanding(&self, negotiation_id: &str, status: NegotiationStatus) {
        let proposal_ids: Vec<String> = self
            .outstanding
            .iter()
            .filter(|entry| entry.value().negotiation_id == negotiation_id)
            .map(|entry| entry.key().clone())
            .collect();

        for proposal_id in proposal_ids {
            let Some((_, outstanding)) = self.outstanding.remove(&proposal_id) else {
                continue;
            };
            let ack = match ProtocolMessage::response(
                &outstanding.request,
                json!({ "action": "acknowledged", "status": status }),
                true,
            ) {
                Ok(ack) => ack,
                Err(e) => {
                    warn!("Could not build acknowledgement for {}: {}", proposal_id, e);
                    continue;
                }
            };
            if let Err(e) = self.protocol.send(ack).await {
                debug!("Proposal {} already settled: {}", proposal_id, e);
            }
        }
    }

    async fn notify_participants(
        &self,
        negotiation: &Negotiation,
        action: NegotiationAction,
        details: Value,
    ) {
        let message = ProtocolMessage::publish(
            NEGOTIATION_SYSTEM_AGENT,
            negotiation_topic(&negotiation.negotiation_id),
            json!({
                "action": action.as_str(),
                "negotiation_id": negotiation.negotiation_id,
                "status": negotiation.status,
                "details": details,
            }),
        );
        if let Err(e) = self.protocol.send(message).await {
            warn!(
                "Failed to notify participants of negotiation {}: {}",
                negotiation.negotiation_id, e
            );
        }
    }

    pub async fn get_negotiation(&self, negotiation_id: &str) -> Option<Negotiation> {
        self.negotiations.read().await.get(negotiation_id).cloned()
    }

    /// Negotiations that have not reached a terminal status, oldest first
    pub async fn active_negotiations(&self) -> Vec<Negotiation> {
        self.collect_negotiations(|n| n.status.is_active()).await
    }

    /// Negotiations `agent` takes part in, oldest first
    pub async fn negotiations_for_agent(&self, agent: &str) -> Vec<Negotiation> {
        self.collect_negotiations(|n| n.is_participant(agent)).await
    }

    async fn collect_negotiations<F>(&self, predicate: F) -> Vec<Negotiation>
    where
        F: Fn(&Negotiation) -> bool,
    {
        let mut found: Vec<Negotiation> = self
            .negotiations
            .read()
            .await
            .values()
            .filter(|n| predicate(n))
            .cloned()
            .collect();
        found.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.negotiation_id.cmp(&b.negotiation_id))
        });
        found
    }

    /// Offer a task to candidate agents; the first candidate receives the proposal
    pub async fn negotiate_task_assignment(
        &self,
        terms: TaskAssignmentTerms,
        candidates: Vec<String>,
        initiator: &str,
    ) -> Result<Negotiation> {
        let priority = terms.priority;
        self.initiate_negotiation(
            NegotiationType::TaskAssignment,
            initiator,
            candidates,
            serde_json::to_value(&terms)?,
            NegotiationOptions {
                proposal: ProposalOptions {
                    priority: Some(priority),
                    expires_at: None,
                },
                ..Default::default()
            },
        )
        .await
    }

    pub async fn negotiate_resource_allocation(
        &self,
        terms: ResourceAllocationTerms,
        participants: Vec<String>,
        initiator: &str,
    ) -> Result<Negotiation> {
        let priority = terms.priority;
        self.initiate_negotiation(
            NegotiationType::ResourceAllocation,
            initiator,
            participants,
            serde_json::to_value(&terms)?,
            NegotiationOptions {
                proposal: ProposalOptions {
                    priority: Some(priority),
                    expires_at: None,
                },
                ..Default::default()
            },
        )
        .await
    }

    /// Negotiate a conflict resolution and wait for the outcome
    ///
    /// The first participant initiates and proposes to the second. Returns the
    /// terms of the accepted proposal, which may be a counter proposal.
    pub async fn resolve_conflict(
        &self,
        terms: ConflictResolutionTerms,
        participants: Vec<String>,
    ) -> Result<ConflictResolutionTerms> {
        let Some((initiator, others)) = participants.split_first() else {
            return Err(Error::validation(
                "Conflict resolution needs at least two participants",
            ));
        };

        let mut events = self.subscribe_events();
        let negotiation = self
            .initiate_negotiation(
                NegotiationType::ConflictResolution,
                initiator,
                others.to_vec(),
                serde_json::to_value(&terms)?,
                NegotiationOptions::default(),
            )
            .await?;
        let negotiation_id = negotiation.negotiation_id;

        loop {
            match events.recv().await {
                Ok(event) if event.negotiation_id() == negotiation_id => match event {
                    NegotiationEvent::Accepted { proposal, .. } => {
                        return Ok(serde_json::from_value(proposal.terms)?);
                    }
                    NegotiationEvent::Rejected { negotiation, .. }
                    | NegotiationEvent::TimedOut { negotiation, .. }
                    | NegotiationEvent::Cancelled { negotiation, .. } => {
                        return Err(Error::NegotiationFailed {
                            negotiation_id,
                            status: negotiation.status.to_string(),
                        });
                    }
                    _ => {}
                },
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!("Conflict resolution listener skipped {} events", skipped);
                    if let Some(current) = self.get_negotiation(&negotiation_id).await {
                        if let Some(result) = Self::conflict_outcome(&current) {
                            return result;
                        }
                    }
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(Error::Internal(
                        "Negotiation event channel closed".to_string(),
                    ));
                }
            }
        }
    }

    fn conflict_outcome(negotiation: &Negotiation) -> Option<Result<ConflictResolutionTerms>> {
        match negotiation.status {
            NegotiationStatus::Accepted => {
                let terms = negotiation
                    .accepted_proposal
                    .as_ref()
                    .map(|p| p.terms.clone())
                    .unwrap_or(Value::Null);
                Some(serde_json::from_value(terms).map_err(Error::from))
            }
            status if status.is_terminal() => Some(Err(Error::NegotiationFailed {
                negotiation_id: negotiation.negotiation_id.clone(),
                status: status.to_string(),
            })),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ProtocolEvent;
    use assert_matches::assert_matches;
    use std::time::Duration;

    fn engine_with(settings: NegotiationSettings) -> NegotiationEngine {
        NegotiationEngine::new(Arc::new(CommunicationProtocol::default()), settings)
    }

    fn engine() -> NegotiationEngine {
        engine_with(NegotiationSettings::default())
    }

    async fn start(engine: &NegotiationEngine) -> Negotiation {
        engine
            .initiate_negotiation(
                NegotiationType::TaskAssignment,
                "planner",
                vec!["writer".into(), "reviewer".into()],
                json!({ "task_id": "t1" }),
                NegotiationOptions::default(),
            )
            .await
            .unwrap()
    }

    /// Answers the first negotiation proposal request with `result`
    fn spawn_proposal_responder(
        protocol: &Arc<CommunicationProtocol>,
        result: Value,
    ) -> tokio::task::JoinHandle<()> {
        let mut events = protocol.subscribe_events();
        let protocol = Arc::clone(protocol);
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                if let ProtocolEvent::RequestSent(request) = event {
                    if request.content["type"] == json!("negotiation_proposal") {
                        let response = ProtocolMessage::response(&request, result, true).unwrap();
                        protocol.send(response).await.unwrap();
                        break;
                    }
                }
            }
        })
    }

    #[tokio::test]
    async fn test_initiate_sends_pending_proposal() {
        let engine = engine();
        let negotiation = start(&engine).await;

        assert_eq!(negotiation.status, NegotiationStatus::Proposed);
        assert_eq!(negotiation.proposals.len(), 1);
        let proposal = negotiation.current_proposal.clone().unwrap();
        assert_eq!(proposal.from, "planner");
        assert_eq!(proposal.to, "writer");
        assert_eq!(proposal.priority, 50);

        assert_eq!(engine.protocol().pending_requests().len(), 1);
        assert_eq!(
            engine.protocol().subscribers(&negotiation.topic()),
            vec!["planner", "reviewer", "writer"]
        );
        assert_eq!(engine.active_negotiations().await.len(), 1);
    }

    #[tokio::test]
    async fn test_initiate_requires_participants() {
        let engine = engine();
        let err = engine
            .initiate_negotiation(
                NegotiationType::Priority,
                "planner",
                vec![],
                json!({}),
                NegotiationOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(err.is_validation());
    }

    #[tokio::test]
    async fn test_accept_by_recipient() {
        let engine = engine();
        let negotiation = start(&engine).await;
        let proposal_id = negotiation.proposals[0].proposal_id.clone();

        let accepted = engine
            .accept_proposal(&negotiation.negotiation_id, &proposal_id, "writer")
            .await
            .unwrap();

        assert_eq!(accepted.status, NegotiationStatus::Accepted);
        assert_eq!(
            accepted.accepted_proposal.as_ref().map(|p| p.proposal_id.as_str()),
            Some(proposal_id.as_str())
        );
        assert_eq!(
            accepted.history.last().map(|h| h.action),
            Some(NegotiationAction::Accepted)
        );
        assert!(engine.protocol().pending_requests().is_empty());
        assert!(engine.active_negotiations().await.is_empty());
    }

    #[tokio::test]
    async fn test_expired_proposal_cannot_be_accepted() {
        let engine = engine();
        let options = NegotiationOptions {
            proposal: ProposalOptions {
                expires_at: Some(chrono::Utc::now() + chrono::Duration::milliseconds(40)),
                ..Default::default()
            },
            ..Default::default()
        };
        let negotiation = engine
            .initiate_negotiation(
                NegotiationType::TaskAssignment,
                "planner",
                vec!["writer".into()],
                json!({ "task_id": "t1" }),
                options,
            )
            .await
            .unwrap();
        let proposal_id = negotiation.proposals[0].proposal_id.clone();

        // block without yielding so the deadline passes before the timeout is handled
        std::thread::sleep(Duration::from_millis(60));

        let err = engine
            .accept_proposal(&negotiation.negotiation_id, &proposal_id, "writer")
            .await
            .unwrap_err();
        assert_matches!(err, Error::StateTransition { ref message } if message.contains("expired"));
    }

    #[tokio::test]
    async fn test_accept_by_non_recipient_is_denied() {
        let engine = engine();
        let negotiation = start(&engine).await;
        let proposal_id = negotiation.proposals[0].proposal_id.clone();

        let err = engine
            .accept_proposal(&negotiation.negotiation_id, &proposal_id, "reviewer")
            .await
            .unwrap_err();
        assert_matches!(err, Error::PermissionDenied { .. });

        let current = engine
            .get_negotiation(&negotiation.negotiation_id)
            .await
            .unwrap();
        assert_eq!(current.status, NegotiationStatus::Proposed);
        assert!(current.accepted_proposal.is_none());
    }

    #[tokio::test]
    async fn test_counter_then_accept() {
        let engine = engine();
        let negotiation = start(&engine).await;
        let original = negotiation.proposals[0].proposal_id.clone();

        let counter = engine
            .counter_proposal(
                &negotiation.negotiation_id,
                &original,
                "writer",
                "planner",
                json!({ "task_id": "t1", "deadline_days": 3 }),
                ProposalOptions::default(),
            )
            .await
            .unwrap();

        let current = engine
            .get_negotiation(&negotiation.negotiation_id)
            .await
            .unwrap();
        assert_eq!(current.status, NegotiationStatus::Countered);
        assert_eq!(current.proposals.len(), 2);
        assert_eq!(engine.protocol().pending_requests().len(), 1);

        // The superseded proposal can no longer be accepted
        assert!(engine
            .accept_proposal(&negotiation.negotiation_id, &original, "writer")
            .await
            .is_err());

        let accepted = engine
            .accept_proposal(&negotiation.negotiation_id, &counter.proposal_id, "planner")
            .await
            .unwrap();
        assert_eq!(accepted.accepted_proposal.unwrap().terms["deadline_days"], json!(3));
    }

    #[tokio::test]
    async fn test_terminal_negotiation_refuses_changes() {
        let engine = engine();
        let negotiation = start(&engine).await;
        let proposal_id = negotiation.proposals[0].proposal_id.clone();

        engine
            .reject_proposal(
                &negotiation.negotiation_id,
                &proposal_id,
                "reviewer",
                Some("busy".into()),
            )
            .await
            .unwrap();

        let err = engine
            .counter_proposal(
                &negotiation.negotiation_id,
                &proposal_id,
                "writer",
                "planner",
                json!({}),
                ProposalOptions::default(),
            )
            .await
            .unwrap_err();
        assert_matches!(err, Error::StateTransition { .. });

        let err = engine
            .accept_proposal(&negotiation.negotiation_id, &proposal_id, "writer")
            .await
            .unwrap_err();
        assert_matches!(err, Error::StateTransition { .. });
    }

    #[tokio::test]
    async fn test_cancel_requires_initiator() {
        let engine = engine();
        let negotiation = start(&engine).await;

        assert_matches!(
            engine
                .cancel_negotiation(&negotiation.negotiation_id, "writer")
                .await,
            Err(Error::PermissionDenied { .. })
        );

        let cancelled = engine
            .cancel_negotiation(&negotiation.negotiation_id, "planner")
            .await
            .unwrap();
        assert_eq!(cancelled.status, NegotiationStatus::Cancelled);
        assert!(engine.protocol().pending_requests().is_empty());
    }

    #[tokio::test]
    async fn test_unanswered_proposal_times_out() {
        let engine = engine_with(NegotiationSettings {
            proposal_timeout_ms: 50,
            ..Default::default()
        });
        let mut events = engine.subscribe_events();
        let negotiation = start(&engine).await;

        let timed_out = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Ok(NegotiationEvent::TimedOut { negotiation, .. }) = events.recv().await {
                    return negotiation;
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(timed_out.negotiation_id, negotiation.negotiation_id);
        assert_eq!(timed_out.status, NegotiationStatus::Timeout);
        assert!(engine.protocol().pending_requests().is_empty());
    }

    #[tokio::test]
    async fn test_protocol_response_applies_accept() {
        let engine = engine();
        let responder = spawn_proposal_responder(engine.protocol(), json!({ "action": "accept" }));
        let mut events = engine.subscribe_events();

        let negotiation = start(&engine).await;
        let agent = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Ok(NegotiationEvent::Accepted { agent, .. }) = events.recv().await {
                    return agent;
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(agent, "writer");
        let current = engine
            .get_negotiation(&negotiation.negotiation_id)
            .await
            .unwrap();
        assert_eq!(current.status, NegotiationStatus::Accepted);
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_state_changes_are_published_on_topic() {
        let engine = engine();
        let mut protocol_events = engine.protocol().subscribe_events();
        let negotiation = start(&engine).await;
        let proposal_id = negotiation.proposals[0].proposal_id.clone();

        engine
            .accept_proposal(&negotiation.negotiation_id, &proposal_id, "writer")
            .await
            .unwrap();

        let mut notified = Vec::new();
        while let Ok(event) = protocol_events.try_recv() {
            if let ProtocolEvent::Published {
                topic,
                recipient,
                message,
            } = event
            {
                assert_eq!(topic, negotiation.topic());
                assert_eq!(message.from, NEGOTIATION_SYSTEM_AGENT);
                assert_eq!(message.content["action"], json!("accepted"));
                notified.push(recipient);
            }
        }
        notified.sort();
        assert_eq!(notified, vec!["planner", "reviewer", "writer"]);
    }

    #[tokio::test]
    async fn test_resolve_conflict_returns_accepted_terms() {
        let engine = engine();
        let responder = spawn_proposal_responder(engine.protocol(), json!({ "action": "accept" }));
        let terms = ConflictResolutionTerms {
            conflict_id: "c1".into(),
            conflict_description: "Two agents edited the same section".into(),
            proposed_solution: "Keep the reviewer's version".into(),
            alternatives: vec!["Merge both".into()],
            rationale: "Initial proposed solution".into(),
        };

        let resolved = tokio::time::timeout(
            Duration::from_secs(2),
            engine.resolve_conflict(terms.clone(), vec!["writer".into(), "reviewer".into()]),
        )
        .await
        .unwrap()
        .unwrap();

        assert_eq!(resolved, terms);
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_resolve_conflict_reports_rejection() {
        let engine = engine();
        let _responder = spawn_proposal_responder(
            engine.protocol(),
            json!({ "action": "reject", "reason": "no" }),
        );
        let terms = ConflictResolutionTerms {
            conflict_id: "c2".into(),
            conflict_description: "Resource contention".into(),
            proposed_solution: "Split the GPU time".into(),
            alternatives: vec![],
            rationale: String::new(),
        };

        let err = tokio::time::timeout(
            Duration::from_secs(2),
            engine.resolve_conflict(terms, vec!["writer".into(), "reviewer".into()]),
        )
        .await
        .unwrap()
        .unwrap_err();
        assert_matches!(err, Error::NegotiationFailed { status, .. } if status == "rejected");
    }

    #[tokio::test]
    async fn test_task_assignment_helper() {
        let engine = engine();
        let terms = TaskAssignmentTerms {
            task_id: "t9".into(),
            task_description: "Generate figures".into(),
            required_capabilities: vec!["plotting".into()],
            estimated_duration_minutes: 30,
            priority: 80,
            compensation: None,
        };

        let negotiation = engine
            .negotiate_task_assignment(terms, vec!["figure_agent".into()], "planner")
            .await
            .unwrap();

        assert_eq!(negotiation.negotiation_type, NegotiationType::TaskAssignment);
        let proposal = negotiation.current_proposal.unwrap();
        assert_eq!(proposal.priority, 80);
        assert_eq!(proposal.terms["task_id"], json!("t9"));
        assert_eq!(engine.negotiations_for_agent("figure_agent").await.len(), 1);
        assert!(engine.negotiations_for_agent("nobody").await.is_empty());
    }
}
