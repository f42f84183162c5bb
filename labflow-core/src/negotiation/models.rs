//! Negotiation domain models

use crate::message::MessagePriority;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// What is being negotiated
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum NegotiationType {
    TaskAssignment,
    ResourceAllocation,
    ConflictResolution,
    Priority,
    CollaborationTerms,
}

/// Negotiation lifecycle status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum NegotiationStatus {
    Initiated,
    Proposed,
    Countered,
    Accepted,
    Rejected,
    Timeout,
    Cancelled,
}

impl NegotiationStatus {
    /// No further proposals or decisions are accepted
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NegotiationStatus::Accepted
                | NegotiationStatus::Rejected
                | NegotiationStatus::Timeout
                | NegotiationStatus::Cancelled
        )
    }

    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    pub fn can_transition_to(&self, next: NegotiationStatus) -> bool {
        use NegotiationStatus::*;
        match self {
            Initiated => matches!(next, Proposed | Cancelled),
            Proposed | Countered => {
                matches!(next, Countered | Accepted | Rejected | Timeout | Cancelled)
            }
            Accepted | Rejected | Timeout | Cancelled => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NegotiationStatus::Initiated => "initiated",
            NegotiationStatus::Proposed => "proposed",
            NegotiationStatus::Countered => "countered",
            NegotiationStatus::Accepted => "accepted",
            NegotiationStatus::Rejected => "rejected",
            NegotiationStatus::Timeout => "timeout",
            NegotiationStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for NegotiationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Action recorded in a negotiation's history
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NegotiationAction {
    Initiated,
    Proposed,
    Countered,
    Accepted,
    Rejected,
    TimedOut,
    Cancelled,
}

impl NegotiationAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            NegotiationAction::Initiated => "initiated",
            NegotiationAction::Proposed => "proposed",
            NegotiationAction::Countered => "countered",
            NegotiationAction::Accepted => "accepted",
            NegotiationAction::Rejected => "rejected",
            NegotiationAction::TimedOut => "timeout",
            NegotiationAction::Cancelled => "cancelled",
        }
    }
}

/// Optional knobs for a single proposal
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ProposalOptions {
    /// 0 to 100; falls back to the engine default
    pub priority: Option<u8>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Optional knobs for a new negotiation
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NegotiationOptions {
    pub deadline: Option<DateTime<Utc>>,
    pub metadata: Option<Value>,
    #[serde(default)]
    pub proposal: ProposalOptions,
}

/// Immutable offer of terms from one participant to another
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Proposal {
    pub proposal_id: String,
    pub negotiation_id: String,
    pub from: String,
    pub to: String,
    pub negotiation_type: NegotiationType,
    pub terms: Value,
    pub priority: u8,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl Proposal {
    pub fn new(
        negotiation_id: impl Into<String>,
        from: impl Into<String>,
        to: impl Into<String>,
        negotiation_type: NegotiationType,
        terms: Value,
        options: &ProposalOptions,
        default_priority: u8,
    ) -> Self {
        Self {
            proposal_id: format!("prop_{}", Uuid::new_v4().simple()),
            negotiation_id: negotiation_id.into(),
            from: from.into(),
            to: to.into(),
            negotiation_type,
            terms,
            priority: options.priority.unwrap_or(default_priority).min(100),
            created_at: Utc::now(),
            expires_at: options.expires_at,
        }
    }

    /// Message priority band used when the proposal is sent
    pub fn message_priority(&self) -> MessagePriority {
        match self.priority {
            p if p > 70 => MessagePriority::High,
            p if p > 40 => MessagePriority::Normal,
            _ => MessagePriority::Low,
        }
    }

    /// How long the recipient has to answer
    pub fn response_timeout(&self, default: Duration) -> Duration {
        match self.expires_at {
            Some(expires_at) => (expires_at - Utc::now())
                .to_std()
                .unwrap_or(Duration::ZERO)
                .max(Duration::from_millis(1)),
            None => default,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| at <= Utc::now())
    }
}

/// One history log entry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryEntry {
    pub action: NegotiationAction,
    pub agent: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

/// A multi-step exchange of proposals between participants
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Negotiation {
    pub negotiation_id: String,
    pub negotiation_type: NegotiationType,
    /// Initiator first, then the invited participants
    pub participants: Vec<String>,
    pub initiator: String,
    pub status: NegotiationStatus,
    pub proposals: Vec<Proposal>,
    pub current_proposal: Option<Proposal>,
    pub accepted_proposal: Option<Proposal>,
    pub history: Vec<HistoryEntry>,
    pub created_at: DateTime<Utc>,
    pub deadline: Option<DateTime<Utc>>,
    pub metadata: Option<Value>,
}

impl Negotiation {
    pub fn new(
        negotiation_type: NegotiationType,
        initiator: impl Into<String>,
        participants: Vec<String>,
        options: &NegotiationOptions,
    ) -> Self {
        let initiator = initiator.into();
        let mut all = Vec::with_capacity(participants.len() + 1);
        all.push(initiator.clone());
        all.extend(participants);

        let mut negotiation = Self {
            negotiation_id: format!("neg_{}", Uuid::new_v4().simple()),
            negotiation_type,
            participants: all,
            initiator: initiator.clone(),
            status: NegotiationStatus::Initiated,
            proposals: Vec::new(),
            current_proposal: None,
            accepted_proposal: None,
            history: Vec::new(),
            created_at: Utc::now(),
            deadline: options.deadline,
            metadata: options.metadata.clone(),
        };
        negotiation.record(NegotiationAction::Initiated, initiator, None);
        negotiation
    }

    /// Topic every participant is subscribed to
    pub fn topic(&self) -> String {
        negotiation_topic(&self.negotiation_id)
    }

    pub fn is_participant(&self, agent: &str) -> bool {
        self.participants.iter().any(|p| p == agent)
    }

    pub fn find_proposal(&self, proposal_id: &str) -> Option<&Proposal> {
        self.proposals.iter().find(|p| p.proposal_id == proposal_id)
    }

    pub fn is_current_proposal(&self, proposal_id: &str) -> bool {
        self.current_proposal
            .as_ref()
            .is_some_and(|p| p.proposal_id == proposal_id)
    }

    /// Fail if the negotiation no longer accepts changes
    pub fn ensure_open(&self) -> Result<()> {
        if self.status.is_terminal() {
            return Err(Error::state_transition(format!(
                "Negotiation {} is already {}",
                self.negotiation_id, self.status
            )));
        }
        Ok(())
    }

    /// Move to `next` if the state machine allows it
    pub fn transition_to(&mut self, next: NegotiationStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::state_transition(format!(
                "Negotiation {} cannot move from {} to {}",
                self.negotiation_id, self.status, next
            )));
        }
        self.status = next;
        Ok(())
    }

    /// Append a proposal and make it current
    pub fn push_proposal(&mut self, proposal: Proposal) {
        self.current_proposal = Some(proposal.clone());
        self.proposals.push(proposal);
    }

    pub fn record(
        &mut self,
        action: NegotiationAction,
        agent: impl Into<String>,
        details: Option<Value>,
    ) {
        self.history.push(HistoryEntry {
            action,
            agent: agent.into(),
            timestamp: Utc::now(),
            details,
        });
    }
}

/// Topic name for a negotiation id
pub fn negotiation_topic(negotiation_id: &str) -> String {
    format!("negotiation.{}", negotiation_id)
}

/// Terms for assigning a task to an agent
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskAssignmentTerms {
    pub task_id: String,
    pub task_description: String,
    #[serde(default)]
    pub required_capabilities: Vec<String>,
    #[serde(default)]
    pub estimated_duration_minutes: u64,
    #[serde(default = "default_terms_priority")]
    pub priority: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compensation: Option<Value>,
}

/// Terms for sharing a resource
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceAllocationTerms {
    pub resource_type: String,
    pub resource_id: String,
    pub quantity: u32,
    pub duration_minutes: u64,
    #[serde(default = "default_terms_priority")]
    pub priority: u8,
}

/// Terms proposed to settle a conflict
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConflictResolutionTerms {
    pub conflict_id: String,
    pub conflict_description: String,
    pub proposed_solution: String,
    #[serde(default)]
    pub alternatives: Vec<String>,
    #[serde(default)]
    pub rationale: String,
}

fn default_terms_priority() -> u8 {
    50
}
