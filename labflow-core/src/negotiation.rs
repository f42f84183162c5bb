//! Agent negotiation
//!
//! Negotiations are proposal/counter-proposal exchanges between agents,
//! modelled as an explicit state machine:
//!
//! ```text
//! initiated -> proposed -> (countered)* -> accepted | rejected | timeout | cancelled
//! ```
//!
//! Once a negotiation reaches a terminal status no further proposals or
//! decisions are accepted for it.
//!
//! # Examples
//!
//! ```rust,no_run
//! use labflow_core::config::NegotiationSettings;
//! use labflow_core::negotiation::*;
//! use labflow_core::protocol::CommunicationProtocol;
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # async fn example() -> labflow_core::Result<()> {
//! let protocol = Arc::new(CommunicationProtocol::default());
//! let engine = NegotiationEngine::new(protocol, NegotiationSettings::default());
//!
//! let negotiation = engine
//!     .initiate_negotiation(
//!         NegotiationType::ResourceAllocation,
//!         "planner",
//!         vec!["analyst".to_string()],
//!         json!({ "resource_type": "gpu", "quantity": 1 }),
//!         NegotiationOptions::default(),
//!     )
//!     .await?;
//!
//! let proposal_id = negotiation.proposals[0].proposal_id.clone();
//! engine
//!     .accept_proposal(&negotiation.negotiation_id, &proposal_id, "analyst")
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod engine;
pub mod models;

pub use engine::{NegotiationEngine, NegotiationEvent, NEGOTIATION_SYSTEM_AGENT};
pub use models::{
    negotiation_topic, ConflictResolutionTerms, HistoryEntry, Negotiation, NegotiationAction,
    NegotiationOptions, NegotiationStatus, NegotiationType, Proposal, ProposalOptions,
    ResourceAllocationTerms, TaskAssignmentTerms,
};
