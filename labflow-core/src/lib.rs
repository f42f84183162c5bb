//! Core coordination layer for Labflow
//!
//! This crate contains the multi-agent coordination pieces used by the
//! Labflow research assistant: the agent contract, a workflow orchestrator
//! with result synthesis, a generic inter-agent communication protocol and a
//! negotiation engine built on top of it.

pub mod agent;
pub mod config;
pub mod error;
pub mod message;
pub mod negotiation;
pub mod orchestration;
pub mod protocol;

pub use error::{Error, Result};
