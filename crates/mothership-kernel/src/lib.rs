//! `mothership-kernel` – Admission & Classification
//!
//! The kernel does not think; it decides who may work and whether finished
//! work meets the rules it was given.
//!
//! # Modules
//!
//! - [`agent_registry`] – [`AgentRegistry`][agent_registry::AgentRegistry]:
//!   known worker agents, heartbeat-driven liveness and assignment selection,
//!   over an injected [`AgentStore`][agent_registry::AgentStore].
//! - [`constraint_check`] – deterministic satisfaction tests for every
//!   [`Constraint`][mothership_types::Constraint] kind.
//! - [`output_rules`] – [`OutputVerifier`][output_rules::OutputVerifier]:
//!   a rule engine whose hits force human review (crisis patterns).
//! - [`bias`] – the [`BiasEstimator`][bias::BiasEstimator] seam and the
//!   built-in lexicon estimator.
//! - [`compliance_gate`] – [`ComplianceGate`][compliance_gate::ComplianceGate]:
//!   combines the three checks above into one
//!   [`ComplianceReport`][mothership_types::ComplianceReport].

pub mod agent_registry;
pub mod bias;
pub mod compliance_gate;
pub mod constraint_check;
pub mod output_rules;

pub use agent_registry::{AgentRegistry, AgentStore, InMemoryAgentStore, NewAgent, RegistryConfig};
pub use bias::{BiasEstimator, LexiconBiasEstimator};
pub use compliance_gate::{ComplianceGate, GateConfig};
pub use output_rules::{CrisisPatternRule, OutputRule, OutputVerifier};
