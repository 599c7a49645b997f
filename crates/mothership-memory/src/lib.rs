//! `mothership-memory` – The Knowledge Base and durable ledger.
//!
//! Both stores sit on a local SQLite substrate.
//!
//! # Modules
//!
//! - [`ontology`] – [`KnowledgeBase`][ontology::KnowledgeBase]: Values and
//!   Beliefs with their embedding vectors, referential integrity between them,
//!   and cosine-similarity search.
//! - [`ledger`] – [`Ledger`][ledger::Ledger]: persisted directives, agents and
//!   tasks so orchestration state survives a restart.
//! - [`vector`] – embedding blob encoding and cosine similarity shared by both.

pub mod ledger;
pub mod ontology;
mod sql;
pub mod vector;

pub use ledger::{Ledger, LedgerError};
pub use ontology::{KnowledgeBase, KnowledgeError};
