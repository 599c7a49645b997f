//! `mothership-runtime` – Directives and the Task Lifecycle
//!
//! Where knowledge becomes constraints and submissions become finished,
//! classified work.
//!
//! # Modules
//!
//! - [`providers`] – [`EmbeddingProvider`][providers::EmbeddingProvider]
//!   seam with a deterministic hashing embedder and an OpenAI-compatible
//!   HTTP client.
//! - [`knowledge`] – [`KnowledgeCurator`][knowledge::KnowledgeCurator]:
//!   embeds and stores Values and Beliefs.
//! - [`directive_engine`] – [`DirectiveGenerator`][directive_engine::DirectiveGenerator]:
//!   similarity search, first-match-wins constraint synthesis, expiry and
//!   fingerprint caching.
//! - [`orchestrator`] – [`TaskOrchestrator`][orchestrator::TaskOrchestrator]:
//!   the `pending → in_progress → completed | failed | cancelled` state
//!   machine, wired to the agent registry, the compliance gate and the bus.
//! - [`supervisor`] – periodic liveness sweep, directive-expiry and timeout
//!   watchdog.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing] with optional
//!   OTLP export.

pub mod directive_engine;
pub mod knowledge;
pub mod orchestrator;
pub mod providers;
pub mod supervisor;
pub mod telemetry;

pub use directive_engine::{DirectiveConfig, DirectiveGenerator};
pub use knowledge::{KnowledgeCurator, KnowledgeEdit};
pub use orchestrator::{Actor, CreateTask, SubmitRequest, TaskOrchestrator};
pub use providers::{EmbeddingProvider, HashingEmbedder, HttpEmbedder, ProviderError};
pub use supervisor::{Supervisor, SupervisorConfig};
pub use telemetry::{TracerProviderGuard, init_tracing};
