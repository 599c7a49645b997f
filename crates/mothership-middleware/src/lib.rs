//! `mothership-middleware` – The Coordination Bus
//!
//! Moves assignments to agents and status to observers without caring what
//! the work is.
//!
//! # Modules
//!
//! - [`bus`] – [`RealtimeBus`][bus::RealtimeBus]: ordered per-agent lanes
//!   plus a broadcast observers topic, built on Tokio channels.
//! - [`protocol`] – JSON wire messages exchanged with agents.
//! - [`agent_client`] – worker-side WebSocket client speaking [`protocol`].
//! - [`throttle`] – per-connection inbound message rate limiting.

pub mod agent_client;
pub mod bus;
pub mod protocol;
pub mod throttle;

pub use agent_client::{AgentClient, ClientError};
pub use bus::{AgentReceiver, Delivery, ObserverReceiver, RealtimeBus};
pub use protocol::{AgentMessage, Assignment, ServerMessage, TaskReport};
pub use throttle::InboundThrottle;
