//! Real-time coordination bus.
//!
//! Two kinds of lane:
//!
//! | Lane | Channel | Guarantees |
//! |---|---|---|
//! | per agent | [`tokio::sync::mpsc`] (unbounded) | messages to one agent arrive in publish order |
//! | observers | [`tokio::sync::broadcast`] | every observer sees every event; slow observers may lag |
//!
//! Messages published to an agent that currently has no live subscription
//! are parked in that agent's backlog and flushed, in order, when it
//! subscribes again. A new subscription for the same agent replaces the old
//! one. Disconnecting never touches task state.
//!
//! The backlog is bounded by the owner of the tasks: a parked assignment is
//! retracted once its task leaves `pending`, a deregistered agent's lane is
//! removed outright, and [`RealtimeBus::subscribe_agent_with`] replays the
//! current pending assignments ahead of the backlog while dropping the parked
//! copies of the same tasks. An assignment that was handed to a connection
//! which died before acting on it is replayed on the next subscription, so
//! delivery is at-least-once and consumers must tolerate duplicates.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use mothership_types::{AgentId, Event, TaskId};
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use crate::protocol::ServerMessage;

/// Default observers channel capacity (number of buffered events before old
/// ones are dropped for slow subscribers).
const DEFAULT_CAPACITY: usize = 256;

/// Outcome of [`RealtimeBus::publish_to_agent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Handed to the agent's live subscription.
    Delivered,
    /// Parked in the agent's backlog until it subscribes.
    Queued,
}

#[derive(Default)]
struct Lane {
    sender: Option<mpsc::UnboundedSender<ServerMessage>>,
    /// Incremented on every subscription so a stale receiver cannot detach a
    /// newer one.
    generation: u64,
    backlog: VecDeque<ServerMessage>,
}

struct BusInner {
    lanes: Mutex<HashMap<AgentId, Lane>>,
    observers: broadcast::Sender<Event>,
}

/// Shared bus handle. Clone it cheaply – all clones share the same lanes.
#[derive(Clone)]
pub struct RealtimeBus {
    inner: Arc<BusInner>,
}

impl RealtimeBus {
    /// Create a bus whose observers topic buffers `capacity` events.
    pub fn new(capacity: usize) -> Self {
        let (observers, _) = broadcast::channel(capacity);
        Self {
            inner: Arc::new(BusInner {
                lanes: Mutex::new(HashMap::new()),
                observers,
            }),
        }
    }

    // -----------------------------------------------------------------------
    // Agent lanes
    // -----------------------------------------------------------------------

    /// Send `message` to one agent, preserving per-agent order.
    pub fn publish_to_agent(&self, agent_id: AgentId, message: ServerMessage) -> Delivery {
        let mut lanes = self.inner.lanes.lock();
        let lane = lanes.entry(agent_id).or_default();
        if let Some(sender) = &lane.sender {
            // Nothing may overtake parked messages.
            if lane.backlog.is_empty() {
                match sender.send(message) {
                    Ok(()) => {
                        debug!(%agent_id, "message delivered to agent lane");
                        return Delivery::Delivered;
                    }
                    Err(mpsc::error::SendError(returned)) => {
                        lane.sender = None;
                        lane.backlog.push_back(returned);
                        debug!(%agent_id, "agent lane closed; message queued");
                        return Delivery::Queued;
                    }
                }
            }
        }
        lane.backlog.push_back(message);
        debug!(%agent_id, backlog = lane.backlog.len(), "message queued for offline agent");
        Delivery::Queued
    }

    /// Open (or replace) the lane for `agent_id`. Any backlog is flushed into
    /// the new receiver first.
    pub fn subscribe_agent(&self, agent_id: AgentId) -> AgentReceiver {
        self.subscribe_agent_with(agent_id, Vec::new())
    }

    /// Open (or replace) the lane for `agent_id`, delivering `replay` first.
    ///
    /// Parked assignments for tasks that `replay` already carries are
    /// dropped; everything else in the backlog follows in order.
    pub fn subscribe_agent_with(&self, agent_id: AgentId, replay: Vec<ServerMessage>) -> AgentReceiver {
        let (tx, rx) = mpsc::unbounded_channel();
        let replayed: HashSet<TaskId> = replay.iter().filter_map(assignment_task).collect();
        let mut lanes = self.inner.lanes.lock();
        let lane = lanes.entry(agent_id).or_default();
        // The receiver is alive in this scope, so these sends cannot fail.
        for message in replay {
            let _ = tx.send(message);
        }
        while let Some(message) = lane.backlog.pop_front() {
            if assignment_task(&message).is_some_and(|id| replayed.contains(&id)) {
                continue;
            }
            let _ = tx.send(message);
        }
        if lane.sender.is_some() {
            warn!(%agent_id, "agent lane replaced by a new subscription");
        }
        lane.sender = Some(tx);
        lane.generation += 1;
        AgentReceiver {
            agent_id,
            generation: lane.generation,
            receiver: rx,
            bus: self.clone(),
        }
    }

    /// Whether `agent_id` currently has a live subscription.
    pub fn is_connected(&self, agent_id: AgentId) -> bool {
        self.inner
            .lanes
            .lock()
            .get(&agent_id)
            .is_some_and(|lane| lane.sender.as_ref().is_some_and(|s| !s.is_closed()))
    }

    /// Number of messages parked for an offline agent.
    pub fn backlog_len(&self, agent_id: AgentId) -> usize {
        self.inner
            .lanes
            .lock()
            .get(&agent_id)
            .map_or(0, |lane| lane.backlog.len())
    }

    /// Drop a parked assignment for `task_id`. Returns whether one was found.
    pub fn retract_assignment(&self, agent_id: AgentId, task_id: TaskId) -> bool {
        let mut lanes = self.inner.lanes.lock();
        let Some(lane) = lanes.get_mut(&agent_id) else {
            return false;
        };
        let before = lane.backlog.len();
        lane.backlog
            .retain(|message| assignment_task(message) != Some(task_id));
        let retracted = lane.backlog.len() != before;
        if retracted {
            debug!(%agent_id, %task_id, "parked assignment retracted");
        }
        retracted
    }

    /// Forget `agent_id` entirely: its backlog is discarded and a live
    /// receiver ends once drained. Returns the number of discarded messages.
    pub fn remove_lane(&self, agent_id: AgentId) -> usize {
        match self.inner.lanes.lock().remove(&agent_id) {
            Some(lane) => {
                debug!(%agent_id, discarded = lane.backlog.len(), "agent lane removed");
                lane.backlog.len()
            }
            None => 0,
        }
    }

    fn detach(&self, agent_id: AgentId, generation: u64) {
        let mut lanes = self.inner.lanes.lock();
        if let Some(lane) = lanes.get_mut(&agent_id) {
            if lane.generation == generation {
                lane.sender = None;
                debug!(%agent_id, "agent lane detached");
            }
        }
    }

    // -----------------------------------------------------------------------
    // Observers topic
    // -----------------------------------------------------------------------

    /// Broadcast `event` to every observer.
    ///
    /// Returns the number of observers that were handed the event; `0` when
    /// nobody is listening, which is a normal condition.
    pub fn publish_event(&self, event: Event) -> usize {
        self.inner.observers.send(event).unwrap_or(0)
    }

    pub fn subscribe_observers(&self) -> ObserverReceiver {
        ObserverReceiver {
            receiver: self.inner.observers.subscribe(),
        }
    }
}

fn assignment_task(message: &ServerMessage) -> Option<TaskId> {
    match message {
        ServerMessage::Assignment(assignment) => Some(assignment.task_id),
        _ => None,
    }
}

impl Default for RealtimeBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// Receivers
// ---------------------------------------------------------------------------

/// Ordered stream of messages for one agent.
///
/// Dropping it detaches the lane; later messages are queued.
pub struct AgentReceiver {
    agent_id: AgentId,
    generation: u64,
    receiver: mpsc::UnboundedReceiver<ServerMessage>,
    bus: RealtimeBus,
}

impl AgentReceiver {
    /// Wait for the next message. Returns `None` once the lane was replaced
    /// by a newer subscription and drained.
    pub async fn recv(&mut self) -> Option<ServerMessage> {
        self.receiver.recv().await
    }

    pub fn agent_id(&self) -> AgentId {
        self.agent_id
    }
}

impl Drop for AgentReceiver {
    fn drop(&mut self) {
        self.bus.detach(self.agent_id, self.generation);
    }
}

/// Observer stream. Lagged observers skip ahead with a warning.
pub struct ObserverReceiver {
    receiver: broadcast::Receiver<Event>,
}

impl ObserverReceiver {
    /// Wait for the next event. Returns `None` when the bus is gone.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(lagged_by = n, "observer lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
