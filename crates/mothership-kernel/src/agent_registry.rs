//! [`AgentRegistry`] – worker agents, their capabilities and liveness.
//!
//! Agents report in with [`AgentRegistry::heartbeat`]. An agent is *live*
//! while its status is [`AgentStatus::Active`] and its last heartbeat is no
//! older than the liveness window. [`AgentRegistry::sweep`] (run by a
//! supervisor loop) marks silent agents inactive; a later heartbeat flips them
//! back. Those are the only automatic status transitions.
//!
//! Selection for assignment filters and picks under the same lock that the
//! sweep and heartbeat ingestion take, so an agent can never be assigned after
//! it has been marked inactive.
//!
//! Durable storage is injected through [`AgentStore`]; the registry writes
//! through on every change and reloads the store on construction.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use mothership_memory::ledger::Ledger;
use mothership_types::{
    Agent, AgentId, AgentStatus, CapabilityMap, EntityKind, MothershipError,
};
use parking_lot::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

// ────────────────────────────────────────────────────────────────────────────
// Storage seam
// ────────────────────────────────────────────────────────────────────────────

/// Durable backing store for registered agents.
pub trait AgentStore: Send + Sync {
    /// All agents, in registration order.
    fn load(&self) -> Result<Vec<Agent>, MothershipError>;
    fn save(&self, agent: &Agent) -> Result<(), MothershipError>;
    fn remove(&self, id: AgentId) -> Result<(), MothershipError>;
}

/// Process-local store, for tests and ephemeral deployments.
#[derive(Default)]
pub struct InMemoryAgentStore {
    agents: Mutex<Vec<Agent>>,
}

impl InMemoryAgentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AgentStore for InMemoryAgentStore {
    fn load(&self) -> Result<Vec<Agent>, MothershipError> {
        Ok(self.agents.lock().clone())
    }

    fn save(&self, agent: &Agent) -> Result<(), MothershipError> {
        let mut agents = self.agents.lock();
        match agents.iter_mut().find(|a| a.id == agent.id) {
            Some(slot) => *slot = agent.clone(),
            None => agents.push(agent.clone()),
        }
        Ok(())
    }

    fn remove(&self, id: AgentId) -> Result<(), MothershipError> {
        self.agents.lock().retain(|a| a.id != id);
        Ok(())
    }
}

impl AgentStore for Ledger {
    fn load(&self) -> Result<Vec<Agent>, MothershipError> {
        Ok(self.load_agents()?)
    }

    fn save(&self, agent: &Agent) -> Result<(), MothershipError> {
        Ok(self.save_agent(agent)?)
    }

    fn remove(&self, id: AgentId) -> Result<(), MothershipError> {
        Ok(self.delete_agent(id)?)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Configuration
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// How often agents are expected to send a heartbeat.
    pub heartbeat_interval: Duration,
    /// Liveness window as a multiple of `heartbeat_interval`.
    pub liveness_multiplier: u32,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            liveness_multiplier: 3,
        }
    }
}

impl RegistryConfig {
    pub fn liveness_window(&self) -> Duration {
        self.heartbeat_interval
            .saturating_mul(self.liveness_multiplier)
    }
}

/// Registration request.
#[derive(Debug, Clone)]
pub struct NewAgent {
    pub name: String,
    pub agent_type: String,
    pub capabilities: CapabilityMap,
    /// Initial status; defaults to [`AgentStatus::Inactive`]. Registering as
    /// active counts as a first heartbeat.
    pub status: Option<AgentStatus>,
}

impl NewAgent {
    pub fn new(name: impl Into<String>, agent_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            agent_type: agent_type.into(),
            capabilities: CapabilityMap::new(),
            status: None,
        }
    }

    pub fn active(mut self) -> Self {
        self.status = Some(AgentStatus::Active);
        self
    }

    pub fn with_capabilities(mut self, capabilities: CapabilityMap) -> Self {
        self.capabilities = capabilities;
        self
    }
}

// ────────────────────────────────────────────────────────────────────────────
// AgentRegistry
// ────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct RegistryState {
    /// Keyed by registration sequence so iteration is registration order.
    agents: BTreeMap<u64, Agent>,
    by_id: HashMap<AgentId, u64>,
    next_seq: u64,
}

impl RegistryState {
    fn insert(&mut self, agent: Agent) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.by_id.insert(agent.id, seq);
        self.agents.insert(seq, agent);
    }

    fn get(&self, id: AgentId) -> Option<&Agent> {
        self.by_id.get(&id).and_then(|seq| self.agents.get(seq))
    }

    fn get_mut(&mut self, id: AgentId) -> Option<&mut Agent> {
        match self.by_id.get(&id) {
            Some(seq) => self.agents.get_mut(seq),
            None => None,
        }
    }
}

/// Tracks registered agents and selects one for each new task.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use chrono::Utc;
/// use mothership_kernel::{AgentRegistry, InMemoryAgentStore, NewAgent, RegistryConfig};
///
/// let registry = AgentRegistry::new(RegistryConfig::default(), Arc::new(InMemoryAgentStore::new())).unwrap();
/// let agent = registry.register(NewAgent::new("math-1", "math").active()).unwrap();
///
/// let picked = registry.select_for_assignment("math", &Default::default(), Utc::now()).unwrap();
/// assert_eq!(picked.id, agent.id);
/// ```
pub struct AgentRegistry {
    state: Mutex<RegistryState>,
    store: Arc<dyn AgentStore>,
    window: TimeDelta,
}

impl AgentRegistry {
    /// Build a registry over `store`, reloading any agents it already holds.
    pub fn new(config: RegistryConfig, store: Arc<dyn AgentStore>) -> Result<Self, MothershipError> {
        let mut state = RegistryState::default();
        for agent in store.load()? {
            state.insert(agent);
        }
        let window = TimeDelta::from_std(config.liveness_window()).unwrap_or(TimeDelta::MAX);
        debug!(agents = state.agents.len(), "agent registry loaded");
        Ok(Self {
            state: Mutex::new(state),
            store,
            window,
        })
    }

    fn is_live(&self, agent: &Agent, now: DateTime<Utc>) -> bool {
        agent.status == AgentStatus::Active
            && agent
                .last_heartbeat
                .is_some_and(|hb| now.signed_duration_since(hb) <= self.window)
    }

    /// Register a new agent.
    ///
    /// Returns [`MothershipError::DuplicateName`] when the name is taken.
    pub fn register(&self, new: NewAgent) -> Result<Agent, MothershipError> {
        let mut state = self.state.lock();
        if state.agents.values().any(|a| a.name == new.name) {
            return Err(MothershipError::DuplicateName {
                kind: EntityKind::Agent,
                name: new.name,
            });
        }
        let now = Utc::now();
        let status = new.status.unwrap_or(AgentStatus::Inactive);
        let agent = Agent {
            id: Uuid::new_v4(),
            name: new.name,
            agent_type: new.agent_type,
            capabilities: new.capabilities,
            status,
            last_heartbeat: (status == AgentStatus::Active).then_some(now),
            created_at: now,
            updated_at: now,
        };
        self.store.save(&agent)?;
        state.insert(agent.clone());
        info!(agent_id = %agent.id, name = %agent.name, agent_type = %agent.agent_type, "agent registered");
        Ok(agent)
    }

    /// Record a heartbeat at `timestamp`.
    ///
    /// An `inactive` or `error` agent becomes `active`; `maintenance` is left
    /// alone. Out-of-order heartbeats never move `last_heartbeat` backwards.
    pub fn heartbeat(
        &self,
        agent_id: AgentId,
        timestamp: DateTime<Utc>,
    ) -> Result<Agent, MothershipError> {
        self.mutate(agent_id, |agent| {
            let newest = agent.last_heartbeat.map_or(timestamp, |hb| hb.max(timestamp));
            agent.last_heartbeat = Some(newest);
            if matches!(agent.status, AgentStatus::Inactive | AgentStatus::Error) {
                info!(agent_id = %agent.id, from = %agent.status, "agent reactivated by heartbeat");
                agent.status = AgentStatus::Active;
            }
        })
    }

    /// Administrative status change.
    pub fn set_status(
        &self,
        agent_id: AgentId,
        status: AgentStatus,
    ) -> Result<Agent, MothershipError> {
        self.mutate(agent_id, |agent| {
            info!(agent_id = %agent.id, from = %agent.status, to = %status, "agent status set");
            agent.status = status;
        })
    }

    fn mutate(
        &self,
        agent_id: AgentId,
        apply: impl FnOnce(&mut Agent),
    ) -> Result<Agent, MothershipError> {
        let mut state = self.state.lock();
        let slot = state.get_mut(agent_id).ok_or(MothershipError::NotFound {
            kind: EntityKind::Agent,
            id: agent_id,
        })?;
        let mut updated = slot.clone();
        apply(&mut updated);
        updated.updated_at = Utc::now();
        self.store.save(&updated)?;
        *slot = updated.clone();
        Ok(updated)
    }

    /// Remove an agent. Tasks already bound to it keep their `agent_id`.
    pub fn deregister(&self, agent_id: AgentId) -> Result<Agent, MothershipError> {
        let mut state = self.state.lock();
        let seq = *state.by_id.get(&agent_id).ok_or(MothershipError::NotFound {
            kind: EntityKind::Agent,
            id: agent_id,
        })?;
        self.store.remove(agent_id)?;
        state.by_id.remove(&agent_id);
        let agent = state.agents.remove(&seq).ok_or(MothershipError::NotFound {
            kind: EntityKind::Agent,
            id: agent_id,
        })?;
        info!(agent_id = %agent_id, name = %agent.name, "agent deregistered");
        Ok(agent)
    }

    pub fn get(&self, agent_id: AgentId) -> Result<Agent, MothershipError> {
        self.state
            .lock()
            .get(agent_id)
            .cloned()
            .ok_or(MothershipError::NotFound {
                kind: EntityKind::Agent,
                id: agent_id,
            })
    }

    /// All agents in registration order, optionally restricted to one type.
    pub fn list(&self, agent_type: Option<&str>) -> Vec<Agent> {
        self.state
            .lock()
            .agents
            .values()
            .filter(|a| agent_type.is_none_or(|t| a.agent_type == t))
            .cloned()
            .collect()
    }

    /// Live agents of `agent_type` holding every required capability, in
    /// selection-preference order.
    pub fn find_eligible(
        &self,
        agent_type: &str,
        required: &CapabilityMap,
        now: DateTime<Utc>,
    ) -> Vec<Agent> {
        let state = self.state.lock();
        let mut eligible: Vec<Agent> = self
            .eligible_in(&state, agent_type, required, now)
            .cloned()
            .collect();
        // Stable sort keeps registration order among equal heartbeats.
        eligible.sort_by_key(|a| a.last_heartbeat);
        eligible
    }

    /// Pick the agent a new task should go to.
    ///
    /// Prefers the oldest heartbeat still inside the liveness window, then
    /// the earliest registration. Fails with
    /// [`MothershipError::NoEligibleAgent`] when nobody qualifies.
    pub fn select_for_assignment(
        &self,
        agent_type: &str,
        required: &CapabilityMap,
        now: DateTime<Utc>,
    ) -> Result<Agent, MothershipError> {
        let state = self.state.lock();
        let picked = self
            .eligible_in(&state, agent_type, required, now)
            .min_by_key(|a| a.last_heartbeat)
            .cloned();
        match picked {
            Some(agent) => {
                debug!(agent_id = %agent.id, name = %agent.name, "agent selected");
                Ok(agent)
            }
            None => {
                warn!(agent_type, "no eligible agent");
                Err(MothershipError::NoEligibleAgent {
                    agent_type: agent_type.to_string(),
                })
            }
        }
    }

    fn eligible_in<'a>(
        &'a self,
        state: &'a RegistryState,
        agent_type: &'a str,
        required: &'a CapabilityMap,
        now: DateTime<Utc>,
    ) -> impl Iterator<Item = &'a Agent> + 'a {
        state.agents.values().filter(move |a| {
            a.agent_type == agent_type && self.is_live(a, now) && a.has_capabilities(required)
        })
    }

    /// Mark every active agent whose heartbeat is older than the liveness
    /// window as inactive. Returns the agents that changed.
    pub fn sweep(&self, now: DateTime<Utc>) -> Vec<Agent> {
        let mut state = self.state.lock();
        let mut changed = Vec::new();
        for agent in state.agents.values_mut() {
            if agent.status != AgentStatus::Active || self.is_live(agent, now) {
                continue;
            }
            let mut updated = agent.clone();
            updated.status = AgentStatus::Inactive;
            updated.updated_at = now;
            if let Err(e) = self.store.save(&updated) {
                warn!(agent_id = %agent.id, error = %e, "failed to persist sweep result");
                continue;
            }
            info!(agent_id = %agent.id, name = %agent.name, "agent marked inactive: heartbeat lapsed");
            *agent = updated.clone();
            changed.push(updated);
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mothership_types::Capability;

    fn registry() -> AgentRegistry {
        AgentRegistry::new(RegistryConfig::default(), Arc::new(InMemoryAgentStore::new())).unwrap()
    }

    fn window() -> TimeDelta {
        TimeDelta::seconds(90)
    }

    #[test]
    fn default_window_is_three_intervals() {
        assert_eq!(RegistryConfig::default().liveness_window(), Duration::from_secs(90));
    }

    #[test]
    fn new_agent_starts_inactive() {
        let reg = registry();
        let a = reg.register(NewAgent::new("writer-1", "writer")).unwrap();
        assert_eq!(a.status, AgentStatus::Inactive);
        assert!(a.last_heartbeat.is_none());
        assert!(reg.find_eligible("writer", &CapabilityMap::new(), Utc::now()).is_empty());
    }

    #[test]
    fn duplicate_name_is_rejected() {
        let reg = registry();
        reg.register(NewAgent::new("math-1", "math")).unwrap();
        let err = reg.register(NewAgent::new("math-1", "writer")).unwrap_err();
        assert!(matches!(err, MothershipError::DuplicateName { .. }));
        assert_eq!(reg.list(None).len(), 1);
    }

    #[test]
    fn heartbeat_reactivates_inactive_and_error() {
        let reg = registry();
        let a = reg.register(NewAgent::new("math-1", "math")).unwrap();
        let now = Utc::now();
        let a = reg.heartbeat(a.id, now).unwrap();
        assert_eq!(a.status, AgentStatus::Active);
        assert_eq!(a.last_heartbeat, Some(now));

        reg.set_status(a.id, AgentStatus::Error).unwrap();
        let a = reg.heartbeat(a.id, now).unwrap();
        assert_eq!(a.status, AgentStatus::Active);
    }

    #[test]
    fn heartbeat_leaves_maintenance_alone() {
        let reg = registry();
        let a = reg.register(NewAgent::new("math-1", "math")).unwrap();
        reg.set_status(a.id, AgentStatus::Maintenance).unwrap();
        let a = reg.heartbeat(a.id, Utc::now()).unwrap();
        assert_eq!(a.status, AgentStatus::Maintenance);
    }

    #[test]
    fn stale_heartbeat_never_moves_backwards() {
        let reg = registry();
        let a = reg.register(NewAgent::new("math-1", "math")).unwrap();
        let now = Utc::now();
        reg.heartbeat(a.id, now).unwrap();
        let a = reg.heartbeat(a.id, now - TimeDelta::seconds(10)).unwrap();
        assert_eq!(a.last_heartbeat, Some(now));
    }

    #[test]
    fn heartbeat_on_unknown_agent_is_not_found() {
        let err = registry().heartbeat(Uuid::new_v4(), Utc::now()).unwrap_err();
        assert!(matches!(err, MothershipError::NotFound { .. }));
    }

    #[test]
    fn silent_agent_is_excluded_then_swept_then_revived() {
        let reg = registry();
        let a = reg.register(NewAgent::new("math-1", "math")).unwrap();
        let t0 = Utc::now();
        reg.heartbeat(a.id, t0).unwrap();

        let later = t0 + window() + TimeDelta::seconds(1);
        // Excluded even before the sweep runs.
        assert!(reg.find_eligible("math", &CapabilityMap::new(), later).is_empty());

        let swept = reg.sweep(later);
        assert_eq!(swept.len(), 1);
        assert_eq!(reg.get(a.id).unwrap().status, AgentStatus::Inactive);

        reg.heartbeat(a.id, later).unwrap();
        assert_eq!(reg.get(a.id).unwrap().status, AgentStatus::Active);
        assert_eq!(reg.find_eligible("math", &CapabilityMap::new(), later).len(), 1);
    }

    #[test]
    fn sweep_ignores_live_and_non_active_agents() {
        let reg = registry();
        let live = reg.register(NewAgent::new("live", "math").active()).unwrap();
        let maint = reg.register(NewAgent::new("maint", "math").active()).unwrap();
        reg.set_status(maint.id, AgentStatus::Maintenance).unwrap();
        assert!(reg.sweep(Utc::now()).is_empty());
        assert_eq!(reg.get(live.id).unwrap().status, AgentStatus::Active);
    }

    #[test]
    fn selection_prefers_oldest_heartbeat_within_window() {
        let reg = registry();
        let a = reg.register(NewAgent::new("a", "math")).unwrap();
        let b = reg.register(NewAgent::new("b", "math")).unwrap();
        let c = reg.register(NewAgent::new("c", "math")).unwrap();
        let now = Utc::now();
        reg.heartbeat(a.id, now - TimeDelta::seconds(10)).unwrap();
        reg.heartbeat(b.id, now - TimeDelta::seconds(60)).unwrap();
        // Outside the window: never chosen despite being oldest.
        reg.heartbeat(c.id, now - TimeDelta::seconds(200)).unwrap();

        let picked = reg
            .select_for_assignment("math", &CapabilityMap::new(), now)
            .unwrap();
        assert_eq!(picked.id, b.id);
    }

    #[test]
    fn selection_ties_break_by_registration_order() {
        let reg = registry();
        let first = reg.register(NewAgent::new("first", "math")).unwrap();
        let second = reg.register(NewAgent::new("second", "math")).unwrap();
        let now = Utc::now();
        reg.heartbeat(second.id, now).unwrap();
        reg.heartbeat(first.id, now).unwrap();
        let picked = reg
            .select_for_assignment("math", &CapabilityMap::new(), now)
            .unwrap();
        assert_eq!(picked.id, first.id);
    }

    #[test]
    fn selection_respects_type_and_capabilities() {
        let reg = registry();
        let mut caps = CapabilityMap::new();
        caps.insert("algebra".to_string(), Capability::Level { value: 3 });
        reg.register(NewAgent::new("writer", "writer").active()).unwrap();
        let novice = reg
            .register(NewAgent::new("novice", "math").active())
            .unwrap();
        let expert = reg
            .register(NewAgent::new("expert", "math").active().with_capabilities(caps))
            .unwrap();

        let mut need = CapabilityMap::new();
        need.insert("algebra".to_string(), Capability::Level { value: 2 });
        let picked = reg
            .select_for_assignment("math", &need, Utc::now())
            .unwrap();
        assert_eq!(picked.id, expert.id);

        let any = reg.find_eligible("math", &CapabilityMap::new(), Utc::now());
        assert!(any.iter().any(|a| a.id == novice.id));
    }

    #[test]
    fn no_eligible_agent_error() {
        let reg = registry();
        reg.register(NewAgent::new("writer", "writer").active()).unwrap();
        let err = reg
            .select_for_assignment("math", &CapabilityMap::new(), Utc::now())
            .unwrap_err();
        assert!(matches!(err, MothershipError::NoEligibleAgent { .. }));
    }

    #[test]
    fn deregister_removes_agent() {
        let reg = registry();
        let a = reg.register(NewAgent::new("math-1", "math").active()).unwrap();
        reg.deregister(a.id).unwrap();
        assert!(reg.get(a.id).is_err());
        assert!(reg.deregister(a.id).is_err());
        // Name is free again.
        reg.register(NewAgent::new("math-1", "math")).unwrap();
    }

    #[test]
    fn registry_reloads_from_store() {
        let store: Arc<dyn AgentStore> = Arc::new(Ledger::open_in_memory().unwrap());
        let id = {
            let reg = AgentRegistry::new(RegistryConfig::default(), store.clone()).unwrap();
            reg.register(NewAgent::new("math-1", "math").active()).unwrap().id
        };
        let reg = AgentRegistry::new(RegistryConfig::default(), store).unwrap();
        assert_eq!(reg.get(id).unwrap().status, AgentStatus::Active);
        assert!(reg.register(NewAgent::new("math-1", "math")).is_err());
    }

    #[test]
    fn list_filters_by_type() {
        let reg = registry();
        reg.register(NewAgent::new("m", "math")).unwrap();
        reg.register(NewAgent::new("w", "writer")).unwrap();
        assert_eq!(reg.list(Some("math")).len(), 1);
        assert_eq!(reg.list(None).len(), 2);
    }
}
