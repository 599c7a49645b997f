//! Background maintenance loop.
//!
//! Every tick the [`Supervisor`]:
//!
//! 1. sweeps the agent registry, demoting agents whose heartbeat lapsed and
//!    announcing each demotion on the observers topic;
//! 2. fails the open tasks of every demoted agent with
//!    `"agent heartbeat timeout"`; a task survives a dropped socket but not
//!    a lapsed heartbeat window;
//! 3. fails open tasks whose directive has expired;
//! 4. when a task timeout is configured, fails `in_progress` tasks that have
//!    run longer than it.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use mothership_kernel::AgentRegistry;
use mothership_middleware::RealtimeBus;
use mothership_types::{Event, EventPayload};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::orchestrator::{AGENT_LOST, TaskOrchestrator};

const EVENT_SOURCE: &str = "mothership-runtime::supervisor";

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Time between ticks; normally the heartbeat interval.
    pub tick: Duration,
    /// Maximum `in_progress` duration; `None` disables the watchdog.
    pub task_timeout: Option<Duration>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(30),
            task_timeout: None,
        }
    }
}

/// What one tick changed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickSummary {
    pub agents_demoted: usize,
    pub tasks_orphaned: usize,
    pub tasks_expired: usize,
    pub tasks_timed_out: usize,
}

pub struct Supervisor {
    registry: Arc<AgentRegistry>,
    orchestrator: Arc<TaskOrchestrator>,
    bus: RealtimeBus,
    config: SupervisorConfig,
}

impl Supervisor {
    pub fn new(
        registry: Arc<AgentRegistry>,
        orchestrator: Arc<TaskOrchestrator>,
        bus: RealtimeBus,
        config: SupervisorConfig,
    ) -> Self {
        Self {
            registry,
            orchestrator,
            bus,
            config,
        }
    }

    pub async fn tick(&self) -> TickSummary {
        let now = Utc::now();
        let demoted = self.registry.sweep(now);
        let mut orphaned = 0;
        for agent in &demoted {
            self.bus.publish_event(Event::new(
                EVENT_SOURCE,
                EventPayload::AgentStatus {
                    agent_id: agent.id,
                    status: agent.status,
                },
            ));
            orphaned += self
                .orchestrator
                .fail_for_agent(agent.id, AGENT_LOST, now)
                .await
                .len();
        }

        let expired = self.orchestrator.fail_expired(now).await;

        let timed_out = match self
            .config
            .task_timeout
            .and_then(|t| chrono::Duration::from_std(t).ok())
        {
            Some(max) => self.orchestrator.timeout_overdue(max, now).await,
            None => Vec::new(),
        };

        let summary = TickSummary {
            agents_demoted: demoted.len(),
            tasks_orphaned: orphaned,
            tasks_expired: expired.len(),
            tasks_timed_out: timed_out.len(),
        };
        if summary != TickSummary::default() {
            info!(?summary, "supervisor tick");
        } else {
            debug!("supervisor tick: nothing to do");
        }
        summary
    }

    /// Run ticks until `shutdown` flips to `true` (or its sender is dropped).
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.tick);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        self.tick().await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            info!("supervisor stopped");
                            break;
                        }
                    }
                }
            }
        })
    }
}
