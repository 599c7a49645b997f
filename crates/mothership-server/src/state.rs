//! Shared handler state and the assembly of the service graph.

use std::sync::Arc;
use std::time::{Duration, Instant};

use mothership_kernel::{AgentRegistry, ComplianceGate, GateConfig, LexiconBiasEstimator, RegistryConfig};
use mothership_memory::{KnowledgeBase, Ledger};
use mothership_middleware::RealtimeBus;
use mothership_runtime::{
    DirectiveConfig, DirectiveGenerator, EmbeddingProvider, KnowledgeCurator, TaskOrchestrator,
};
use mothership_types::MothershipError;
use tracing::info;

use crate::metrics::Metrics;

/// Tunables for every component behind the API.
#[derive(Debug, Clone, Default)]
pub struct ServiceConfig {
    pub registry: RegistryConfig,
    pub directives: DirectiveConfig,
    pub gate: GateConfig,
}

/// Everything a handler can reach. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub curator: Arc<KnowledgeCurator>,
    pub registry: Arc<AgentRegistry>,
    pub orchestrator: Arc<TaskOrchestrator>,
    pub bus: RealtimeBus,
    pub metrics: Metrics,
    pub heartbeat_interval: Duration,
    started_at: Instant,
}

impl AppState {
    /// Open (or create) the stores at `db_path` and wire the components.
    ///
    /// `None` keeps everything in memory. Knowledge, directives, agents and
    /// tasks share one SQLite file.
    pub fn open(
        db_path: Option<&str>,
        config: ServiceConfig,
        embedder: Arc<dyn EmbeddingProvider>,
    ) -> Result<Self, MothershipError> {
        let (kb, ledger) = match db_path {
            Some(path) => (KnowledgeBase::open(path)?, Ledger::open(path)?),
            None => (KnowledgeBase::open_in_memory()?, Ledger::open_in_memory()?),
        };
        let kb = Arc::new(kb);
        let ledger = Arc::new(ledger);

        let heartbeat_interval = config.registry.heartbeat_interval;
        let registry = Arc::new(AgentRegistry::new(config.registry, ledger.clone())?);
        let directives = Arc::new(DirectiveGenerator::new(
            kb.clone(),
            ledger.clone(),
            embedder.clone(),
            config.directives,
        )?);
        let gate = Arc::new(ComplianceGate::new(
            config.gate,
            Arc::new(LexiconBiasEstimator::new()),
        )?);
        let bus = RealtimeBus::default();
        let metrics = Metrics::new()
            .map_err(|e| MothershipError::Provider(format!("metrics registry: {e}")))?;
        let orchestrator = Arc::new(TaskOrchestrator::new(
            directives,
            registry.clone(),
            gate,
            bus.clone(),
            ledger,
        )?);

        info!(
            db = db_path.unwrap_or(":memory:"),
            agents = registry.list(None).len(),
            "mothership services ready"
        );
        Ok(Self {
            curator: Arc::new(KnowledgeCurator::new(kb, embedder)),
            registry,
            orchestrator,
            bus,
            metrics,
            heartbeat_interval,
            started_at: Instant::now(),
        })
    }

    pub fn knowledge(&self) -> &Arc<KnowledgeBase> {
        self.curator.knowledge_base()
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }
}
