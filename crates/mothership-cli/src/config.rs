//! Configuration vault – reads/writes `~/.mothership/config.toml`.
//!
//! Every section is optional in the file; missing keys take their defaults.
//!
//! ```toml
//! [server]
//! port = 8080
//!
//! [storage]
//! db_path = "/var/lib/mothership/mothership.db"
//!
//! [agents]
//! heartbeat_interval_secs = 30
//! liveness_multiplier = 3
//!
//! [directives]
//! top_k = 5
//! min_similarity = 0.1
//! horizon_hours = 24      # 0 disables expiry
//!
//! [gate]
//! review_threshold = 0.7
//! bias_threshold = 0.5
//!
//! [tasks]
//! timeout_secs = 600      # omit to disable the watchdog
//!
//! [embedding]
//! provider = "http"       # or "hashing"
//! url = "http://localhost:11434"
//! model = "nomic-embed-text"
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use mothership_kernel::{CrisisPatternRule, GateConfig, RegistryConfig};
use mothership_runtime::{
    DirectiveConfig, EmbeddingProvider, HashingEmbedder, HttpEmbedder, SupervisorConfig,
};
use mothership_server::ServiceConfig;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerSection,
    pub storage: StorageSection,
    pub agents: AgentSection,
    pub directives: DirectiveSection,
    pub gate: GateSection,
    pub tasks: TaskSection,
    pub embedding: EmbeddingSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub port: u16,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            port: mothership_server::DEFAULT_PORT,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    /// SQLite file shared by every store. Unset keeps state in memory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub db_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    pub heartbeat_interval_secs: u64,
    pub liveness_multiplier: u32,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 30,
            liveness_multiplier: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectiveSection {
    pub top_k: usize,
    pub min_similarity: f32,
    pub horizon_hours: u64,
}

impl Default for DirectiveSection {
    fn default() -> Self {
        Self {
            top_k: 5,
            min_similarity: 0.1,
            horizon_hours: 24,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GateSection {
    pub review_threshold: f32,
    pub bias_threshold: f32,
    pub crisis_patterns: Vec<String>,
}

impl Default for GateSection {
    fn default() -> Self {
        Self {
            review_threshold: 0.7,
            bias_threshold: 0.5,
            crisis_patterns: CrisisPatternRule::DEFAULT_PATTERNS
                .iter()
                .map(|p| p.to_string())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingKind {
    /// Deterministic local feature hashing; no network.
    #[default]
    Hashing,
    /// OpenAI-compatible `/v1/embeddings` endpoint.
    Http,
}

impl std::fmt::Display for EmbeddingKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EmbeddingKind::Hashing => write!(f, "hashing"),
            EmbeddingKind::Http => write!(f, "http"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingSection {
    pub provider: EmbeddingKind,
    pub url: String,
    pub model: String,
    pub dims: usize,
    #[serde(skip_serializing_if = "ApiKey::is_empty")]
    pub api_key: ApiKey,
}

impl Default for EmbeddingSection {
    fn default() -> Self {
        Self {
            provider: EmbeddingKind::default(),
            url: "http://localhost:11434".to_string(),
            model: "nomic-embed-text".to_string(),
            dims: HashingEmbedder::DEFAULT_DIMS,
            api_key: ApiKey::default(),
        }
    }
}

/// Bearer token for the HTTP provider. Wiped from memory on drop and never
/// printed by `Debug`.
#[derive(Clone, Default, PartialEq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(transparent)]
pub struct ApiKey(String);

impl ApiKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(if self.is_empty() { "<not set>" } else { "<redacted>" })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Conversions into component configs
// ─────────────────────────────────────────────────────────────────────────────

impl Config {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.agents.heartbeat_interval_secs.max(1))
    }

    pub fn service_config(&self) -> ServiceConfig {
        let horizon = match self.directives.horizon_hours {
            0 => None,
            h => i64::try_from(h).ok().map(chrono::Duration::hours),
        };
        ServiceConfig {
            registry: RegistryConfig {
                heartbeat_interval: self.heartbeat_interval(),
                liveness_multiplier: self.agents.liveness_multiplier.max(1),
            },
            directives: DirectiveConfig {
                top_k: self.directives.top_k.max(1),
                min_similarity: self.directives.min_similarity,
                horizon,
            },
            gate: GateConfig {
                review_threshold: self.gate.review_threshold,
                bias_threshold: self.gate.bias_threshold,
                crisis_patterns: self.gate.crisis_patterns.clone(),
            },
        }
    }

    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            tick: self.heartbeat_interval(),
            task_timeout: self.tasks.timeout_secs.map(Duration::from_secs),
        }
    }

    pub fn embedder(&self) -> Arc<dyn EmbeddingProvider> {
        match self.embedding.provider {
            EmbeddingKind::Hashing => Arc::new(HashingEmbedder::new(self.embedding.dims.max(1))),
            EmbeddingKind::Http => {
                let mut http = HttpEmbedder::new(&self.embedding.url, &self.embedding.model);
                if !self.embedding.api_key.is_empty() {
                    http = http.with_api_key(self.embedding.api_key.expose());
                }
                Arc::new(http)
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Load / save
// ─────────────────────────────────────────────────────────────────────────────

/// Return the path to `~/.mothership/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".mothership").join("config.toml")
}

/// Load `path` (or the default location), falling back to defaults when the
/// file is absent. Environment overrides are always applied.
pub fn load(path: Option<&Path>) -> Result<Config, String> {
    let path = path.map(Path::to_path_buf).unwrap_or_else(config_path);
    let mut cfg = load_from(&path)?.unwrap_or_default();
    apply_env_overrides(&mut cfg);
    Ok(cfg)
}

/// Load the config from a specific path. Returns `None` if it does not exist.
pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    let cfg: Config =
        toml::from_str(&raw).map_err(|e| format!("Failed to parse config: {}", e))?;
    Ok(Some(cfg))
}

/// Apply `MOTHERSHIP_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `MOTHERSHIP_PORT` | `server.port` |
/// | `MOTHERSHIP_DB_PATH` | `storage.db_path` |
/// | `MOTHERSHIP_EMBEDDING_URL` | `embedding.url` (selects the HTTP provider) |
/// | `MOTHERSHIP_EMBEDDING_MODEL` | `embedding.model` |
/// | `MOTHERSHIP_EMBEDDING_API_KEY` | `embedding.api_key` |
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("MOTHERSHIP_PORT")
        && let Ok(port) = v.parse::<u16>()
    {
        cfg.server.port = port;
    }
    if let Ok(v) = std::env::var("MOTHERSHIP_DB_PATH") {
        cfg.storage.db_path = Some(v);
    }
    if let Ok(v) = std::env::var("MOTHERSHIP_EMBEDDING_URL") {
        cfg.embedding.url = v;
        cfg.embedding.provider = EmbeddingKind::Http;
    }
    if let Ok(v) = std::env::var("MOTHERSHIP_EMBEDDING_MODEL") {
        cfg.embedding.model = v;
    }
    if let Ok(v) = std::env::var("MOTHERSHIP_EMBEDDING_API_KEY") {
        cfg.embedding.api_key = ApiKey::new(v);
    }
}

/// Save the config to a specific path, creating the parent directory.
pub fn save_to(cfg: &Config, path: &Path) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory: {}", e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
                .map_err(|e| format!("Failed to set config directory permissions: {}", e))?;
        }
    }
    let raw = toml::to_string_pretty(cfg)
        .map_err(|e| format!("Failed to serialize config: {}", e))?;
    // Owner-only read/write (rw-------) on Unix.
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| {
                use std::io::Write;
                f.write_all(raw.as_bytes())
            })
            .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw)
        .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    Ok(())
}
