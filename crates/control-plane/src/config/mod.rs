// Configuration loading and parsing
//
// Process settings come from the environment (after `.env` is loaded);
// queue settings and seed workflow definitions come from optional TOML
// files whose paths are given in the environment.

pub mod queues;
pub mod workflows;

pub use queues::{load_queue_configs, QueuesConfigFile};
pub use workflows::{definition_id, load_workflows_config, WorkflowSeed, WorkflowsConfigFile};

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:9300";
const DEFAULT_INTEGRATIONS_URL: &str = "http://localhost:9400";

/// Process configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_address: SocketAddr,
    /// PostgreSQL backends when set, in-memory otherwise
    pub database_url: Option<String>,
    pub lock_ttl: Duration,
    pub idempotency_ttl: Duration,
    /// Period between deletions of expired idempotency keys
    pub idempotency_sweep_interval: Duration,
    pub queues_config: Option<PathBuf>,
    pub workflows_config: Option<PathBuf>,
    /// Base URL for notify/publish/AI actions
    pub integrations_url: String,
    pub worker_id: String,
    /// Comma-separated in `CORS_ALLOWED_ORIGINS`
    pub cors_origins: Vec<String>,
    /// Mount point for the admin routes, e.g. "/api"
    pub api_prefix: String,
}

impl AppConfig {
    /// Read configuration from environment variables
    ///
    /// Environment variables:
    /// - `BIND_ADDRESS`: HTTP listen address (default: "0.0.0.0:9300")
    /// - `DATABASE_URL`: PostgreSQL connection string (optional)
    /// - `LOCK_TTL_SECS`: Instance lock TTL (default: 60)
    /// - `IDEMPOTENCY_TTL_SECS`: Deduplication window (default: 86400)
    /// - `IDEMPOTENCY_SWEEP_SECS`: Expired key sweep period (default: 300)
    /// - `QUEUES_CONFIG`: Path to a queue settings TOML file
    /// - `WORKFLOWS_CONFIG`: Path to a seed workflow definitions TOML file
    /// - `INTEGRATIONS_URL`: Integration layer base URL
    /// - `WORKER_ID`: Worker id prefix (default: "conveyor-{pid}")
    /// - `CORS_ALLOWED_ORIGINS`: Allowed browser origins
    /// - `API_PREFIX`: Prefix for admin routes (default: none)
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let non_empty = |key: &str| get(key).filter(|v| !v.trim().is_empty());

        let bind_address = non_empty("BIND_ADDRESS")
            .unwrap_or_else(|| DEFAULT_BIND_ADDRESS.to_string())
            .parse()
            .context("BIND_ADDRESS must be a socket address")?;

        let secs = |key: &str, default: u64| -> Result<Duration> {
            match non_empty(key) {
                Some(v) => v
                    .trim()
                    .parse::<u64>()
                    .map(Duration::from_secs)
                    .with_context(|| format!("{} must be a number of seconds", key)),
                None => Ok(Duration::from_secs(default)),
            }
        };

        Ok(Self {
            bind_address,
            database_url: non_empty("DATABASE_URL"),
            lock_ttl: secs("LOCK_TTL_SECS", 60)?,
            idempotency_ttl: secs("IDEMPOTENCY_TTL_SECS", 86_400)?,
            idempotency_sweep_interval: secs("IDEMPOTENCY_SWEEP_SECS", 300)?,
            queues_config: non_empty("QUEUES_CONFIG").map(PathBuf::from),
            workflows_config: non_empty("WORKFLOWS_CONFIG").map(PathBuf::from),
            integrations_url: non_empty("INTEGRATIONS_URL")
                .unwrap_or_else(|| DEFAULT_INTEGRATIONS_URL.to_string()),
            worker_id: non_empty("WORKER_ID")
                .unwrap_or_else(|| format!("conveyor-{}", std::process::id())),
            cors_origins: non_empty("CORS_ALLOWED_ORIGINS")
                .map(|s| {
                    s.split(',')
                        .map(|o| o.trim().to_string())
                        .filter(|o| !o.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
            api_prefix: non_empty("API_PREFIX")
                .map(|p| p.trim().trim_end_matches('/').to_string())
                .unwrap_or_default(),
        })
    }
}
