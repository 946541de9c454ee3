//! Configuration — TOML file defaults + environment variable overrides.
//!
//! Tunables live in `config/default.toml`. Deployment-specific values
//! (database URL, org id, worker id) come from environment variables.

use serde::Deserialize;
use std::env;
use uuid::Uuid;

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub org: OrgConfig,
    pub worker: WorkerConfig,
    pub scheduler: SchedulerConfig,
    pub governor: GovernorConfig,
    pub upstream: UpstreamConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrgConfig {
    /// Org UUID this worker serves. Workers are single-org.
    #[serde(default)]
    pub id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    /// Worker identity recorded in job leases. Defaults to `worker-<pid>`.
    pub id: Option<String>,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_claim_batch")]
    pub claim_batch: i64,
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_concurrency() -> usize {
    4
}
fn default_claim_batch() -> i64 {
    10
}
fn default_lease_secs() -> u64 {
    300
}
fn default_poll_interval_ms() -> u64 {
    1000
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,
    #[serde(default = "default_max_jobs_per_run")]
    pub max_jobs_per_run: usize,
}

fn default_tick_secs() -> u64 {
    5
}
fn default_max_jobs_per_run() -> usize {
    50
}

#[derive(Debug, Clone, Deserialize)]
pub struct GovernorConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: f64,
    /// Tokens per second. Calibrated to the upstream's 1200-weight-per-minute
    /// ceiling with ~33% headroom.
    #[serde(default = "default_refill_rate")]
    pub refill_rate: f64,
    #[serde(default = "default_cost")]
    pub default_cost: f64,
    /// Use the database-backed governor. Disable only for single-worker
    /// deployments.
    #[serde(default = "default_true")]
    pub distributed: bool,
    #[serde(default = "default_state_key")]
    pub state_key: String,
}

fn default_max_tokens() -> f64 {
    100.0
}
fn default_refill_rate() -> f64 {
    0.67
}
fn default_cost() -> f64 {
    20.0
}
fn default_true() -> bool {
    true
}
fn default_state_key() -> String {
    "hyperliquid".into()
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_upstream_url")]
    pub base_url: String,
    #[serde(default = "default_upstream_timeout")]
    pub timeout_secs: u64,
}

fn default_upstream_url() -> String {
    "https://api.hyperliquid.xyz".into()
}
fn default_upstream_timeout() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub json_output: bool,
}

fn default_log_level() -> String {
    "info".into()
}

impl Config {
    /// Load configuration from `config/default.toml` merged with env vars
    /// prefixed with `HL_`. Deployment values come from plain env vars.
    pub fn load() -> anyhow::Result<Self> {
        let builder = config::Config::builder()
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(
                config::Environment::with_prefix("HL")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let mut cfg: Config = builder.try_deserialize()?;

        if let Ok(v) = env::var("DATABASE_URL") {
            cfg.database.url = v;
        }
        if let Ok(v) = env::var("ORG_ID") {
            cfg.org.id = v;
        }
        if let Ok(v) = env::var("WORKER_ID") {
            cfg.worker.id = Some(v);
        }

        Ok(cfg)
    }

    /// Parse the configured org id, which is required for every process.
    pub fn org_uuid(&self) -> anyhow::Result<Uuid> {
        if self.org.id.is_empty() {
            anyhow::bail!("ORG_ID is required");
        }
        Ok(Uuid::parse_str(&self.org.id)?)
    }

    /// Worker identity used in job leases.
    pub fn worker_id(&self) -> String {
        self.worker
            .id
            .clone()
            .unwrap_or_else(|| format!("worker-{}", std::process::id()))
    }
}
