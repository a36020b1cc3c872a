use crate::ack_policy::DatafeedVersion;
use crate::retry::RetryConfig;
use crate::rotation::LoadBalancingMode;
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::info;

const DEFAULT_CONFIG_PATH: &str = "config.toml";

#[derive(Debug, Clone, Deserialize)]
pub struct NodePoolConfig {
    pub nodes: Vec<String>,
    #[serde(default)]
    pub policy: LoadBalancingMode,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default = "default_unhealthy_cooldown_seconds")]
    pub unhealthy_cooldown_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatafeedConfig {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default = "default_poll_timeout_seconds")]
    pub poll_timeout_seconds: u64,
    #[serde(default = "default_rotate_after_failures")]
    pub rotate_after_failures: u32,
}

impl Default for DatafeedConfig {
    fn default() -> Self {
        Self {
            version: default_version(),
            poll_timeout_seconds: default_poll_timeout_seconds(),
            rotate_after_failures: default_rotate_after_failures(),
        }
    }
}

impl DatafeedConfig {
    pub fn version(&self) -> DatafeedVersion {
        DatafeedVersion::of(&self.version)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs(self.poll_timeout_seconds)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_interval_ms")]
    pub initial_interval_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_max_interval_ms")]
    pub max_interval_ms: u64,
    #[serde(default)]
    pub deadline_ms: Option<u64>,
    #[serde(default)]
    pub jitter: bool,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_interval_ms: default_initial_interval_ms(),
            multiplier: default_multiplier(),
            max_interval_ms: default_max_interval_ms(),
            deadline_ms: None,
            jitter: false,
        }
    }
}

impl RetrySettings {
    pub fn to_retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_attempts,
            initial_interval: Duration::from_millis(self.initial_interval_ms),
            multiplier: self.multiplier,
            max_interval: Duration::from_millis(self.max_interval_ms),
            deadline: self.deadline_ms.map(Duration::from_millis),
            jitter: self.jitter,
        }
    }
}

#[derive(Clone, Deserialize)]
pub struct AuthConfig {
    pub session_token: String,
    #[serde(default)]
    pub key_manager_token: Option<String>,
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("session_token", &"<redacted>")
            .field("key_manager_token", &self.key_manager_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Nodes serving the datafeed.
    pub agent: NodePoolConfig,
    /// Nodes serving stateless session calls.
    pub pod: NodePoolConfig,
    #[serde(default)]
    pub datafeed: DatafeedConfig,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub auth: Option<AuthConfig>,
}

impl Config {
    /// Loads `config.toml` from the working directory.
    pub fn new() -> Result<Self> {
        Self::from_file(DEFAULT_CONFIG_PATH)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let config_str = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config = Self::from_toml_str(&config_str)?;
        info!(
            "Config loaded from {}: agent nodes {:?}, pod nodes {:?}, datafeed {}",
            path.display(),
            config.agent.nodes,
            config.pod.nodes,
            config.datafeed.version()
        );
        Ok(config)
    }

    pub fn from_toml_str(config_str: &str) -> Result<Self> {
        let config: Config = toml::from_str(config_str).context("invalid config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        validate_pool("agent", &self.agent)?;
        validate_pool("pod", &self.pod)?;

        let retry = &self.retry;
        if retry.max_attempts < 1 {
            bail!("retry.max_attempts must be at least 1");
        }
        if !(retry.multiplier >= 1.0) {
            bail!("retry.multiplier must be >= 1.0, got {}", retry.multiplier);
        }
        if retry.initial_interval_ms > retry.max_interval_ms {
            bail!(
                "retry.initial_interval_ms ({}) exceeds retry.max_interval_ms ({})",
                retry.initial_interval_ms,
                retry.max_interval_ms
            );
        }
        if self.datafeed.poll_timeout_seconds == 0 {
            bail!("datafeed.poll_timeout_seconds must be positive");
        }
        Ok(())
    }
}

fn validate_pool(section: &str, pool: &NodePoolConfig) -> Result<()> {
    if pool.nodes.is_empty() {
        bail!("{}.nodes must list at least one node", section);
    }
    for node in &pool.nodes {
        let url = url::Url::parse(node)
            .with_context(|| format!("{}.nodes contains an invalid address: {}", section, node))?;
        if url.scheme() != "http" && url.scheme() != "https" {
            bail!("{}.nodes entry {} must use http or https", section, node);
        }
    }
    Ok(())
}

fn default_unhealthy_cooldown_seconds() -> u64 {
    30
}

fn default_version() -> String {
    "v2".to_string()
}

fn default_poll_timeout_seconds() -> u64 {
    30
}

fn default_rotate_after_failures() -> u32 {
    3
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_interval_ms() -> u64 {
    500
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_interval_ms() -> u64 {
    10_000
}
