use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Jobs allowed in `Running` at once; the rest wait in FIFO order.
    #[serde(default = "default_max_running_jobs")]
    pub max_running_jobs: usize,
    #[serde(default = "default_job_timeout_secs")]
    pub default_job_timeout_secs: u64,
    #[serde(default = "default_batch_concurrency")]
    pub batch_concurrency: usize,
    #[serde(default = "default_batch_item_timeout_secs")]
    pub batch_item_timeout_secs: u64,
    #[serde(default = "default_batch_pool_size")]
    pub batch_pool_size: usize,
    /// Time between SIGTERM and SIGKILL when stopping a process.
    #[serde(default = "default_kill_grace_ms")]
    pub kill_grace_ms: u64,
    #[serde(default = "default_log_max_lines")]
    pub log_max_lines: usize,
    #[serde(default = "default_log_tail")]
    pub default_log_tail: usize,
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    /// Age after which finished jobs are pruned; 0 keeps them forever.
    #[serde(default = "default_job_ttl_secs")]
    pub job_ttl_secs: u64,
}

fn default_max_running_jobs() -> usize {
    2
}

fn default_job_timeout_secs() -> u64 {
    0
}

fn default_batch_concurrency() -> usize {
    2
}

fn default_batch_item_timeout_secs() -> u64 {
    300 // 5 minutes per item
}

fn default_batch_pool_size() -> usize {
    8
}

fn default_kill_grace_ms() -> u64 {
    2000
}

fn default_log_max_lines() -> usize {
    100_000
}

fn default_log_tail() -> usize {
    50
}

fn default_event_capacity() -> usize {
    4096
}

fn default_job_ttl_secs() -> u64 {
    0
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_running_jobs: default_max_running_jobs(),
            default_job_timeout_secs: default_job_timeout_secs(),
            batch_concurrency: default_batch_concurrency(),
            batch_item_timeout_secs: default_batch_item_timeout_secs(),
            batch_pool_size: default_batch_pool_size(),
            kill_grace_ms: default_kill_grace_ms(),
            log_max_lines: default_log_max_lines(),
            default_log_tail: default_log_tail(),
            event_capacity: default_event_capacity(),
            job_ttl_secs: default_job_ttl_secs(),
        }
    }
}

impl RunnerConfig {
    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    /// Effective timeout for a job: its own budget if set, else the default.
    pub fn job_timeout(&self, job_timeout_secs: u64) -> Option<Duration> {
        let secs = if job_timeout_secs > 0 {
            job_timeout_secs
        } else {
            self.default_job_timeout_secs
        };
        (secs > 0).then(|| Duration::from_secs(secs))
    }

    pub fn batch_item_timeout(&self) -> Option<Duration> {
        (self.batch_item_timeout_secs > 0).then(|| Duration::from_secs(self.batch_item_timeout_secs))
    }

    pub fn job_ttl(&self) -> Option<Duration> {
        (self.job_ttl_secs > 0).then(|| Duration::from_secs(self.job_ttl_secs))
    }
}

/// Load the RunnerConfig using this resolution order:
///   1. explicit path (must exist)
///   2. PJOBS_CONFIG_DIR environment variable (`config.json` inside it)
///   3. platform config dir (`dirs::config_dir()/pipeline-jobs/config.json`)
///   4. RunnerConfig::default()
pub fn load_config(config_path: Option<&Path>) -> Result<RunnerConfig> {
    if let Some(path) = config_path {
        if path.exists() {
            let config = read_config(path)?;
            tracing::info!("Loaded config from: {}", path.display());
            return Ok(config);
        }
        return Err(anyhow::anyhow!("Config file not found: {}", path.display()));
    }

    if let Ok(config_dir) = std::env::var("PJOBS_CONFIG_DIR") {
        let path = PathBuf::from(&config_dir).join("config.json");
        if path.exists() {
            let config = read_config(&path).context("Failed to load config from PJOBS_CONFIG_DIR")?;
            tracing::info!("Loaded config from PJOBS_CONFIG_DIR: {}", path.display());
            return Ok(config);
        }
    }

    if let Some(config_dir) = dirs::config_dir() {
        let path = config_dir.join("pipeline-jobs").join("config.json");
        if path.exists() {
            let config = read_config(&path)?;
            tracing::info!("Loaded config from: {}", path.display());
            return Ok(config);
        }
    }

    tracing::debug!("No config file found, using defaults");
    Ok(RunnerConfig::default())
}

fn read_config(path: &Path) -> Result<RunnerConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    let config: RunnerConfig = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse config file {}", path.display()))?;
    Ok(config)
}
