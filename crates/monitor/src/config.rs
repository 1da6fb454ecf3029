use std::path::Path;
use std::time::Duration;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Configuration for the job monitor engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Base URL of the job backend (e.g., http://127.0.0.1:9999)
    pub server_url: String,
    /// Allow the push channel when the backend advertises it
    pub push_enabled: bool,
    /// Connect attempts before the push channel is given up for the session
    pub push_connect_attempts: u32,
    /// Wait between push connect attempts, in milliseconds
    pub push_retry_delay_ms: u64,
    /// Light poll cadence while the push channel is healthy, in milliseconds
    pub push_heartbeat_ms: u64,
    /// Poll interval while any job is non-terminal, in milliseconds
    pub active_poll_ms: u64,
    /// Idle wait on entering poll-idle, in milliseconds
    pub idle_floor_ms: u64,
    /// Idle wait once idleness re-confirms, in milliseconds
    pub idle_baseline_ms: u64,
    /// Upper bound for the idle wait, in milliseconds
    pub idle_ceiling_ms: u64,
    /// Multiplier applied to the idle wait on every idle tick
    pub idle_growth: f64,
    /// Upper bound for the wait after failed refreshes, in milliseconds
    pub failure_ceiling_ms: u64,
    /// Consecutive refresh failures before a degraded notice is raised
    pub degraded_after_failures: u32,
    /// Window in which coverage requests reuse the last result, in milliseconds
    pub coverage_cooldown_ms: u64,
    /// Artifact categories reported by scoped (local) coverage
    pub coverage_categories: Vec<String>,
    /// Timeout for job-list, coverage and command requests, in seconds
    pub request_timeout_secs: u64,
    /// Capacity of the update broadcast channel
    pub update_buffer: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self::default_config()
    }
}

impl MonitorConfig {
    /// Create a default configuration with sensible values
    pub fn default_config() -> Self {
        Self {
            server_url: "http://127.0.0.1:9999".to_string(),
            push_enabled: true,
            push_connect_attempts: 3,
            push_retry_delay_ms: 2_000,
            push_heartbeat_ms: 30_000,
            active_poll_ms: 2_000,
            idle_floor_ms: 5_000,
            idle_baseline_ms: 15_000,
            idle_ceiling_ms: 60_000,
            idle_growth: 1.5,
            failure_ceiling_ms: 60_000,
            degraded_after_failures: 3,
            coverage_cooldown_ms: 1_500,
            coverage_categories: ["thumbnail", "preview", "sprite", "phash", "transcode", "index"]
                .iter()
                .map(|c| c.to_string())
                .collect(),
            request_timeout_secs: 15,
            update_buffer: 256,
        }
    }

    /// Load configuration from a file, or return defaults if path is None or file doesn't exist
    pub fn load_config(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::default_config();

        if let Some(config_path) = path {
            if config_path.exists() {
                let content = std::fs::read_to_string(config_path)
                    .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

                // TOML by extension, JSON otherwise
                if config_path.extension().and_then(|s| s.to_str()) == Some("toml") {
                    config = toml::from_str(&content)
                        .with_context(|| format!("Failed to parse TOML config: {}", config_path.display()))?;
                } else {
                    config = serde_json::from_str(&content)
                        .with_context(|| format!("Failed to parse JSON config: {}", config_path.display()))?;
                }
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject values that would turn the poll loop into a busy loop or never back off
    pub fn validate(&self) -> Result<()> {
        if self.active_poll_ms == 0 || self.idle_floor_ms == 0 {
            anyhow::bail!("Poll intervals must be greater than zero");
        }
        if self.idle_floor_ms > self.idle_ceiling_ms || self.idle_baseline_ms > self.idle_ceiling_ms {
            anyhow::bail!(
                "Idle floor ({}ms) and baseline ({}ms) must not exceed the ceiling ({}ms)",
                self.idle_floor_ms,
                self.idle_baseline_ms,
                self.idle_ceiling_ms
            );
        }
        if !self.idle_growth.is_finite() || self.idle_growth < 1.0 {
            anyhow::bail!("idle_growth must be a finite value >= 1.0, got {}", self.idle_growth);
        }
        if self.update_buffer == 0 {
            anyhow::bail!("update_buffer must be greater than zero");
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn coverage_cooldown(&self) -> Duration {
        Duration::from_millis(self.coverage_cooldown_ms)
    }
}
