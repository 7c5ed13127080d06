//! Configuration structures and loading logic

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

/// Main gateway configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub management_port: u16,
    pub inference_port: u16,
    pub state_file: PathBuf,
    pub auto_restore_on_restart: bool,
    pub max_models: Option<usize>,

    pub worker_binary_path: String,
    pub worker_log_dir: PathBuf,
    /// Port range for worker auto-allocation [start, end)
    pub worker_port_start: u16,
    pub worker_port_end: u16,

    pub heartbeat_interval_ms: u64,
    pub heartbeat_timeout_ms: u64,
    pub startup_timeout_ms: u64,
    pub restart_backoff_base_ms: u64,
    pub restart_backoff_max_ms: u64,
    pub healthy_reset_ms: u64,
    pub kill_timeout_ms: u64,

    pub default_queue_depth: usize,
    pub request_timeout_ms: u64,
    pub max_request_timeout_ms: u64,
    pub drain_grace_ms: u64,
    pub shutdown_grace_ms: u64,

    pub models: Vec<ModelConfig>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            management_port: default_management_port(),
            inference_port: default_inference_port(),
            state_file: default_state_file(),
            auto_restore_on_restart: false,
            max_models: None,
            worker_binary_path: default_worker_binary_path(),
            worker_log_dir: default_worker_log_dir(),
            worker_port_start: 9100,
            worker_port_end: 9300,
            heartbeat_interval_ms: 1_000,
            heartbeat_timeout_ms: 5_000,
            startup_timeout_ms: 120_000,
            restart_backoff_base_ms: 500,
            restart_backoff_max_ms: 30_000,
            healthy_reset_ms: 60_000,
            kill_timeout_ms: 5_000,
            default_queue_depth: 100,
            request_timeout_ms: 30_000,
            max_request_timeout_ms: 300_000,
            drain_grace_ms: 30_000,
            shutdown_grace_ms: 30_000,
            models: Vec::new(),
        }
    }
}

impl GatewayConfig {
    /// Load configuration from file with environment variable overrides
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            toml::from_str(&content).context("Failed to parse TOML config")?
        } else {
            Self::default()
        };

        if let Ok(port) = std::env::var("GATEWAY_MANAGEMENT_PORT") {
            config.management_port = port
                .parse()
                .context("Invalid GATEWAY_MANAGEMENT_PORT value")?;
        }
        if let Ok(port) = std::env::var("GATEWAY_INFERENCE_PORT") {
            config.inference_port = port
                .parse()
                .context("Invalid GATEWAY_INFERENCE_PORT value")?;
        }
        if let Ok(state_file) = std::env::var("GATEWAY_STATE_FILE") {
            config.state_file = PathBuf::from(state_file);
        }
        if let Ok(binary_path) = std::env::var("GATEWAY_WORKER_BINARY") {
            config.worker_binary_path = binary_path;
        }
        if let Ok(log_dir) = std::env::var("GATEWAY_WORKER_LOG_DIR") {
            config.worker_log_dir = PathBuf::from(log_dir);
        }

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.management_port < 1024 || self.inference_port < 1024 {
            anyhow::bail!(
                "Listener ports must be >= 1024 (got management={}, inference={})",
                self.management_port,
                self.inference_port
            );
        }
        if self.management_port == self.inference_port {
            anyhow::bail!(
                "Management and inference listeners cannot share port {}",
                self.management_port
            );
        }

        if self.worker_port_start >= self.worker_port_end {
            anyhow::bail!(
                "Worker port range [{}, {}) is empty",
                self.worker_port_start,
                self.worker_port_end
            );
        }
        for port in [self.management_port, self.inference_port] {
            if (self.worker_port_start..self.worker_port_end).contains(&port) {
                anyhow::bail!("Listener port {} overlaps the worker port range", port);
            }
        }

        if self.heartbeat_interval_ms == 0 {
            anyhow::bail!("heartbeat_interval_ms must be > 0");
        }
        if self.heartbeat_timeout_ms < self.heartbeat_interval_ms {
            anyhow::bail!(
                "heartbeat_timeout_ms ({}) must be >= heartbeat_interval_ms ({})",
                self.heartbeat_timeout_ms,
                self.heartbeat_interval_ms
            );
        }
        if self.restart_backoff_base_ms > self.restart_backoff_max_ms {
            anyhow::bail!("restart_backoff_base_ms cannot exceed restart_backoff_max_ms");
        }
        if self.default_queue_depth == 0 {
            anyhow::bail!("default_queue_depth must be >= 1");
        }
        if self.request_timeout_ms > self.max_request_timeout_ms {
            anyhow::bail!("request_timeout_ms cannot exceed max_request_timeout_ms");
        }

        let mut names = HashSet::new();
        for model in &self.models {
            validate_model_name(&model.name)?;
            if model.instance_count == 0 {
                anyhow::bail!("Model '{}' must have instance_count >= 1", model.name);
            }
            if model.instance_count > self.worker_port_capacity() {
                anyhow::bail!(
                    "Model '{}' wants {} instances but the worker port range holds {}",
                    model.name,
                    model.instance_count,
                    self.worker_port_capacity()
                );
            }
            if !names.insert(&model.name) {
                anyhow::bail!("Duplicate model name: {}", model.name);
            }
        }
        if let Some(max) = self.max_models
            && self.models.len() > max
        {
            anyhow::bail!("{} seeded models exceed max_models ({})", self.models.len(), max);
        }

        // Ensure state file directory exists or can be created
        if let Some(parent) = self.state_file.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Cannot create state file directory: {:?}", parent))?;
        }

        Ok(())
    }

    /// Most workers one model can run at once: one port each
    pub fn worker_port_capacity(&self) -> usize {
        usize::from(self.worker_port_end.saturating_sub(self.worker_port_start))
    }

    pub fn supervisor_settings(&self) -> SupervisorSettings {
        SupervisorSettings {
            worker_binary_path: self.worker_binary_path.clone(),
            worker_log_dir: self.worker_log_dir.clone(),
            worker_port_range: (self.worker_port_start, self.worker_port_end),
            heartbeat_interval: Duration::from_millis(self.heartbeat_interval_ms),
            heartbeat_timeout: Duration::from_millis(self.heartbeat_timeout_ms),
            startup_timeout: Duration::from_millis(self.startup_timeout_ms),
            restart_backoff_base: Duration::from_millis(self.restart_backoff_base_ms),
            restart_backoff_max: Duration::from_millis(self.restart_backoff_max_ms),
            healthy_reset: Duration::from_millis(self.healthy_reset_ms),
            kill_timeout: Duration::from_millis(self.kill_timeout_ms),
            drain_grace: Duration::from_millis(self.drain_grace_ms),
        }
    }

    pub fn router_settings(&self) -> RouterSettings {
        RouterSettings {
            request_timeout: Duration::from_millis(self.request_timeout_ms),
            max_request_timeout: Duration::from_millis(self.max_request_timeout_ms),
        }
    }
}

/// Timing and process knobs consumed by the supervisor
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub worker_binary_path: String,
    pub worker_log_dir: PathBuf,
    pub worker_port_range: (u16, u16),
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub startup_timeout: Duration,
    pub restart_backoff_base: Duration,
    pub restart_backoff_max: Duration,
    pub healthy_reset: Duration,
    pub kill_timeout: Duration,
    pub drain_grace: Duration,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        GatewayConfig::default().supervisor_settings()
    }
}

/// Deadline knobs consumed by the router
#[derive(Debug, Clone)]
pub struct RouterSettings {
    pub request_timeout: Duration,
    pub max_request_timeout: Duration,
}

impl Default for RouterSettings {
    fn default() -> Self {
        GatewayConfig::default().router_settings()
    }
}

/// A model to register, either seeded from config or restored from state
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ModelConfig {
    pub name: String,
    pub artifact: String,

    #[serde(default = "default_instance_count")]
    pub instance_count: usize,

    /// Bounded queue depth; falls back to `default_queue_depth`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_depth: Option<usize>,

    /// Concurrent requests a single worker may serve
    #[serde(default = "default_slots_per_instance")]
    pub slots_per_instance: usize,

    /// Additional CLI args passed to the worker binary
    #[serde(default)]
    pub extra_args: Vec<String>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            artifact: String::new(),
            instance_count: default_instance_count(),
            queue_depth: None,
            slots_per_instance: default_slots_per_instance(),
            extra_args: Vec::new(),
        }
    }
}

/// Model names become URL path segments and log file names
pub fn validate_model_name(name: &str) -> Result<()> {
    if name.is_empty() {
        anyhow::bail!("Model name cannot be empty");
    }
    if name.contains('/') || name.contains('\\') {
        anyhow::bail!("Model name '{}' cannot contain path separators", name);
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        anyhow::bail!(
            "Model name '{}' may only contain ASCII letters, digits, '-', '_' and '.'",
            name
        );
    }
    Ok(())
}

// Default functions
fn default_management_port() -> u16 {
    8081
}
fn default_inference_port() -> u16 {
    8080
}
fn default_state_file() -> PathBuf {
    PathBuf::from("/data/inference-gateway-state.toml")
}
fn default_worker_binary_path() -> String {
    "model-worker".to_string()
}
fn default_worker_log_dir() -> PathBuf {
    PathBuf::from("/tmp/inference-gateway/logs")
}
fn default_instance_count() -> usize {
    1
}
fn default_slots_per_instance() -> usize {
    1
}
