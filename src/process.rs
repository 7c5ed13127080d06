//! Worker process lifecycle (spawn, signal, reap)

use crate::backend::{HttpBackend, InferenceBackend};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::RwLock;

// ============================================================================
// Trait Definitions
// ============================================================================

/// Configuration for spawning one worker process
#[derive(Debug, Clone)]
pub struct SpawnConfig {
    pub instance_id: String,
    pub model_name: String,
    pub artifact: String,
    pub binary_path: String,
    pub port: u16,
    pub log_dir: PathBuf,
    pub extra_args: Vec<String>,
}

/// Opaque handle to a spawned process
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProcessHandle {
    id: String,
}

impl ProcessHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

/// Trait for managing worker process lifecycle
#[async_trait]
pub trait ProcessManager: Send + Sync {
    /// Spawn a new worker process
    async fn spawn(&self, config: &SpawnConfig) -> Result<ProcessHandle>;

    /// Stop a process gracefully, force-killing it after `timeout`
    async fn stop(&self, handle: &ProcessHandle, timeout: Duration) -> Result<()>;

    /// Check if the process is still alive
    async fn is_running(&self, handle: &ProcessHandle) -> bool;

    /// Get process ID
    async fn pid(&self, handle: &ProcessHandle) -> Option<u32>;

    /// Build the backend client used to reach a spawned worker
    fn connect(
        &self,
        handle: &ProcessHandle,
        config: &SpawnConfig,
    ) -> Result<Arc<dyn InferenceBackend>>;
}

// ============================================================================
// Production Implementation
// ============================================================================

/// Production process manager using tokio::process
pub struct SystemProcessManager {
    processes: Arc<RwLock<HashMap<String, Child>>>,
    client: reqwest::Client,
}

impl SystemProcessManager {
    pub fn new() -> Self {
        Self {
            processes: Arc::new(RwLock::new(HashMap::new())),
            client: reqwest::Client::new(),
        }
    }
}

impl Default for SystemProcessManager {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProcessManager for SystemProcessManager {
    async fn spawn(&self, config: &SpawnConfig) -> Result<ProcessHandle> {
        let mut cmd = Command::new(&config.binary_path);

        cmd.arg("--model-name").arg(&config.model_name);
        cmd.arg("--artifact").arg(&config.artifact);
        cmd.arg("--port").arg(config.port.to_string());
        for arg in &config.extra_args {
            cmd.arg(arg);
        }

        std::fs::create_dir_all(&config.log_dir).with_context(|| {
            format!("Failed to create worker log directory: {:?}", config.log_dir)
        })?;

        let log_path = config.log_dir.join(format!("{}.log", config.instance_id));
        let log_file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .with_context(|| format!("Failed to open log file: {:?}", log_path))?;

        let stdout_file = log_file
            .try_clone()
            .context("Failed to clone log file for stdout")?;

        let child = cmd
            .stdout(stdout_file)
            .stderr(log_file)
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn worker '{}'", config.binary_path))?;

        let pid = child.id().context("Failed to get PID")?;
        let handle = ProcessHandle::new(format!("process_{}", pid));

        tracing::info!(
            instance = %config.instance_id,
            model = %config.model_name,
            port = config.port,
            pid = pid,
            "Worker process spawned"
        );

        self.processes
            .write()
            .await
            .insert(handle.id.clone(), child);

        Ok(handle)
    }

    async fn stop(&self, handle: &ProcessHandle, timeout: Duration) -> Result<()> {
        // Take the child out so the map lock isn't held while waiting
        let child = self.processes.write().await.remove(&handle.id);

        let Some(mut child) = child else {
            return Ok(());
        };

        #[cfg(unix)]
        if let Some(pid) = child.id() {
            use nix::sys::signal::{Signal, kill};
            use nix::unistd::Pid;

            let pid = Pid::from_raw(pid as i32);
            let _ = kill(pid, Signal::SIGTERM);

            tokio::select! {
                _ = child.wait() => {
                    tracing::debug!(handle = %handle.id, "Worker stopped gracefully");
                }
                _ = tokio::time::sleep(timeout) => {
                    tracing::warn!(handle = %handle.id, "Graceful stop timed out, sending SIGKILL");
                    let _ = kill(pid, Signal::SIGKILL);
                    let _ = child.wait().await;
                }
            }
            return Ok(());
        }

        let _ = child.kill().await;
        Ok(())
    }

    async fn is_running(&self, handle: &ProcessHandle) -> bool {
        let mut processes = self.processes.write().await;
        match processes.get_mut(&handle.id) {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    async fn pid(&self, handle: &ProcessHandle) -> Option<u32> {
        let processes = self.processes.read().await;
        processes.get(&handle.id).and_then(|p| p.id())
    }

    fn connect(
        &self,
        _handle: &ProcessHandle,
        config: &SpawnConfig,
    ) -> Result<Arc<dyn InferenceBackend>> {
        Ok(Arc::new(HttpBackend::new(
            self.client.clone(),
            &config.model_name,
            config.port,
        )))
    }
}

// ============================================================================
// Mock Implementation for Testing
// ============================================================================
