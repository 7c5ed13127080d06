//! State persistence for registered models

use crate::config::ModelConfig;
use crate::registry::Registry;
use crate::supervisor::Supervisor;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::fs;
use tokio::io::AsyncWriteExt;

// ============================================================================
// Trait Definitions
// ============================================================================

/// Trait for storage backend operations
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Save content to a file path atomically
    async fn save(&self, path: &Path, content: &str) -> Result<()>;

    /// Load content from a file path
    /// Returns None if file doesn't exist
    async fn load(&self, path: &Path) -> Result<Option<String>>;
}

// ============================================================================
// Production Implementation
// ============================================================================

/// Production storage backend using tokio::fs
#[derive(Default)]
pub struct FileSystemStorage;

#[async_trait]
impl StorageBackend for FileSystemStorage {
    async fn save(&self, path: &Path, content: &str) -> Result<()> {
        // Atomic write: write to temp file, then rename
        let temp_file = path.with_extension("tmp");

        let mut file = fs::File::create(&temp_file)
            .await
            .context("Failed to create temp state file")?;
        file.write_all(content.as_bytes())
            .await
            .context("Failed to write state file")?;
        file.sync_all().await.context("Failed to sync state file")?;

        fs::rename(&temp_file, path)
            .await
            .context("Failed to rename temp state file")?;

        Ok(())
    }

    async fn load(&self, path: &Path) -> Result<Option<String>> {
        if !fs::try_exists(path).await.unwrap_or(false) {
            return Ok(None);
        }

        let content = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read state file: {:?}", path))?;

        Ok(Some(content))
    }
}

// ============================================================================
// State Manager
// ============================================================================

/// On-disk form of the registry
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct SavedState {
    pub last_updated: chrono::DateTime<chrono::Utc>,
    pub models: Vec<ModelConfig>,
}

/// Outcome of a restore or seed pass
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RestoreSummary {
    pub restored: usize,
    pub failed: usize,
}

/// Persists registered models and brings them back on start
pub struct StateManager {
    state_file: PathBuf,
    registry: Arc<Registry>,
    supervisor: Arc<Supervisor>,
    storage: Arc<dyn StorageBackend>,
    /// Serializes writers so temp-file renames never interleave
    save_lock: tokio::sync::Mutex<()>,
    restore_in_progress: AtomicBool,
}

impl StateManager {
    /// Create a new state manager with custom storage backend
    pub fn new_with_storage(
        state_file: PathBuf,
        registry: Arc<Registry>,
        supervisor: Arc<Supervisor>,
        storage: Arc<dyn StorageBackend>,
    ) -> Self {
        Self {
            state_file,
            registry,
            supervisor,
            storage,
            save_lock: tokio::sync::Mutex::new(()),
            restore_in_progress: AtomicBool::new(false),
        }
    }

    /// Create a new state manager with default filesystem storage
    pub fn new(state_file: PathBuf, registry: Arc<Registry>, supervisor: Arc<Supervisor>) -> Self {
        Self::new_with_storage(
            state_file,
            registry,
            supervisor,
            Arc::new(FileSystemStorage),
        )
    }

    /// Save current registry to disk atomically
    pub async fn save(&self) -> Result<()> {
        let _guard = self.save_lock.lock().await;

        let state = SavedState {
            last_updated: chrono::Utc::now(),
            models: self.registry.list().iter().map(|e| e.to_config()).collect(),
        };

        let toml_content =
            toml::to_string_pretty(&state).context("Failed to serialize state to TOML")?;

        self.storage.save(&self.state_file, &toml_content).await?;

        tracing::debug!(
            path = ?self.state_file,
            models = state.models.len(),
            "State saved"
        );

        Ok(())
    }

    /// Load state from disk
    /// Fails hard if the state file is corrupted; the operator must fix or delete it
    pub async fn load(&self) -> Result<SavedState> {
        let Some(content) = self.storage.load(&self.state_file).await? else {
            tracing::info!("No state file found, starting fresh");
            return Ok(SavedState::default());
        };

        let state: SavedState = toml::from_str(&content).with_context(|| {
            format!(
                "Failed to parse state file: {:?}. File may be corrupted. \
                Please delete or fix the file manually.",
                self.state_file
            )
        })?;

        tracing::info!(
            models = state.models.len(),
            last_updated = %state.last_updated,
            "State loaded from disk"
        );

        Ok(state)
    }

    /// Re-register every saved model and start its workers
    pub async fn restore(&self) -> Result<RestoreSummary> {
        if self
            .restore_in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            anyhow::bail!("Restore operation already in progress");
        }
        let _guard = RestoreGuard {
            flag: &self.restore_in_progress,
        };

        let state = self.load().await?;
        Ok(self.seed(state.models).await)
    }

    /// Register and ensure a batch of models, logging failures instead of aborting
    pub async fn seed(&self, models: Vec<ModelConfig>) -> RestoreSummary {
        let mut summary = RestoreSummary::default();

        for config in models {
            let name = config.name.clone();
            let result = match self.registry.register(config) {
                Ok(_) => self.supervisor.ensure(&name).await.map(|_| ()),
                Err(e) => Err(e),
            };

            match result {
                Ok(()) => summary.restored += 1,
                Err(e) => {
                    tracing::error!(model = %name, error = %e, "Failed to restore model");
                    summary.failed += 1;
                }
            }
        }

        tracing::info!(
            restored = summary.restored,
            failed = summary.failed,
            "Model restoration complete"
        );

        summary
    }
}

/// RAII guard to ensure restore_in_progress flag is cleared on drop
struct RestoreGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for RestoreGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}
