//! Thread-safe model registry

use crate::config::{ModelConfig, validate_model_name};
use crate::error::{GatewayError, GatewayResult};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Model lifecycle state as seen by API clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelState {
    Unregistered,
    Loading,
    Healthy,
    Degraded,
    Unloading,
}

/// A registered model
#[derive(Debug, Clone, Serialize)]
pub struct ModelEntry {
    pub name: String,
    pub artifact: String,
    pub instance_count: usize,
    pub queue_depth: usize,
    pub slots_per_instance: usize,
    pub extra_args: Vec<String>,
    pub state: ModelState,
    pub created_at: chrono::DateTime<chrono::Utc>,
    /// Distinguishes this registration from earlier ones under the same name
    pub generation: u64,
}

impl ModelEntry {
    /// Config form used for persistence
    pub fn to_config(&self) -> ModelConfig {
        ModelConfig {
            name: self.name.clone(),
            artifact: self.artifact.clone(),
            instance_count: self.instance_count,
            queue_depth: Some(self.queue_depth),
            slots_per_instance: self.slots_per_instance,
            extra_args: self.extra_args.clone(),
        }
    }
}

/// Registry of loadable models
///
/// Entries live in a sharded map, so mutating one model never blocks readers
/// or writers of another.
pub struct Registry {
    models: DashMap<String, ModelEntry>,
    max_models: Option<usize>,
    max_instances: Option<usize>,
    default_queue_depth: usize,
    /// Registered models plus in-progress registrations holding a reservation
    reserved: AtomicUsize,
    next_generation: AtomicU64,
}

impl Registry {
    pub fn new(max_models: Option<usize>, default_queue_depth: usize) -> Self {
        Self {
            models: DashMap::new(),
            max_models,
            max_instances: None,
            default_queue_depth: default_queue_depth.max(1),
            reserved: AtomicUsize::new(0),
            next_generation: AtomicU64::new(1),
        }
    }

    /// Cap `instance_count` per model, typically at the size of the worker port range
    pub fn with_instance_limit(mut self, limit: usize) -> Self {
        self.max_instances = Some(limit.max(1));
        self
    }

    /// Register a model. Fails if the name is already present.
    pub fn register(&self, config: ModelConfig) -> GatewayResult<ModelEntry> {
        validate_model_name(&config.name).map_err(|e| GatewayError::Validation {
            message: e.to_string(),
        })?;
        if config.artifact.trim().is_empty() {
            return Err(GatewayError::Validation {
                message: format!("Model '{}' has an empty artifact location", config.name),
            });
        }
        if config.instance_count == 0 {
            return Err(GatewayError::Validation {
                message: "instanceCount must be >= 1".to_string(),
            });
        }
        if config.slots_per_instance == 0 || config.queue_depth == Some(0) {
            return Err(GatewayError::Validation {
                message: "queueDepth and slotsPerInstance must be >= 1".to_string(),
            });
        }

        if let Some(limit) = self.max_instances
            && config.instance_count > limit
        {
            return Err(GatewayError::Validation {
                message: format!(
                    "instanceCount {} exceeds the worker port range ({} ports)",
                    config.instance_count, limit
                ),
            });
        }

        // Reserve a place under the cap before touching the map; released on duplicate
        let max = self.max_models.unwrap_or(usize::MAX);
        if self
            .reserved
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n < max).then_some(n + 1))
            .is_err()
        {
            return Err(GatewayError::Validation {
                message: format!("Maximum model count ({}) reached", max),
            });
        }

        match self.models.entry(config.name.clone()) {
            Entry::Occupied(_) => {
                self.reserved.fetch_sub(1, Ordering::SeqCst);
                Err(GatewayError::DuplicateModel { name: config.name })
            }
            Entry::Vacant(slot) => {
                let entry = ModelEntry {
                    name: config.name,
                    artifact: config.artifact,
                    instance_count: config.instance_count,
                    queue_depth: config.queue_depth.unwrap_or(self.default_queue_depth),
                    slots_per_instance: config.slots_per_instance,
                    extra_args: config.extra_args,
                    state: ModelState::Loading,
                    created_at: chrono::Utc::now(),
                    generation: self.next_generation.fetch_add(1, Ordering::SeqCst),
                };

                tracing::info!(
                    model = %entry.name,
                    generation = entry.generation,
                    artifact = %entry.artifact,
                    instance_count = entry.instance_count,
                    queue_depth = entry.queue_depth,
                    "Model registered"
                );

                slot.insert(entry.clone());
                Ok(entry)
            }
        }
    }

    /// Remove a model, returning its last entry
    pub fn unregister(&self, name: &str) -> GatewayResult<ModelEntry> {
        let (_, mut entry) = self
            .models
            .remove(name)
            .ok_or_else(|| GatewayError::NotFound {
                name: name.to_string(),
            })?;

        self.reserved.fetch_sub(1, Ordering::SeqCst);
        entry.state = ModelState::Unregistered;
        tracing::info!(model = %name, "Model unregistered");

        Ok(entry)
    }

    pub fn lookup(&self, name: &str) -> GatewayResult<ModelEntry> {
        self.models
            .get(name)
            .map(|e| e.value().clone())
            .ok_or_else(|| GatewayError::NotFound {
                name: name.to_string(),
            })
    }

    /// All models, sorted by name
    pub fn list(&self) -> Vec<ModelEntry> {
        let mut entries: Vec<ModelEntry> = self.models.iter().map(|e| e.value().clone()).collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        entries
    }

    pub fn count(&self) -> usize {
        self.models.len()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.models.contains_key(name)
    }

    /// Update a model's state. Returns false if the model is gone.
    pub fn set_state(&self, name: &str, state: ModelState) -> bool {
        self.update_state(name, None, state)
    }

    /// Update a model's state only while `generation` is still the registered one
    pub fn set_state_for(&self, name: &str, generation: u64, state: ModelState) -> bool {
        self.update_state(name, Some(generation), state)
    }

    fn update_state(&self, name: &str, generation: Option<u64>, state: ModelState) -> bool {
        match self.models.get_mut(name) {
            Some(entry) if generation.is_some_and(|g| g != entry.generation) => false,
            Some(mut entry) => {
                if entry.state != state {
                    tracing::info!(
                        model = %name,
                        from = ?entry.state,
                        to = ?state,
                        "Model state changed"
                    );
                    entry.state = state;
                }
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn model(name: &str) -> ModelConfig {
        ModelConfig {
            name: name.to_string(),
            artifact: format!("/models/{}.mar", name),
            ..Default::default()
        }
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = Registry::new(None, 10);

        let entry = registry.register(model("m1")).unwrap();
        assert_eq!(entry.state, ModelState::Loading);
        assert_eq!(entry.queue_depth, 10);
        assert_eq!(registry.count(), 1);

        let found = registry.lookup("m1").unwrap();
        assert_eq!(found.artifact, "/models/m1.mar");
    }

    #[test]
    fn test_duplicate_name_rejection() {
        let registry = Registry::new(None, 10);
        registry.register(model("m1")).unwrap();

        let mut other = model("m1");
        other.artifact = "/elsewhere/m1.mar".to_string();
        let err = registry.register(other).unwrap_err();
        assert!(matches!(err, GatewayError::DuplicateModel { .. }));

        // First registration wins
        assert_eq!(registry.lookup("m1").unwrap().artifact, "/models/m1.mar");
    }

    #[test]
    fn test_unregister() {
        let registry = Registry::new(None, 10);
        registry.register(model("m1")).unwrap();

        let removed = registry.unregister("m1").unwrap();
        assert_eq!(removed.state, ModelState::Unregistered);
        assert!(matches!(
            registry.lookup("m1"),
            Err(GatewayError::NotFound { .. })
        ));
        assert!(matches!(
            registry.unregister("m1"),
            Err(GatewayError::NotFound { .. })
        ));
    }

    #[test]
    fn test_validation() {
        let registry = Registry::new(None, 10);

        let mut zero = model("zero");
        zero.instance_count = 0;
        assert!(matches!(
            registry.register(zero),
            Err(GatewayError::Validation { .. })
        ));

        let mut no_artifact = model("empty");
        no_artifact.artifact = " ".to_string();
        assert!(registry.register(no_artifact).is_err());

        assert!(registry.register(model("a/b")).is_err());
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn test_max_models_limit() {
        let registry = Registry::new(Some(2), 10);
        registry.register(model("a")).unwrap();
        registry.register(model("b")).unwrap();
        assert!(matches!(
            registry.register(model("c")),
            Err(GatewayError::Validation { .. })
        ));
    }

    #[test]
    fn test_max_models_exact_under_concurrency() {
        let registry = Arc::new(Registry::new(Some(4), 10));

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let registry = registry.clone();
                std::thread::spawn(move || registry.register(model(&format!("m{}", i))).is_ok())
            })
            .collect();

        let admitted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(admitted, 4);
        assert_eq!(registry.count(), 4);

        // Unregistering frees a place; a duplicate does not consume one
        registry.unregister(&registry.list()[0].name).unwrap();
        let survivor = registry.list()[0].name.clone();
        assert!(matches!(
            registry.register(model(&survivor)),
            Err(GatewayError::DuplicateModel { .. })
        ));
        registry.register(model("late")).unwrap();
        assert_eq!(registry.count(), 4);
    }

    #[test]
    fn test_instance_limit() {
        let registry = Registry::new(None, 10).with_instance_limit(3);

        let mut wide = model("wide");
        wide.instance_count = 4;
        assert!(matches!(
            registry.register(wide),
            Err(GatewayError::Validation { .. })
        ));

        let mut fits = model("fits");
        fits.instance_count = 3;
        registry.register(fits).unwrap();
    }

    #[test]
    fn test_reregistration_gets_new_generation() {
        let registry = Registry::new(None, 10);
        let first = registry.register(model("m1")).unwrap();
        registry.unregister("m1").unwrap();
        let second = registry.register(model("m1")).unwrap();
        assert!(second.generation > first.generation);

        // A stale registration can no longer move the state
        assert!(!registry.set_state_for("m1", first.generation, ModelState::Unloading));
        assert_eq!(registry.lookup("m1").unwrap().state, ModelState::Loading);
        assert!(registry.set_state_for("m1", second.generation, ModelState::Healthy));
        assert_eq!(registry.lookup("m1").unwrap().state, ModelState::Healthy);
    }

    #[test]
    fn test_list_sorted() {
        let registry = Registry::new(None, 10);
        for name in ["zeta", "alpha", "mid"] {
            registry.register(model(name)).unwrap();
        }
        let names: Vec<_> = registry.list().into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["alpha", "mid", "zeta"]);
    }

    #[test]
    fn test_set_state() {
        let registry = Registry::new(None, 10);
        registry.register(model("m1")).unwrap();

        assert!(registry.set_state("m1", ModelState::Healthy));
        assert_eq!(registry.lookup("m1").unwrap().state, ModelState::Healthy);
        assert!(!registry.set_state("missing", ModelState::Healthy));
    }

    #[test]
    fn test_concurrent_registration_single_winner() {
        let registry = Arc::new(Registry::new(None, 10));

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    let mut config = model("contended");
                    config.artifact = format!("/models/v{}.mar", i);
                    registry.register(config).is_ok()
                })
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(winners, 1);
        assert_eq!(registry.count(), 1);
    }
}
