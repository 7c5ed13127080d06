//! Worker supervision: spawning, heartbeats, restart backoff and draining

use crate::config::SupervisorSettings;
use crate::error::{GatewayError, GatewayResult};
use crate::process::{ProcessManager, SpawnConfig};
use crate::registry::{ModelEntry, ModelState, Registry};
use crate::worker::{WorkerInstance, WorkerLease, WorkerSnapshot, WorkerState};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::collections::HashSet;
use std::net::TcpListener;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{Instant, MissedTickBehavior};

/// Result of probing one worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    /// Process alive and health check passed
    Ready,
    /// Probe failed but the worker is still within its timeout
    Pending,
    /// Worker missed its heartbeat deadline or its process exited
    TimedOut,
    /// Worker is draining, dead, or unknown
    Gone,
}

/// Restart delay for the given number of previous attempts: `base * 2^attempts`, capped
pub fn backoff_delay(base: Duration, max: Duration, attempts: u32) -> Duration {
    let factor = 2u32.checked_pow(attempts.min(31)).unwrap_or(u32::MAX);
    base.checked_mul(factor).unwrap_or(max).min(max)
}

/// Per-model view returned to the API
#[derive(Debug, Clone)]
pub struct ModelStatus {
    pub workers: Vec<WorkerSnapshot>,
    pub restarts: u64,
}

#[derive(Default)]
struct SlotState {
    occupant: Option<Arc<WorkerInstance>>,
    restart_pending: bool,
}

/// Workers belonging to one model
struct ModelWorkers {
    name: String,
    /// Registration this table was built for
    generation: u64,
    artifact: String,
    slots_per_instance: usize,
    extra_args: Vec<String>,
    /// Slot table; only locked by supervisor operations on this model
    slots: tokio::sync::Mutex<Vec<SlotState>>,
    /// Read-mostly list the router selects from
    live: RwLock<Vec<Arc<WorkerInstance>>>,
    /// Restart attempts per slot since it was last healthy for long enough
    attempts: Vec<AtomicU32>,
    restarts: AtomicU64,
    capacity: Arc<Notify>,
    terminating: AtomicBool,
}

impl ModelWorkers {
    fn new(entry: &ModelEntry) -> Self {
        Self {
            name: entry.name.clone(),
            generation: entry.generation,
            artifact: entry.artifact.clone(),
            slots_per_instance: entry.slots_per_instance,
            extra_args: entry.extra_args.clone(),
            slots: tokio::sync::Mutex::new(
                (0..entry.instance_count).map(|_| SlotState::default()).collect(),
            ),
            live: RwLock::new(Vec::new()),
            attempts: (0..entry.instance_count).map(|_| AtomicU32::new(0)).collect(),
            restarts: AtomicU64::new(0),
            capacity: Arc::new(Notify::new()),
            terminating: AtomicBool::new(false),
        }
    }

    fn live(&self) -> Vec<Arc<WorkerInstance>> {
        self.live.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn find(&self, instance_id: &str) -> Option<Arc<WorkerInstance>> {
        self.live
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|w| w.id == instance_id)
            .cloned()
    }

    fn add_live(&self, worker: Arc<WorkerInstance>) {
        self.live
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(worker);
    }

    fn remove_live(&self, instance_id: &str) {
        self.live
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|w| w.id != instance_id);
    }

    fn is_terminating(&self) -> bool {
        self.terminating.load(Ordering::SeqCst)
    }
}

/// Keeps each registered model's desired number of workers alive
pub struct Supervisor {
    registry: Arc<Registry>,
    process_manager: Arc<dyn ProcessManager>,
    settings: SupervisorSettings,
    models: DashMap<String, Arc<ModelWorkers>>,
    used_ports: Mutex<HashSet<u16>>,
    next_port: Mutex<u16>,
    instance_seq: AtomicU64,
    me: Weak<Supervisor>,
}

impl Supervisor {
    pub fn new(
        registry: Arc<Registry>,
        process_manager: Arc<dyn ProcessManager>,
        settings: SupervisorSettings,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            registry,
            process_manager,
            next_port: Mutex::new(settings.worker_port_range.0),
            settings,
            models: DashMap::new(),
            used_ports: Mutex::new(HashSet::new()),
            instance_seq: AtomicU64::new(1),
            me: me.clone(),
        })
    }

    pub fn settings(&self) -> &SupervisorSettings {
        &self.settings
    }

    // ------------------------------------------------------------------------
    // Public operations
    // ------------------------------------------------------------------------

    /// Spawn workers until the model has its desired count. Idempotent.
    ///
    /// Returns the number of workers spawned by this call.
    pub async fn ensure(&self, name: &str) -> GatewayResult<usize> {
        let entry = self.registry.lookup(name)?;

        let mut replaced = None;
        let workers = match self.models.entry(name.to_string()) {
            Entry::Vacant(vacant) => vacant
                .insert(Arc::new(ModelWorkers::new(&entry)))
                .value()
                .clone(),
            Entry::Occupied(mut occupied) => {
                let existing = occupied.get().clone();
                if existing.generation == entry.generation {
                    existing
                } else if existing.generation > entry.generation {
                    // Our lookup predates a newer registration of the same name
                    return Err(GatewayError::NotFound {
                        name: name.to_string(),
                    });
                } else {
                    let fresh = Arc::new(ModelWorkers::new(&entry));
                    replaced = Some(occupied.insert(fresh.clone()));
                    fresh
                }
            }
        };

        if let Some(stale) = replaced {
            tracing::info!(
                model = %name,
                old_generation = stale.generation,
                generation = entry.generation,
                "Replacing workers of an earlier registration"
            );
            stale.terminating.store(true, Ordering::SeqCst);
            if let Some(supervisor) = self.me.upgrade() {
                tokio::spawn(async move {
                    supervisor
                        .stop_table(&stale, supervisor.settings.drain_grace)
                        .await;
                });
            }
        }

        let mut slots = workers.slots.lock().await;
        if workers.is_terminating() {
            return Err(GatewayError::NotFound {
                name: name.to_string(),
            });
        }

        let mut spawned = 0;
        for idx in 0..slots.len() {
            let slot = &mut slots[idx];
            if slot.occupant.is_some() || slot.restart_pending {
                continue;
            }
            match self.spawn_into(&workers, idx, slot).await {
                Ok(()) => spawned += 1,
                Err(e) => {
                    tracing::error!(
                        model = %name,
                        slot = idx,
                        error = %format!("{:#}", e),
                        "Failed to spawn worker"
                    );
                    self.schedule_restart(&workers, idx, slot);
                }
            }
        }
        drop(slots);

        self.refresh_state(&workers);

        if spawned > 0 {
            tracing::info!(model = %name, spawned = spawned, "Ensured model workers");
        }
        Ok(spawned)
    }

    /// Drain and stop every worker of a model, then forget it
    pub async fn terminate(&self, name: &str) -> GatewayResult<()> {
        let (_, workers) = self
            .models
            .remove(name)
            .ok_or_else(|| GatewayError::NotFound {
                name: name.to_string(),
            })?;

        self.stop_table(&workers, self.settings.drain_grace).await;
        Ok(())
    }

    /// Like `terminate`, but only touches workers started for this exact registration
    ///
    /// A model deleted and re-registered under the same name keeps the new
    /// registration's workers; the call then returns `NotFound`.
    pub async fn terminate_entry(&self, entry: &ModelEntry) -> GatewayResult<()> {
        let (_, workers) = self
            .models
            .remove_if(&entry.name, |_, w| w.generation == entry.generation)
            .ok_or_else(|| GatewayError::NotFound {
                name: entry.name.clone(),
            })?;

        self.stop_table(&workers, self.settings.drain_grace).await;
        Ok(())
    }

    /// Probe one worker once: process liveness plus the backend health check
    pub async fn heartbeat(&self, instance_id: &str) -> HeartbeatOutcome {
        let found = self
            .models
            .iter()
            .find_map(|m| m.value().find(instance_id).map(|w| (m.value().clone(), w)));

        match found {
            Some((workers, worker)) => self.probe(&workers, &worker).await,
            None => HeartbeatOutcome::Gone,
        }
    }

    /// Mark a worker dead after it failed mid-request
    ///
    /// The worker stops receiving leases immediately; stopping the process and
    /// scheduling its replacement happen in the background.
    pub fn report_crash(&self, model: &str, instance_id: &str, reason: &str) {
        let Some(workers) = self.models.get(model).map(|m| m.value().clone()) else {
            return;
        };
        let Some(worker) = workers.find(instance_id) else {
            return;
        };
        if !worker.mark_dead() {
            return;
        }

        let Some(supervisor) = self.me.upgrade() else {
            return;
        };
        let reason = reason.to_string();
        tokio::spawn(async move {
            supervisor.retire(&workers, &worker, &reason).await;
        });
    }

    /// Drain every model concurrently, each bounded by `grace`
    pub async fn shutdown(&self, grace: Duration) {
        let names: Vec<String> = self.models.iter().map(|m| m.key().clone()).collect();
        tracing::info!(models = names.len(), "Supervisor shutting down");

        futures::future::join_all(names.iter().map(|name| async move {
            if let Some((_, workers)) = self.models.remove(name) {
                self.stop_table(&workers, grace).await;
            }
        }))
        .await;
    }

    // ------------------------------------------------------------------------
    // Router-facing views
    // ------------------------------------------------------------------------

    /// Snapshots of a model's live workers, or None if the model has no supervisor state
    pub fn candidates(&self, model: &str) -> Option<Vec<WorkerSnapshot>> {
        let workers = self.models.get(model)?.value().clone();
        if workers.is_terminating() {
            return None;
        }
        Some(workers.live().iter().map(|w| w.snapshot()).collect())
    }

    /// Claim a slot on a specific worker
    pub fn try_lease(&self, model: &str, instance_id: &str) -> Option<WorkerLease> {
        let workers = self.models.get(model)?.value().clone();
        workers.find(instance_id)?.try_acquire()
    }

    /// Notification fired whenever a worker of the model frees a slot or changes state
    pub fn capacity_signal(&self, model: &str) -> Option<Arc<Notify>> {
        self.models.get(model).map(|m| m.value().capacity.clone())
    }

    pub fn ready_count(&self, model: &str) -> usize {
        self.models
            .get(model)
            .map(|m| {
                m.value()
                    .live()
                    .iter()
                    .filter(|w| w.state().is_serving())
                    .count()
            })
            .unwrap_or(0)
    }

    /// Number of live (non-dead) workers for a model
    pub fn instance_count(&self, model: &str) -> usize {
        self.models
            .get(model)
            .map(|m| m.value().live().len())
            .unwrap_or(0)
    }

    /// Detailed worker view, including process IDs
    pub async fn status(&self, model: &str) -> Option<ModelStatus> {
        let workers = self.models.get(model)?.value().clone();

        let mut snapshots = Vec::new();
        for worker in workers.live() {
            let mut snapshot = worker.snapshot();
            snapshot.pid = self.process_manager.pid(&worker.handle).await;
            snapshots.push(snapshot);
        }
        snapshots.sort_by_key(|s| s.slot);

        Some(ModelStatus {
            workers: snapshots,
            restarts: workers.restarts.load(Ordering::SeqCst),
        })
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    async fn spawn_into(
        &self,
        workers: &Arc<ModelWorkers>,
        idx: usize,
        slot: &mut SlotState,
    ) -> anyhow::Result<()> {
        let port = self.allocate_port()?;
        let seq = self.instance_seq.fetch_add(1, Ordering::SeqCst);

        let config = SpawnConfig {
            instance_id: format!("{}-{}-{}", workers.name, idx, seq),
            model_name: workers.name.clone(),
            artifact: workers.artifact.clone(),
            binary_path: self.settings.worker_binary_path.clone(),
            port,
            log_dir: self.settings.worker_log_dir.clone(),
            extra_args: workers.extra_args.clone(),
        };

        let handle = match self.process_manager.spawn(&config).await {
            Ok(handle) => handle,
            Err(e) => {
                self.release_port(port);
                return Err(e);
            }
        };

        let backend = match self.process_manager.connect(&handle, &config) {
            Ok(backend) => backend,
            Err(e) => {
                let _ = self
                    .process_manager
                    .stop(&handle, self.settings.kill_timeout)
                    .await;
                self.release_port(port);
                return Err(e);
            }
        };

        let worker = Arc::new(WorkerInstance::new(
            config.instance_id,
            workers.name.clone(),
            idx,
            port,
            workers.slots_per_instance,
            handle,
            backend,
            workers.capacity.clone(),
        ));

        tracing::info!(
            model = %workers.name,
            instance = %worker.id,
            slot = idx,
            port = port,
            "Worker starting"
        );

        slot.occupant = Some(worker.clone());
        workers.add_live(worker.clone());
        crate::metrics::record_worker_spawned(&workers.name);

        tokio::spawn(Self::monitor(
            self.me.clone(),
            workers.clone(),
            worker,
            self.settings.heartbeat_interval,
        ));

        Ok(())
    }

    /// Periodic heartbeat task, one per worker
    async fn monitor(
        supervisor: Weak<Supervisor>,
        workers: Arc<ModelWorkers>,
        worker: Arc<WorkerInstance>,
        interval: Duration,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let Some(supervisor) = supervisor.upgrade() else {
                break;
            };

            match supervisor.probe(&workers, &worker).await {
                HeartbeatOutcome::Ready | HeartbeatOutcome::Pending => {}
                HeartbeatOutcome::TimedOut => {
                    supervisor
                        .handle_death(&workers, &worker, "missed heartbeat deadline")
                        .await;
                    break;
                }
                HeartbeatOutcome::Gone => break,
            }
        }

        tracing::debug!(instance = %worker.id, "Heartbeat monitor stopped");
    }

    async fn probe(
        &self,
        workers: &Arc<ModelWorkers>,
        worker: &Arc<WorkerInstance>,
    ) -> HeartbeatOutcome {
        let state = worker.state();
        if matches!(state, WorkerState::Draining | WorkerState::Dead) {
            return HeartbeatOutcome::Gone;
        }

        if !self.process_manager.is_running(&worker.handle).await {
            tracing::warn!(instance = %worker.id, "Worker process exited");
            return HeartbeatOutcome::TimedOut;
        }

        let check = tokio::time::timeout(
            self.settings.heartbeat_interval,
            worker.backend().health_check(),
        )
        .await;

        match check {
            Ok(Ok(())) => {
                if worker.record_heartbeat() {
                    tracing::info!(
                        model = %workers.name,
                        instance = %worker.id,
                        "Worker is now ready"
                    );
                    self.refresh_state(workers);
                }

                // Sustained health wipes the slot's restart history
                if worker
                    .ready_since()
                    .is_some_and(|since| since.elapsed() >= self.settings.healthy_reset)
                    && let Some(attempts) = workers.attempts.get(worker.slot)
                    && attempts.swap(0, Ordering::SeqCst) > 0
                {
                    tracing::debug!(instance = %worker.id, "Restart backoff reset");
                }

                HeartbeatOutcome::Ready
            }
            Ok(Err(e)) => self.check_deadline(worker, state, &e.to_string()),
            Err(_) => self.check_deadline(worker, state, "health check timed out"),
        }
    }

    fn check_deadline(
        &self,
        worker: &WorkerInstance,
        state: WorkerState,
        reason: &str,
    ) -> HeartbeatOutcome {
        let limit = if state == WorkerState::Starting {
            self.settings.startup_timeout
        } else {
            self.settings.heartbeat_timeout
        };

        let silent_for = worker.last_sign_of_life().elapsed();
        if silent_for > limit {
            tracing::warn!(
                instance = %worker.id,
                silent_ms = silent_for.as_millis() as u64,
                limit_ms = limit.as_millis() as u64,
                reason = %reason,
                "Worker heartbeat deadline exceeded"
            );
            HeartbeatOutcome::TimedOut
        } else {
            tracing::debug!(instance = %worker.id, reason = %reason, "Health check failed");
            HeartbeatOutcome::Pending
        }
    }

    async fn handle_death(
        &self,
        workers: &Arc<ModelWorkers>,
        worker: &Arc<WorkerInstance>,
        reason: &str,
    ) {
        if worker.mark_dead() {
            self.retire(workers, worker, reason).await;
        }
    }

    /// Clean up a worker already marked dead and schedule its replacement
    async fn retire(&self, workers: &Arc<ModelWorkers>, worker: &Arc<WorkerInstance>, reason: &str) {
        tracing::warn!(
            model = %workers.name,
            instance = %worker.id,
            reason = %reason,
            "Worker declared dead"
        );
        crate::metrics::record_worker_restart(&workers.name);
        workers.restarts.fetch_add(1, Ordering::SeqCst);
        workers.remove_live(&worker.id);

        if let Err(e) = self
            .process_manager
            .stop(&worker.handle, self.settings.kill_timeout)
            .await
        {
            tracing::warn!(instance = %worker.id, error = %e, "Failed to stop dead worker");
        }
        self.release_port(worker.port);

        let mut slots = workers.slots.lock().await;
        if let Some(slot) = slots.get_mut(worker.slot) {
            if slot
                .occupant
                .as_ref()
                .is_some_and(|o| Arc::ptr_eq(o, worker))
            {
                slot.occupant = None;
            }
            if !workers.is_terminating() && slot.occupant.is_none() && !slot.restart_pending {
                self.schedule_restart(workers, worker.slot, slot);
            }
        }
        drop(slots);

        self.refresh_state(workers);
    }

    fn schedule_restart(&self, workers: &Arc<ModelWorkers>, idx: usize, slot: &mut SlotState) {
        let attempts = workers.attempts[idx].fetch_add(1, Ordering::SeqCst);
        let delay = backoff_delay(
            self.settings.restart_backoff_base,
            self.settings.restart_backoff_max,
            attempts,
        );
        slot.restart_pending = true;

        tracing::info!(
            model = %workers.name,
            slot = idx,
            attempt = attempts + 1,
            delay_ms = delay.as_millis() as u64,
            "Scheduling worker replacement"
        );

        let supervisor = self.me.clone();
        let workers = workers.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(supervisor) = supervisor.upgrade() {
                supervisor.restart_slot(&workers, idx).await;
            }
        });
    }

    async fn restart_slot(&self, workers: &Arc<ModelWorkers>, idx: usize) {
        let mut slots = workers.slots.lock().await;
        let Some(slot) = slots.get_mut(idx) else {
            return;
        };
        slot.restart_pending = false;

        // A model re-registered under the same name gets a fresh ModelWorkers
        let current = self
            .models
            .get(&workers.name)
            .is_some_and(|m| Arc::ptr_eq(m.value(), workers));
        if workers.is_terminating() || !current || slot.occupant.is_some() {
            return;
        }

        if let Err(e) = self.spawn_into(workers, idx, slot).await {
            tracing::error!(
                model = %workers.name,
                slot = idx,
                error = %format!("{:#}", e),
                "Failed to respawn worker"
            );
            self.schedule_restart(workers, idx, slot);
        }
        drop(slots);

        self.refresh_state(workers);
    }

    /// Stop a table already removed from (or replaced in) the model map
    async fn stop_table(&self, workers: &Arc<ModelWorkers>, grace: Duration) {
        workers.terminating.store(true, Ordering::SeqCst);
        // Let a concurrent ensure finish so its workers are part of the drain
        drop(workers.slots.lock().await);
        self.drain_and_stop(workers, grace).await;
    }

    async fn drain_and_stop(&self, workers: &Arc<ModelWorkers>, grace: Duration) {
        let snapshot = workers.live();
        for worker in &snapshot {
            worker.mark_draining();
        }
        self.registry
            .set_state_for(&workers.name, workers.generation, ModelState::Unloading);

        tracing::info!(
            model = %workers.name,
            workers = snapshot.len(),
            grace_ms = grace.as_millis() as u64,
            "Draining model"
        );

        let deadline = Instant::now() + grace;
        loop {
            let notified = workers.capacity.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let in_flight: usize = snapshot.iter().map(|w| w.in_flight()).sum();
            if in_flight == 0 {
                break;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                tracing::warn!(
                    model = %workers.name,
                    in_flight = in_flight,
                    "Drain grace period expired, force-stopping workers"
                );
                break;
            }
        }

        futures::future::join_all(snapshot.iter().map(|worker| async move {
            worker.mark_dead();
            if let Err(e) = self
                .process_manager
                .stop(&worker.handle, self.settings.kill_timeout)
                .await
            {
                tracing::warn!(instance = %worker.id, error = %e, "Failed to stop worker");
            }
            self.release_port(worker.port);
        }))
        .await;

        workers
            .live
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        workers.capacity.notify_waiters();

        tracing::info!(model = %workers.name, "Model workers stopped");
    }

    /// Derive the registry state from live workers
    fn refresh_state(&self, workers: &ModelWorkers) {
        let state = if workers.is_terminating() {
            ModelState::Unloading
        } else if workers.live().iter().any(|w| w.state().is_serving()) {
            ModelState::Healthy
        } else if workers
            .attempts
            .iter()
            .any(|a| a.load(Ordering::SeqCst) > 0)
        {
            ModelState::Degraded
        } else {
            ModelState::Loading
        };
        self.registry
            .set_state_for(&workers.name, workers.generation, state);
    }

    /// Next free worker port, wrapping around the configured range
    fn allocate_port(&self) -> anyhow::Result<u16> {
        let (range_start, range_end) = self.settings.worker_port_range;
        let mut used = self.used_ports.lock().unwrap_or_else(|e| e.into_inner());
        let mut next = self.next_port.lock().unwrap_or_else(|e| e.into_inner());

        let search_start = if *next >= range_end || *next < range_start {
            range_start
        } else {
            *next
        };

        let port = (search_start..range_end)
            .chain(range_start..search_start)
            .find(|port| !used.contains(port) && TcpListener::bind(("127.0.0.1", *port)).is_ok())
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "Could not find free worker port in range [{}, {})",
                    range_start,
                    range_end
                )
            })?;

        used.insert(port);
        *next = port + 1;
        Ok(port)
    }

    fn release_port(&self, port: u16) {
        self.used_ports
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&port);
    }
}
