//! Shared harness: an in-process gateway backed by fake worker processes

#![allow(dead_code)]

use async_trait::async_trait;
use axum::body::Bytes;
use axum_test::TestServer;
use inference_gateway::{
    BackendFailure, BackendReply, InferenceBackend, ProcessHandle, ProcessManager, Registry,
    Router, RouterSettings, SpawnConfig, StateManager, Supervisor, SupervisorSettings,
    api::{AppState, create_inference_router, create_management_router},
    metrics,
};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Notify;

// Global metrics handle - only initialize once per test process
static METRICS_HANDLE: OnceLock<metrics_exporter_prometheus::PrometheusHandle> = OnceLock::new();

pub fn get_metrics_handle() -> metrics_exporter_prometheus::PrometheusHandle {
    METRICS_HANDLE
        .get_or_init(|| metrics::setup_metrics().expect("Failed to setup metrics"))
        .clone()
}

// ============================================================================
// Fake workers
// ============================================================================

/// Echo worker that can be killed, including in the middle of a request
pub struct FakeWorker {
    pub model: String,
    alive: AtomicBool,
    /// Process up but refusing connections
    reachable: AtomicBool,
    killed: Notify,
    delay: Duration,
    /// Shared with the process manager: completed predictions across all workers
    served: Arc<AtomicU64>,
}

impl FakeWorker {
    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn accepts_connections(&self) -> bool {
        self.is_alive() && self.reachable.load(Ordering::SeqCst)
    }

    fn kill(&self) {
        self.alive.store(false, Ordering::SeqCst);
        self.killed.notify_waiters();
    }
}

#[async_trait]
impl InferenceBackend for FakeWorker {
    async fn health_check(&self) -> Result<(), BackendFailure> {
        if self.accepts_connections() {
            Ok(())
        } else {
            Err(BackendFailure::Unreachable("connection refused".into()))
        }
    }

    async fn predict(&self, payload: Bytes) -> Result<BackendReply, BackendFailure> {
        let killed = self.killed.notified();
        tokio::pin!(killed);
        killed.as_mut().enable();

        if !self.accepts_connections() {
            return Err(BackendFailure::Unreachable("connection refused".into()));
        }

        tokio::select! {
            _ = tokio::time::sleep(self.delay) => {}
            _ = &mut killed => {
                return Err(BackendFailure::Crashed("connection reset by peer".into()));
            }
        }
        if !self.is_alive() {
            return Err(BackendFailure::Crashed("connection reset by peer".into()));
        }

        self.served.fetch_add(1, Ordering::SeqCst);
        Ok(BackendReply {
            status: 200,
            content_type: Some("application/octet-stream".to_string()),
            body: payload,
        })
    }
}

/// Process manager whose "processes" are in-memory echo workers
pub struct FakeProcessManager {
    workers: Mutex<HashMap<String, (u32, Arc<FakeWorker>)>>,
    delay_ms: AtomicU64,
    next_pid: AtomicU32,
    served: Arc<AtomicU64>,
    pub spawned: AtomicU32,
    pub fail_spawn: AtomicBool,
}

impl FakeProcessManager {
    pub fn new(delay: Duration) -> Self {
        Self {
            workers: Mutex::new(HashMap::new()),
            delay_ms: AtomicU64::new(delay.as_millis() as u64),
            next_pid: AtomicU32::new(20_000),
            served: Arc::new(AtomicU64::new(0)),
            spawned: AtomicU32::new(0),
            fail_spawn: AtomicBool::new(false),
        }
    }

    /// Predictions answered by any worker, dead or alive
    pub fn served_total(&self) -> u64 {
        self.served.load(Ordering::SeqCst)
    }

    /// Make one live worker of a model refuse connections while its process keeps running
    pub fn refuse_one(&self, model: &str) -> bool {
        let workers = self.workers.lock().unwrap();
        match workers
            .values()
            .find(|(_, w)| w.model == model && w.accepts_connections())
        {
            Some((_, worker)) => {
                worker.reachable.store(false, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    /// Applies to workers spawned from now on
    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Kill one live worker of a model, returning whether one was found
    pub fn kill_one(&self, model: &str) -> bool {
        let workers = self.workers.lock().unwrap();
        match workers
            .values()
            .find(|(_, w)| w.model == model && w.is_alive())
        {
            Some((_, worker)) => {
                worker.kill();
                true
            }
            None => false,
        }
    }

    pub fn live_processes(&self, model: &str) -> usize {
        self.workers
            .lock()
            .unwrap()
            .values()
            .filter(|(_, w)| w.model == model && w.is_alive())
            .count()
    }
}

#[async_trait]
impl ProcessManager for FakeProcessManager {
    async fn spawn(&self, config: &SpawnConfig) -> anyhow::Result<ProcessHandle> {
        if self.fail_spawn.load(Ordering::SeqCst) {
            anyhow::bail!("{}: executable not found", config.binary_path);
        }
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        self.spawned.fetch_add(1, Ordering::SeqCst);

        let handle = ProcessHandle::new(format!("fake_{}", pid));
        let worker = Arc::new(FakeWorker {
            model: config.model_name.clone(),
            alive: AtomicBool::new(true),
            reachable: AtomicBool::new(true),
            killed: Notify::new(),
            delay: Duration::from_millis(self.delay_ms.load(Ordering::SeqCst)),
            served: self.served.clone(),
        });
        self.workers
            .lock()
            .unwrap()
            .insert(handle.id().to_string(), (pid, worker));
        Ok(handle)
    }

    async fn stop(&self, handle: &ProcessHandle, _timeout: Duration) -> anyhow::Result<()> {
        if let Some((_, worker)) = self.workers.lock().unwrap().remove(handle.id()) {
            worker.kill();
        }
        Ok(())
    }

    async fn is_running(&self, handle: &ProcessHandle) -> bool {
        self.workers
            .lock()
            .unwrap()
            .get(handle.id())
            .map(|(_, w)| w.is_alive())
            .unwrap_or(false)
    }

    async fn pid(&self, handle: &ProcessHandle) -> Option<u32> {
        self.workers
            .lock()
            .unwrap()
            .get(handle.id())
            .map(|(pid, _)| *pid)
    }

    fn connect(
        &self,
        handle: &ProcessHandle,
        _config: &SpawnConfig,
    ) -> anyhow::Result<Arc<dyn InferenceBackend>> {
        let workers = self.workers.lock().unwrap();
        let (_, worker) = workers
            .get(handle.id())
            .ok_or_else(|| anyhow::anyhow!("unknown process {}", handle.id()))?;
        Ok(worker.clone())
    }
}

// ============================================================================
// Gateway harness
// ============================================================================

pub struct TestGateway {
    pub management: TestServer,
    pub inference: TestServer,
    pub processes: Arc<FakeProcessManager>,
    pub registry: Arc<Registry>,
    pub supervisor: Arc<Supervisor>,
    pub state_manager: Arc<StateManager>,
    pub temp_dir: TempDir,
}

/// Timings scaled down so restarts and heartbeats happen within a test
pub fn fast_supervisor_settings(temp_dir: &TempDir) -> SupervisorSettings {
    SupervisorSettings {
        worker_binary_path: "fake-worker".to_string(),
        worker_log_dir: temp_dir.path().join("logs"),
        worker_port_range: (41000, 41500),
        heartbeat_interval: Duration::from_millis(20),
        heartbeat_timeout: Duration::from_millis(500),
        startup_timeout: Duration::from_secs(2),
        restart_backoff_base: Duration::from_millis(50),
        restart_backoff_max: Duration::from_millis(400),
        healthy_reset: Duration::from_secs(1),
        kill_timeout: Duration::from_millis(100),
        drain_grace: Duration::from_secs(1),
    }
}

pub fn create_gateway(worker_delay: Duration, router_settings: RouterSettings) -> TestGateway {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let processes = Arc::new(FakeProcessManager::new(worker_delay));

    let registry = Arc::new(Registry::new(Some(16), 100).with_instance_limit(500));
    let supervisor = Supervisor::new(
        registry.clone(),
        processes.clone(),
        fast_supervisor_settings(&temp_dir),
    );
    let router = Arc::new(Router::new(
        registry.clone(),
        supervisor.clone(),
        router_settings,
    ));
    let state_manager = Arc::new(StateManager::new(
        temp_dir.path().join("state.toml"),
        registry.clone(),
        supervisor.clone(),
    ));

    let state = AppState {
        registry: registry.clone(),
        supervisor: supervisor.clone(),
        router,
        state_manager: state_manager.clone(),
        prometheus_handle: get_metrics_handle(),
    };

    let management = TestServer::try_new(create_management_router(state.clone()))
        .expect("Failed to create management server");
    let inference =
        TestServer::try_new(create_inference_router(state)).expect("Failed to create inference server");

    TestGateway {
        management,
        inference,
        processes,
        registry,
        supervisor,
        state_manager,
        temp_dir,
    }
}

/// Poll until the condition holds, panicking after `timeout`
pub async fn wait_until<F, Fut>(timeout: Duration, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition().await {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("condition not met within {:?}", timeout);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
