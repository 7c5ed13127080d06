//! Worker instance state machine and in-flight accounting

use crate::backend::InferenceBackend;
use crate::process::ProcessHandle;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tokio::sync::Notify;

/// Worker lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerState {
    Starting,
    Ready,
    Busy,
    Draining,
    Dead,
}

impl WorkerState {
    /// Whether the worker is up and accepting (or saturated with) work
    pub fn is_serving(self) -> bool {
        matches!(self, WorkerState::Ready | WorkerState::Busy)
    }
}

#[derive(Debug)]
struct WorkerCore {
    state: WorkerState,
    in_flight: usize,
    last_heartbeat: Option<Instant>,
    ready_since: Option<Instant>,
    last_heartbeat_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// One running worker process serving a model
///
/// Owned by the supervisor. Counters live behind a per-instance mutex that is
/// never held across an await.
pub struct WorkerInstance {
    pub id: String,
    pub model_name: String,
    pub slot: usize,
    pub port: u16,
    pub slots: usize,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub(crate) handle: ProcessHandle,
    spawned: Instant,
    backend: Arc<dyn InferenceBackend>,
    core: Mutex<WorkerCore>,
    /// Fired whenever a slot frees up or the state changes
    capacity: Arc<Notify>,
}

/// Point-in-time view of a worker
#[derive(Debug, Clone, Serialize)]
pub struct WorkerSnapshot {
    pub id: String,
    pub slot: usize,
    pub port: u16,
    pub state: WorkerState,
    pub in_flight: usize,
    pub slots: usize,
    pub pid: Option<u32>,
    pub last_heartbeat: Option<chrono::DateTime<chrono::Utc>>,
    pub started_at: chrono::DateTime<chrono::Utc>,
}

impl WorkerInstance {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: String,
        model_name: String,
        slot: usize,
        port: u16,
        slots: usize,
        handle: ProcessHandle,
        backend: Arc<dyn InferenceBackend>,
        capacity: Arc<Notify>,
    ) -> Self {
        Self {
            id,
            model_name,
            slot,
            port,
            slots: slots.max(1),
            started_at: chrono::Utc::now(),
            handle,
            spawned: Instant::now(),
            backend,
            core: Mutex::new(WorkerCore {
                state: WorkerState::Starting,
                in_flight: 0,
                last_heartbeat: None,
                ready_since: None,
                last_heartbeat_at: None,
            }),
            capacity,
        }
    }

    fn core(&self) -> MutexGuard<'_, WorkerCore> {
        // A poisoned lock only means a panic mid-update of plain counters
        self.core.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> WorkerState {
        self.core().state
    }

    pub fn in_flight(&self) -> usize {
        self.core().in_flight
    }

    pub fn snapshot(&self) -> WorkerSnapshot {
        let core = self.core();
        WorkerSnapshot {
            id: self.id.clone(),
            slot: self.slot,
            port: self.port,
            state: core.state,
            in_flight: core.in_flight,
            slots: self.slots,
            pid: None,
            last_heartbeat: core.last_heartbeat_at,
            started_at: self.started_at,
        }
    }

    /// Time of the last successful heartbeat, or spawn time if none yet
    pub(crate) fn last_sign_of_life(&self) -> Instant {
        self.core().last_heartbeat.unwrap_or(self.spawned)
    }

    pub(crate) fn ready_since(&self) -> Option<Instant> {
        self.core().ready_since
    }

    /// Record a successful health probe. Returns true on the Starting -> Ready edge.
    pub(crate) fn record_heartbeat(&self) -> bool {
        let became_ready = {
            let mut core = self.core();
            core.last_heartbeat = Some(Instant::now());
            core.last_heartbeat_at = Some(chrono::Utc::now());
            if core.state == WorkerState::Starting {
                core.state = WorkerState::Ready;
                core.ready_since = Some(Instant::now());
                true
            } else {
                false
            }
        };
        if became_ready {
            self.capacity.notify_waiters();
        }
        became_ready
    }

    /// Transition to Dead. Returns false if it already was.
    pub(crate) fn mark_dead(&self) -> bool {
        let changed = {
            let mut core = self.core();
            if core.state == WorkerState::Dead {
                false
            } else {
                core.state = WorkerState::Dead;
                core.ready_since = None;
                true
            }
        };
        if changed {
            self.capacity.notify_waiters();
        }
        changed
    }

    /// Stop handing out new leases
    pub(crate) fn mark_draining(&self) {
        {
            let mut core = self.core();
            if core.state != WorkerState::Dead {
                core.state = WorkerState::Draining;
            }
        }
        self.capacity.notify_waiters();
    }

    /// Claim one slot if the worker is Ready and has room
    pub(crate) fn try_acquire(self: &Arc<Self>) -> Option<WorkerLease> {
        {
            let mut core = self.core();
            if core.state != WorkerState::Ready || core.in_flight >= self.slots {
                return None;
            }
            core.in_flight += 1;
            if core.in_flight >= self.slots {
                core.state = WorkerState::Busy;
            }
        }
        Some(WorkerLease {
            instance_id: self.id.clone(),
            backend: self.backend.clone(),
            worker: self.clone(),
        })
    }

    fn release(&self) {
        {
            let mut core = self.core();
            core.in_flight = core.in_flight.saturating_sub(1);
            if core.state == WorkerState::Busy && core.in_flight < self.slots {
                core.state = WorkerState::Ready;
            }
        }
        self.capacity.notify_waiters();
    }

    pub(crate) fn backend(&self) -> &Arc<dyn InferenceBackend> {
        &self.backend
    }
}

/// A router's claim on one worker slot
///
/// Dropping the lease gives the slot back, whether the request succeeded,
/// failed or was cancelled.
pub struct WorkerLease {
    pub instance_id: String,
    pub backend: Arc<dyn InferenceBackend>,
    worker: Arc<WorkerInstance>,
}

impl WorkerLease {
    pub fn model_name(&self) -> &str {
        &self.worker.model_name
    }
}

impl Drop for WorkerLease {
    fn drop(&mut self) {
        self.worker.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::mocks::MockWorker;
    use std::sync::atomic::AtomicBool;

    fn worker(slots: usize) -> Arc<WorkerInstance> {
        let backend = Arc::new(MockWorker {
            alive: AtomicBool::new(true),
            healthy: AtomicBool::new(true),
        });
        Arc::new(WorkerInstance::new(
            "m1-0-1".to_string(),
            "m1".to_string(),
            0,
            9100,
            slots,
            ProcessHandle::new("mock_process_1"),
            backend,
            Arc::new(Notify::new()),
        ))
    }

    #[test]
    fn test_starting_worker_refuses_leases() {
        let w = worker(1);
        assert_eq!(w.state(), WorkerState::Starting);
        assert!(w.try_acquire().is_none());
    }

    #[test]
    fn test_heartbeat_promotes_to_ready_once() {
        let w = worker(1);
        assert!(w.record_heartbeat());
        assert!(!w.record_heartbeat());
        assert_eq!(w.state(), WorkerState::Ready);
        assert!(w.ready_since().is_some());
    }

    #[test]
    fn test_single_slot_worker_serves_one_request() {
        let w = worker(1);
        w.record_heartbeat();

        let lease = w.try_acquire().unwrap();
        assert_eq!(w.state(), WorkerState::Busy);
        assert_eq!(w.in_flight(), 1);
        assert!(w.try_acquire().is_none());

        drop(lease);
        assert_eq!(w.state(), WorkerState::Ready);
        assert_eq!(w.in_flight(), 0);
    }

    #[test]
    fn test_multi_slot_worker() {
        let w = worker(3);
        w.record_heartbeat();

        let leases: Vec<_> = (0..3).map(|_| w.try_acquire().unwrap()).collect();
        assert_eq!(w.state(), WorkerState::Busy);
        assert!(w.try_acquire().is_none());
        drop(leases);
        assert_eq!(w.in_flight(), 0);
    }

    #[test]
    fn test_draining_keeps_counter_consistent() {
        let w = worker(2);
        w.record_heartbeat();
        let lease = w.try_acquire().unwrap();

        w.mark_draining();
        assert!(w.try_acquire().is_none());
        drop(lease);

        assert_eq!(w.state(), WorkerState::Draining);
        assert_eq!(w.in_flight(), 0);
    }

    #[test]
    fn test_dead_is_terminal_for_heartbeat_edge() {
        let w = worker(1);
        assert!(w.mark_dead());
        assert!(!w.mark_dead());
        assert!(!w.record_heartbeat());
        assert_eq!(w.state(), WorkerState::Dead);
    }
}
