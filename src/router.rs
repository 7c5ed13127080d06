//! Request routing: admission, worker selection, deadlines

use crate::backend::{BackendFailure, BackendReply};
use crate::config::RouterSettings;
use crate::error::{GatewayError, GatewayResult};
use crate::registry::{ModelEntry, Registry};
use crate::supervisor::Supervisor;
use crate::worker::{WorkerLease, WorkerSnapshot, WorkerState};
use axum::body::Bytes;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Semaphore, TryAcquireError};
use tokio::time::Instant;

/// One prediction request, alive until it is answered or failed
#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub id: u64,
    pub model: String,
    pub payload: Bytes,
    pub arrival: Instant,
    pub deadline: Instant,
}

/// Rank workers for selection: Ready with a free slot, least in-flight first
pub fn rank_candidates(candidates: &[WorkerSnapshot]) -> Vec<&str> {
    let mut ready: Vec<&WorkerSnapshot> = candidates
        .iter()
        .filter(|w| w.state == WorkerState::Ready && w.in_flight < w.slots)
        .collect();
    ready.sort_by_key(|w| w.in_flight);
    ready.into_iter().map(|w| w.id.as_str()).collect()
}

/// Admission bound of one model registration
#[derive(Clone)]
struct AdmissionQueue {
    generation: u64,
    permits: Arc<Semaphore>,
}

/// Dispatches prediction requests to model workers
pub struct Router {
    registry: Arc<Registry>,
    supervisor: Arc<Supervisor>,
    settings: RouterSettings,
    /// Per-model admission bound; a permit is held for the whole request
    queues: DashMap<String, AdmissionQueue>,
    next_id: AtomicU64,
}

impl Router {
    pub fn new(
        registry: Arc<Registry>,
        supervisor: Arc<Supervisor>,
        settings: RouterSettings,
    ) -> Self {
        Self {
            registry,
            supervisor,
            settings,
            queues: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Build a request, clamping a caller-supplied timeout to the configured maximum
    pub fn request(
        &self,
        model: &str,
        payload: Bytes,
        timeout: Option<Duration>,
    ) -> PendingRequest {
        let timeout = timeout
            .unwrap_or(self.settings.request_timeout)
            .min(self.settings.max_request_timeout);
        let arrival = Instant::now();

        PendingRequest {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            model: model.to_string(),
            payload,
            arrival,
            deadline: arrival + timeout,
        }
    }

    /// Route a request to a worker and relay its reply
    ///
    /// Every request finishes exactly once: with the backend reply or with one
    /// gateway error.
    pub async fn dispatch(&self, request: PendingRequest) -> GatewayResult<BackendReply> {
        let model = request.model.clone();
        let id = request.id;
        let arrival = request.arrival;

        let result = self.admit_and_run(request).await;

        let outcome = match &result {
            Ok(_) => "success",
            Err(e) => e.kind(),
        };
        crate::metrics::record_request(&model, outcome, arrival.elapsed());

        match &result {
            Ok(reply) => tracing::debug!(
                request_id = id,
                model = %model,
                status = reply.status,
                elapsed_ms = arrival.elapsed().as_millis() as u64,
                "Prediction served"
            ),
            Err(e) => tracing::debug!(
                request_id = id,
                model = %model,
                error = %e,
                "Prediction failed"
            ),
        }

        result
    }

    /// Drop the admission queue of an unregistered model
    ///
    /// Queues created for a later registration of the same name are kept.
    pub fn forget(&self, model: &str, generation: u64) {
        if let Some((_, queue)) = self
            .queues
            .remove_if(model, |_, q| q.generation <= generation)
        {
            queue.permits.close();
        }
    }

    /// Requests currently admitted for a model (waiting or in flight)
    pub fn queued(&self, model: &str) -> usize {
        match (self.queues.get(model), self.registry.lookup(model)) {
            (Some(queue), Ok(entry)) if queue.generation == entry.generation => entry
                .queue_depth
                .saturating_sub(queue.permits.available_permits()),
            _ => 0,
        }
    }

    fn queue_for(&self, entry: &ModelEntry) -> GatewayResult<Arc<Semaphore>> {
        let fresh = || AdmissionQueue {
            generation: entry.generation,
            permits: Arc::new(Semaphore::new(entry.queue_depth)),
        };

        match self.queues.entry(entry.name.clone()) {
            Entry::Vacant(vacant) => Ok(vacant.insert(fresh()).permits.clone()),
            Entry::Occupied(mut occupied) => {
                let current = occupied.get().generation;
                if current == entry.generation {
                    Ok(occupied.get().permits.clone())
                } else if current > entry.generation {
                    // The entry was replaced while this request was being admitted
                    Err(GatewayError::NotFound {
                        name: entry.name.clone(),
                    })
                } else {
                    let queue = fresh();
                    let permits = queue.permits.clone();
                    occupied.insert(queue).permits.close();
                    Ok(permits)
                }
            }
        }
    }

    async fn admit_and_run(&self, request: PendingRequest) -> GatewayResult<BackendReply> {
        let entry = self.registry.lookup(&request.model)?;

        let _permit = self
            .queue_for(&entry)?
            .try_acquire_owned()
            .map_err(|e| match e {
                TryAcquireError::NoPermits => GatewayError::Overloaded {
                    name: entry.name.clone(),
                    reason: format!("queue depth {} exhausted", entry.queue_depth),
                },
                TryAcquireError::Closed => GatewayError::NotFound {
                    name: entry.name.clone(),
                },
            })?;

        match tokio::time::timeout_at(request.deadline, self.run(&request)).await {
            Ok(result) => result,
            // Dropping the run future cancels the backend call and returns the lease
            Err(_) => Err(GatewayError::Timeout {
                name: request.model.clone(),
                request_id: request.id,
                elapsed_ms: request.arrival.elapsed().as_millis() as u64,
            }),
        }
    }

    async fn run(&self, request: &PendingRequest) -> GatewayResult<BackendReply> {
        loop {
            let lease = self.acquire(&request.model).await?;

            match lease.backend.predict(request.payload.clone()).await {
                Ok(reply) => return Ok(reply),
                Err(BackendFailure::Rejected { status, body }) => {
                    return Err(GatewayError::BackendError { status, body });
                }
                Err(BackendFailure::Unreachable(reason)) => {
                    // Never delivered, so another worker may take it
                    tracing::warn!(
                        request_id = request.id,
                        instance = %lease.instance_id,
                        reason = %reason,
                        "Worker unreachable, re-selecting"
                    );
                    self.supervisor
                        .report_crash(lease.model_name(), &lease.instance_id, &reason);
                }
                Err(BackendFailure::Crashed(reason)) => {
                    self.supervisor
                        .report_crash(lease.model_name(), &lease.instance_id, &reason);
                    let crashed = GatewayError::BackendCrashed {
                        instance: lease.instance_id.clone(),
                        reason,
                    };
                    return Err(absorb_crash(&request.model, crashed));
                }
            }
        }
    }

    /// Wait for a Ready worker with a free slot and lease it
    async fn acquire(&self, model: &str) -> GatewayResult<WorkerLease> {
        loop {
            let Some(signal) = self.supervisor.capacity_signal(model) else {
                return Err(self.no_workers(model));
            };
            let notified = signal.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let Some(candidates) = self.supervisor.candidates(model) else {
                return Err(self.no_workers(model));
            };
            for id in rank_candidates(&candidates) {
                if let Some(lease) = self.supervisor.try_lease(model, id) {
                    return Ok(lease);
                }
            }

            notified.await;
        }
    }

    fn no_workers(&self, model: &str) -> GatewayError {
        if self.registry.contains(model) {
            GatewayError::Overloaded {
                name: model.to_string(),
                reason: "no workers are being supervised".to_string(),
            }
        } else {
            GatewayError::NotFound {
                name: model.to_string(),
            }
        }
    }
}

/// Callers never see a raw worker crash; they see an overloaded model
fn absorb_crash(model: &str, err: GatewayError) -> GatewayError {
    match err {
        GatewayError::BackendCrashed { instance, reason } => GatewayError::Overloaded {
            name: model.to_string(),
            reason: format!("worker {} crashed mid-request: {}", instance, reason),
        },
        other => other,
    }
}
