//! API request and response models

use crate::config::ModelConfig;
use crate::registry::{ModelEntry, ModelState};
use crate::supervisor::ModelStatus;
use crate::worker::{WorkerSnapshot, WorkerState};
use serde::{Deserialize, Serialize};

/// Ping response
#[derive(Debug, Serialize, Deserialize)]
pub struct PingResponse {
    pub status: String,
}

/// Request to register a new model
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterModelRequest {
    pub name: String,
    pub artifact: String,
    pub instance_count: usize,

    /// Admission bound; falls back to the gateway's default queue depth
    #[serde(default)]
    pub queue_depth: Option<usize>,

    #[serde(default)]
    pub slots_per_instance: Option<usize>,

    #[serde(default)]
    pub extra_args: Option<Vec<String>>,
}

impl From<RegisterModelRequest> for ModelConfig {
    fn from(req: RegisterModelRequest) -> Self {
        ModelConfig {
            name: req.name,
            artifact: req.artifact,
            instance_count: req.instance_count,
            queue_depth: req.queue_depth,
            slots_per_instance: req.slots_per_instance.unwrap_or(1),
            extra_args: req.extra_args.unwrap_or_default(),
        }
    }
}

/// One row of `GET /models`
#[derive(Debug, Serialize, Deserialize)]
pub struct ModelSummary {
    pub name: String,
    pub state: ModelState,
    /// Live workers currently held by the supervisor
    pub instances: usize,
}

/// Full view returned by `GET /models/{name}`
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelDetail {
    pub name: String,
    pub artifact: String,
    pub state: ModelState,
    pub instance_count: usize,
    pub queue_depth: usize,
    pub slots_per_instance: usize,
    pub queued: usize,
    pub restarts: u64,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub workers: Vec<WorkerInfo>,
}

impl ModelDetail {
    pub fn new(entry: ModelEntry, status: Option<ModelStatus>, queued: usize) -> Self {
        let (workers, restarts) = match status {
            Some(status) => (
                status.workers.iter().map(WorkerInfo::from).collect(),
                status.restarts,
            ),
            None => (Vec::new(), 0),
        };

        Self {
            name: entry.name,
            artifact: entry.artifact,
            state: entry.state,
            instance_count: entry.instance_count,
            queue_depth: entry.queue_depth,
            slots_per_instance: entry.slots_per_instance,
            queued,
            restarts,
            created_at: entry.created_at,
            workers,
        }
    }
}

/// Worker row inside a model detail
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerInfo {
    pub id: String,
    pub state: WorkerState,
    pub pid: Option<u32>,
    pub port: u16,
    pub in_flight: usize,
    pub slots: usize,
    pub uptime_secs: u64,
    pub last_heartbeat: Option<chrono::DateTime<chrono::Utc>>,
}

impl From<&WorkerSnapshot> for WorkerInfo {
    fn from(snapshot: &WorkerSnapshot) -> Self {
        Self {
            id: snapshot.id.clone(),
            state: snapshot.state,
            pid: snapshot.pid,
            port: snapshot.port,
            in_flight: snapshot.in_flight,
            slots: snapshot.slots,
            uptime_secs: (chrono::Utc::now() - snapshot.started_at)
                .num_seconds()
                .max(0) as u64,
            last_heartbeat: snapshot.last_heartbeat,
        }
    }
}
