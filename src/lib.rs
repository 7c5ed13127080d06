//! Inference Gateway - local model-serving front door
//!
//! Registers models, keeps a pool of worker processes alive for each one, and
//! routes prediction requests to them with bounded queues and per-request
//! deadlines.

pub mod api;
pub mod backend;
pub mod config;
pub mod error;
pub mod metrics;
pub mod process;
pub mod registry;
pub mod router;
pub mod state;
pub mod supervisor;
pub mod worker;

pub use backend::{BackendFailure, BackendReply, HttpBackend, InferenceBackend};
pub use config::{GatewayConfig, ModelConfig, RouterSettings, SupervisorSettings};
pub use error::{GatewayError, GatewayResult};
pub use process::{ProcessHandle, ProcessManager, SpawnConfig, SystemProcessManager};
pub use registry::{ModelEntry, ModelState, Registry};
pub use router::{PendingRequest, Router};
pub use state::StateManager;
pub use supervisor::{HeartbeatOutcome, ModelStatus, Supervisor};
pub use worker::{WorkerSnapshot, WorkerState};
