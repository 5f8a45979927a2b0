//! Device-side model lifecycle and execution.
//!
//! [`ExecutorContext`] maps (root id, submodel id) to a [`ModelHandle`];
//! a handle parses its model incrementally, then loads it either as a
//! static runner or as a [`DynamicModelExecutor`] driven by the device's
//! [`EventDispatcher`].

mod backend;
mod context;
mod cycle;
mod dispatcher;
mod dynamic;
mod handle;
mod static_model;
mod tensor_desc;

pub use backend::{ExecutionBackend, IdentityBackend, InputTensor, OutputTensor};
pub use context::ExecutorContext;
pub use cycle::{ExecutionCycle, PreparedInputs};
pub use dispatcher::{ActivatedModel, Completion, EventDispatcher};
pub use dynamic::DynamicModelExecutor;
pub use handle::ModelHandle;
pub use static_model::StaticModelRunner;
pub use tensor_desc::{RuntimeTensorDesc, MAX_DIM_NUM, RUNTIME_TENSOR_DESC_SIZE};

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::device::{DeviceError, DeviceRuntime};
use crate::format::ParseError;
use crate::status::{HasStatus, StatusCode};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutorError {
    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("Model {root_model_id}/{model_id} not found")]
    ModelNotFound { root_model_id: u32, model_id: u32 },

    #[error("Root model {0} not found")]
    RootNotFound(u32),

    #[error("Model {root_model_id}/{model_id} already exists")]
    ModelExists { root_model_id: u32, model_id: u32 },

    #[error("Invalid queue binding: {0}")]
    InvalidBinding(String),

    #[error("Runtime tensor descriptor: {0}")]
    TensorDesc(String),

    #[error("Output {name} overflow: {requested} bytes into {capacity}")]
    OutputOverflow {
        name: String,
        capacity: usize,
        requested: usize,
    },

    #[error("Backend failure: {0}")]
    Backend(String),

    #[error("Worker for model {0} is not running")]
    WorkerStopped(u32),

    #[error("No model registered for activation id {0}")]
    UnknownActivation(u32),

    #[error("Failed to spawn thread: {0}")]
    Spawn(String),

    #[error("Model size {size} exceeds the device limit of {limit} bytes")]
    ModelTooLarge { size: u64, limit: u64 },
}

impl HasStatus for ExecutorError {
    fn status(&self) -> StatusCode {
        match self {
            ExecutorError::Device(e) => e.status(),
            ExecutorError::Parse(e) => e.status(),
            ExecutorError::ModelNotFound { .. }
            | ExecutorError::RootNotFound(_)
            | ExecutorError::UnknownActivation(_) => StatusCode::NotFound,
            ExecutorError::ModelExists { .. } => StatusCode::ProtocolViolation,
            ExecutorError::InvalidBinding(_) => StatusCode::ParamInvalid,
            ExecutorError::OutputOverflow { .. } | ExecutorError::ModelTooLarge { .. } => {
                StatusCode::ResourceExhaustion
            }
            ExecutorError::TensorDesc(_)
            | ExecutorError::Backend(_)
            | ExecutorError::WorkerStopped(_)
            | ExecutorError::Spawn(_) => StatusCode::Failed,
        }
    }
}

/// Largest model a device accepts unless configured otherwise (4 GiB).
pub const DEFAULT_MAX_MODEL_SIZE: u64 = 4 << 30;

/// Timeouts and limits used by loaded models.
#[derive(Debug, Clone, Copy)]
pub struct ExecutorConfig {
    /// Bound on each queue enqueue/dequeue in a cycle.
    pub queue_timeout: Duration,
    /// Worker wake-up interval for observing the stop flag.
    pub worker_poll: Duration,
    /// Upper bound on the size a `pre_download` may declare.
    pub max_model_size: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            queue_timeout: Duration::from_secs(5),
            worker_poll: Duration::from_millis(100),
            max_model_size: DEFAULT_MAX_MODEL_SIZE,
        }
    }
}

/// Everything a handle needs to load a model on one device.
pub struct ExecutorEnv {
    pub runtime: Arc<DeviceRuntime>,
    pub dispatcher: Arc<EventDispatcher>,
    pub backend: Arc<dyn ExecutionBackend>,
    pub config: ExecutorConfig,
    next_model_id: AtomicU32,
}

impl ExecutorEnv {
    pub fn new(
        runtime: Arc<DeviceRuntime>,
        dispatcher: Arc<EventDispatcher>,
        backend: Arc<dyn ExecutionBackend>,
        config: ExecutorConfig,
    ) -> Self {
        Self { runtime, dispatcher, backend, config, next_model_id: AtomicU32::new(1) }
    }

    /// Allocate a device-unique id for a loaded model.
    pub fn next_model_id(&self) -> u32 {
        self.next_model_id.fetch_add(1, Ordering::Relaxed)
    }
}

impl std::fmt::Debug for ExecutorEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorEnv")
            .field("device", &self.runtime.device())
            .field("config", &self.config)
            .finish()
    }
}
