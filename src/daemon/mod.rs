//! Device-resident daemon.
//!
//! One thread per device waits on the daemon event channel. Each
//! `RequestAvailable` event pulls one encoded [`DeployRequest`] from the
//! request queue, hands it to the [`EventHandler`], posts the encoded
//! [`DeployResponse`] on the response queue and emits exactly one
//! `RequestDone` event. Handler failures become responses; only a broken
//! event channel ends the loop.

mod comm;
mod handler;
pub mod protocol;
mod var_manager;

pub use comm::{CommError, CommInitFn, CommLibrary, RANK_TABLE_INIT_SYMBOL};
pub use handler::EventHandler;
pub use protocol::{
    decode_request, decode_response, encode_request, encode_response, encode_sequenced_request, request_seq,
    DeployRequest, DeployResponse, ProtocolError, SharedContentDesc, VarManagerInfo, DEFAULT_MAX_MESSAGE_SIZE,
};
pub use var_manager::{VarError, VarManager, Variable};

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::device::{DeviceError, DeviceEvent, DeviceRuntime, EventChannel, QueueId};
use crate::executor::{EventDispatcher, ExecutionBackend, ExecutorConfig, ExecutorEnv, ExecutorError};
use crate::status::{HasStatus, StatusCode};

/// Device queue carrying encoded requests.
pub const REQUEST_QUEUE_NAME: &str = "deploy.request";
/// Device queue carrying encoded responses.
pub const RESPONSE_QUEUE_NAME: &str = "deploy.response";

const CONTROL_QUEUE_DEPTH: usize = 4;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DaemonError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Executor(#[from] ExecutorError),

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Var(#[from] VarError),

    #[error(transparent)]
    Comm(#[from] CommError),

    #[error("Root model {root_model_id} partially unloaded: {detail}")]
    PartialUnload { root_model_id: u32, detail: String },

    #[error("Failed to spawn daemon thread: {0}")]
    Spawn(String),
}

impl HasStatus for DaemonError {
    fn status(&self) -> StatusCode {
        match self {
            DaemonError::Protocol(e) => e.status(),
            DaemonError::Executor(e) => e.status(),
            DaemonError::Device(e) => e.status(),
            DaemonError::Var(e) => e.status(),
            DaemonError::Comm(e) => e.status(),
            DaemonError::PartialUnload { .. } | DaemonError::Spawn(_) => StatusCode::Failed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonState {
    Initializing,
    EventLoop,
    Finalizing,
}

#[derive(Debug, Clone, Copy)]
pub struct DaemonConfig {
    /// Bound on each wait for a daemon event.
    pub event_poll: Duration,
    /// Bound on dequeuing a request after `RequestAvailable`.
    pub request_timeout: Duration,
    pub dispatcher_poll: Duration,
    pub max_message_size: usize,
    pub executor: ExecutorConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            event_poll: Duration::from_millis(100),
            request_timeout: Duration::from_secs(1),
            dispatcher_poll: Duration::from_millis(50),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            executor: ExecutorConfig::default(),
        }
    }
}

pub struct DeviceDaemon {
    runtime: Arc<DeviceRuntime>,
    dispatcher: Arc<EventDispatcher>,
    handler: EventHandler,
    config: DaemonConfig,
    request_queue: QueueId,
    response_queue: QueueId,
    state: DaemonState,
    stop: CancellationToken,
}

impl DeviceDaemon {
    /// Create the control queues and the event dispatcher for `runtime`.
    pub fn new(
        runtime: Arc<DeviceRuntime>,
        backend: Arc<dyn ExecutionBackend>,
        comm: CommLibrary,
        config: DaemonConfig,
    ) -> Result<Self, DaemonError> {
        let request_queue = runtime.create_queue(REQUEST_QUEUE_NAME, CONTROL_QUEUE_DEPTH)?;
        let response_queue = match runtime.create_queue(RESPONSE_QUEUE_NAME, CONTROL_QUEUE_DEPTH) {
            Ok(id) => id,
            Err(e) => {
                let _ = runtime.destroy_queue(request_queue);
                return Err(e.into());
            }
        };
        let dispatcher = match EventDispatcher::start(Arc::clone(&runtime), config.dispatcher_poll) {
            Ok(d) => d,
            Err(e) => {
                let _ = runtime.destroy_queue(request_queue);
                let _ = runtime.destroy_queue(response_queue);
                return Err(e.into());
            }
        };
        let env = ExecutorEnv::new(Arc::clone(&runtime), Arc::clone(&dispatcher), backend, config.executor);
        let handler = EventHandler::new(Arc::new(env), comm, config.max_message_size);
        tracing::info!(device = %runtime.device(), "device daemon initialized");
        Ok(Self {
            runtime,
            dispatcher,
            handler,
            config,
            request_queue,
            response_queue,
            state: DaemonState::Initializing,
            stop: CancellationToken::new(),
        })
    }

    pub fn state(&self) -> DaemonState {
        self.state
    }

    pub fn handler(&self) -> &EventHandler {
        &self.handler
    }

    /// Cancelling the token ends the loop at the next poll.
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// Run the event loop until `Finalize`, cancellation or channel failure.
    /// Resources are released on every exit path.
    pub fn run(&mut self) -> Result<(), DaemonError> {
        self.state = DaemonState::EventLoop;
        let events = Arc::clone(self.runtime.events(EventChannel::Daemon));
        let result = loop {
            if self.stop.is_cancelled() {
                break Ok(());
            }
            match events.wait(self.config.event_poll) {
                Ok(None) => continue,
                Ok(Some(DeviceEvent::Heartbeat)) => {
                    tracing::trace!(device = %self.runtime.device(), "heartbeat");
                }
                Ok(Some(DeviceEvent::Finalize)) => break Ok(()),
                Ok(Some(DeviceEvent::RequestAvailable)) => {
                    if let Err(e) = self.serve_request() {
                        break Err(e);
                    }
                }
                Ok(Some(other)) => {
                    tracing::debug!(event = ?other, "ignoring event on daemon channel");
                }
                Err(e) => break Err(e.into()),
            }
        };
        if let Err(e) = &result {
            tracing::error!(device = %self.runtime.device(), error = %e, "daemon event loop failed");
        }
        self.finalize();
        result
    }

    /// Move the daemon onto its own thread.
    pub fn spawn(mut self) -> Result<JoinHandle<Result<(), DaemonError>>, DaemonError> {
        std::thread::Builder::new()
            .name(format!("daemon-{}", self.runtime.device().key()))
            .spawn(move || self.run())
            .map_err(|e| DaemonError::Spawn(e.to_string()))
    }

    /// Handle one request. Errors only when the response channel is gone.
    fn serve_request(&mut self) -> Result<(), DaemonError> {
        let response = match self.runtime.dequeue(self.request_queue, self.config.request_timeout) {
            Ok(mbuf) => self.handler.process(mbuf.as_slice()),
            Err(e) => {
                tracing::warn!(error = %e, "request signalled but none queued");
                DeployResponse::error(e.status(), format!("request queue: {e}"))
            }
        };
        let mut success = response.is_success();
        if let Err(e) = self.post_response(&response) {
            tracing::warn!(error = %e, "response could not be posted");
            success = false;
        }
        self.runtime
            .events(EventChannel::Response)
            .submit(DeviceEvent::RequestDone { success })?;
        Ok(())
    }

    fn post_response(&self, response: &DeployResponse) -> Result<(), DaemonError> {
        let bytes = encode_response(response)?;
        let mbuf = self.runtime.mbuf_from(&bytes)?;
        self.runtime.enqueue(self.response_queue, mbuf, self.config.request_timeout)?;
        Ok(())
    }

    fn finalize(&mut self) {
        self.state = DaemonState::Finalizing;
        self.handler.clear();
        self.dispatcher.stop();
        for queue in [self.request_queue, self.response_queue] {
            if let Err(e) = self.runtime.destroy_queue(queue) {
                tracing::debug!(queue, error = %e, "control queue already gone");
            }
        }
        tracing::info!(device = %self.runtime.device(), "device daemon finalized");
    }
}

impl std::fmt::Debug for DeviceDaemon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceDaemon")
            .field("device", &self.runtime.device())
            .field("state", &self.state)
            .finish()
    }
}
