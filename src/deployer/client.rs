//! Control-side seams to devices: request transport and queue provisioning.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::daemon::{
    decode_response, encode_sequenced_request, DeployRequest, DeployResponse, REQUEST_QUEUE_NAME,
    RESPONSE_QUEUE_NAME,
};
use crate::device::{DeviceEvent, DeviceRuntime, EventChannel, QueueId};
use crate::planner::DeviceInfo;

use super::deployed::QueueRoute;
use super::DeployError;

/// Sends deploy requests to one device daemon.
#[async_trait]
pub trait DeviceClient: Send + Sync {
    fn device(&self) -> DeviceInfo;

    /// One request, one response. Transport failures are errors; a
    /// non-success response is returned as is.
    async fn send(&self, request: DeployRequest) -> Result<DeployResponse, DeployError>;
}

/// Creates and wires the queues of a plan.
pub trait QueueFabric: Send + Sync {
    fn create_queue(
        &self,
        placement: Option<DeviceInfo>,
        name: &str,
        device_name: &str,
        depth: u32,
    ) -> Result<QueueRoute, DeployError>;

    fn bind(&self, src: &QueueRoute, dst: &QueueRoute) -> Result<(), DeployError>;

    fn destroy_queue(&self, route: &QueueRoute) -> Result<(), DeployError>;
}

/// Client for a daemon running on an in-process [`DeviceRuntime`].
///
/// Requests are serialized: the daemon answers on a single response queue.
/// The turn is held by the blocking round trip itself, so a caller dropping
/// its future never lets a second request overtake an unanswered one.
/// Every request carries a fresh sequence number, and a response echoing
/// another one (a late answer to a timed-out request) is discarded.
pub struct LocalDeviceClient {
    runtime: Arc<DeviceRuntime>,
    request_queue: QueueId,
    response_queue: QueueId,
    timeout: Duration,
    max_message_size: usize,
    in_flight: Arc<tokio::sync::Mutex<()>>,
    next_seq: AtomicU64,
}

impl LocalDeviceClient {
    /// Attach to a daemon already initialized on `runtime`.
    pub fn connect(runtime: Arc<DeviceRuntime>, timeout: Duration, max_message_size: usize) -> Result<Self, DeployError> {
        let request_queue = runtime.queue_id(REQUEST_QUEUE_NAME)?;
        let response_queue = runtime.queue_id(RESPONSE_QUEUE_NAME)?;
        Ok(Self {
            runtime,
            request_queue,
            response_queue,
            timeout,
            max_message_size,
            in_flight: Arc::new(tokio::sync::Mutex::new(())),
            next_seq: AtomicU64::new(1),
        })
    }

    fn round_trip(
        runtime: &DeviceRuntime,
        request_queue: QueueId,
        response_queue: QueueId,
        timeout: Duration,
        max_message_size: usize,
        seq: u64,
        request: &DeployRequest,
    ) -> Result<DeployResponse, DeployError> {
        let device = runtime.device();
        let responses = runtime.events(EventChannel::Response);
        // Leftovers of an earlier timed-out request.
        while let Ok(Some(_)) = responses.wait(Duration::ZERO) {}
        while runtime.dequeue(response_queue, Duration::ZERO).is_ok() {}

        let bytes = encode_sequenced_request(request, seq, max_message_size)?;
        runtime.enqueue(request_queue, runtime.mbuf_from(&bytes)?, timeout)?;
        runtime.events(EventChannel::Daemon).submit(DeviceEvent::RequestAvailable)?;

        let timed_out = || DeployError::Timeout { device, kind: request.kind() };
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match responses.wait(remaining)? {
                Some(DeviceEvent::RequestDone { .. }) => {}
                Some(other) => {
                    tracing::debug!(event = ?other, "unexpected event on response channel");
                    continue;
                }
                None => return Err(timed_out()),
            }
            let mbuf = runtime.dequeue(response_queue, timeout).map_err(|_| timed_out())?;
            let response = decode_response(mbuf.as_slice(), max_message_size)?;
            match response.seq {
                Some(answered) if answered != seq => {
                    tracing::debug!(device = %device, expected = seq, answered, "discarding stale response");
                }
                _ => return Ok(response),
            }
        }
    }
}

#[async_trait]
impl DeviceClient for LocalDeviceClient {
    fn device(&self) -> DeviceInfo {
        self.runtime.device()
    }

    async fn send(&self, request: DeployRequest) -> Result<DeployResponse, DeployError> {
        let turn = Arc::clone(&self.in_flight).lock_owned().await;
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let runtime = Arc::clone(&self.runtime);
        let (request_queue, response_queue) = (self.request_queue, self.response_queue);
        let (timeout, max) = (self.timeout, self.max_message_size);
        tokio::task::spawn_blocking(move || {
            let _turn = turn;
            Self::round_trip(&runtime, request_queue, response_queue, timeout, max, seq, &request)
        })
        .await
        .map_err(|e| DeployError::Transport { device: self.device(), reason: e.to_string() })?
    }
}

impl std::fmt::Debug for LocalDeviceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalDeviceClient")
            .field("device", &self.runtime.device())
            .field("timeout", &self.timeout)
            .finish()
    }
}
