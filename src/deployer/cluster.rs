//! In-process cluster: one runtime and daemon thread per device plus a host
//! runtime for queues shared across devices.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::daemon::{CommLibrary, DaemonConfig, DaemonError, DeviceDaemon};
use crate::device::{DeviceEvent, DeviceRuntime, EventChannel};
use crate::executor::ExecutionBackend;
use crate::planner::DeviceInfo;

use super::client::{DeviceClient, LocalDeviceClient, QueueFabric};
use super::deployed::{DeployedModel, QueueRoute};
use super::DeployError;

/// Device id reserved for the host runtime.
pub const HOST_DEVICE_ID: u32 = u32::MAX;

#[derive(Debug, Clone, Copy)]
pub struct ClusterConfig {
    /// Mbuf pool per runtime.
    pub mbuf_capacity: usize,
    /// Bound on feed/fetch queue operations.
    pub queue_timeout: Duration,
    /// Bound on one device request round trip.
    pub request_timeout: Duration,
    pub max_message_size: usize,
    pub daemon: DaemonConfig,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        let daemon = DaemonConfig::default();
        Self {
            mbuf_capacity: 256 * 1024 * 1024,
            queue_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(10),
            max_message_size: daemon.max_message_size,
            daemon,
        }
    }
}

struct DeviceNode {
    runtime: Arc<DeviceRuntime>,
    daemon: Option<JoinHandle<Result<(), DaemonError>>>,
}

pub struct LocalCluster {
    host_name: String,
    host: Arc<DeviceRuntime>,
    nodes: BTreeMap<DeviceInfo, DeviceNode>,
    config: ClusterConfig,
}

impl LocalCluster {
    /// Start a runtime and daemon for each distinct device.
    pub fn start(
        devices: &[DeviceInfo],
        backend: Arc<dyn ExecutionBackend>,
        comm: CommLibrary,
        config: ClusterConfig,
    ) -> Result<Self, DeployError> {
        if devices.is_empty() {
            return Err(DeployError::NoDevices);
        }
        let host_name = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "localhost".to_string());
        let host_id = devices[0].host_id;
        let host = Arc::new(DeviceRuntime::new(DeviceInfo::new(host_id, HOST_DEVICE_ID, 0), config.mbuf_capacity));
        let mut cluster = Self { host_name, host, nodes: BTreeMap::new(), config };

        for &device in devices {
            if cluster.nodes.contains_key(&device) {
                continue;
            }
            let runtime = Arc::new(DeviceRuntime::new(device, config.mbuf_capacity));
            let daemon = DeviceDaemon::new(Arc::clone(&runtime), Arc::clone(&backend), comm.clone(), config.daemon)?;
            let handle = daemon.spawn()?;
            cluster.nodes.insert(device, DeviceNode { runtime, daemon: Some(handle) });
        }
        tracing::info!(host = %cluster.host_name, devices = cluster.nodes.len(), "local cluster started");
        Ok(cluster)
    }

    pub fn host_name(&self) -> &str {
        &self.host_name
    }

    pub fn devices(&self) -> Vec<DeviceInfo> {
        self.nodes.keys().copied().collect()
    }

    /// Runtime hosting queues placed on `placement`.
    pub fn runtime(&self, placement: Option<DeviceInfo>) -> Result<&Arc<DeviceRuntime>, DeployError> {
        match placement {
            None => Ok(&self.host),
            Some(device) => self
                .nodes
                .get(&device)
                .map(|n| &n.runtime)
                .ok_or(DeployError::UnknownDevice(device)),
        }
    }

    pub fn clients(&self) -> Result<Vec<Arc<dyn DeviceClient>>, DeployError> {
        self.nodes
            .values()
            .map(|node| {
                let client = LocalDeviceClient::connect(
                    Arc::clone(&node.runtime),
                    self.config.request_timeout,
                    self.config.max_message_size,
                )?;
                Ok(Arc::new(client) as Arc<dyn DeviceClient>)
            })
            .collect()
    }

    /// Post one payload on a root input or control queue.
    pub fn feed(&self, deployed: &DeployedModel, input: &str, bytes: &[u8]) -> Result<(), DeployError> {
        let route = deployed
            .input_route(input)
            .ok_or_else(|| DeployError::UnknownQueue(input.to_string()))?;
        let runtime = self.runtime(route.placement)?;
        runtime.enqueue(route.queue_id, runtime.mbuf_from(bytes)?, self.config.queue_timeout)?;
        Ok(())
    }

    /// Take one payload from a root output queue.
    pub fn fetch(&self, deployed: &DeployedModel, output: &str) -> Result<Vec<u8>, DeployError> {
        let route = deployed
            .output_route(output)
            .ok_or_else(|| DeployError::UnknownQueue(output.to_string()))?;
        let runtime = self.runtime(route.placement)?;
        Ok(runtime.dequeue(route.queue_id, self.config.queue_timeout)?.into_vec())
    }

    /// End-of-graph notifications emitted on `device` since the last call.
    pub fn drain_notifications(&self, device: DeviceInfo) -> Result<Vec<DeviceEvent>, DeployError> {
        let events = self.runtime(Some(device))?.events(EventChannel::Notify);
        let mut drained = Vec::new();
        while let Some(event) = events.wait(Duration::ZERO)? {
            drained.push(event);
        }
        Ok(drained)
    }

    /// Finalize every daemon and wait for it. Idempotent.
    pub fn shutdown(&mut self) -> Result<(), DeployError> {
        let mut first_error = None;
        for (device, node) in &mut self.nodes {
            let Some(handle) = node.daemon.take() else {
                continue;
            };
            if let Err(e) = node.runtime.events(EventChannel::Daemon).submit(DeviceEvent::Finalize) {
                tracing::warn!(device = %device, error = %e, "finalize not delivered");
            }
            let outcome = handle.join().map_err(|_| DeployError::Transport {
                device: *device,
                reason: "daemon thread panicked".into(),
            });
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    first_error.get_or_insert(DeployError::Daemon(e));
                }
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
            node.runtime.shutdown();
        }
        self.host.shutdown();
        first_error.map_or(Ok(()), Err)
    }
}

impl QueueFabric for LocalCluster {
    fn create_queue(
        &self,
        placement: Option<DeviceInfo>,
        name: &str,
        device_name: &str,
        depth: u32,
    ) -> Result<QueueRoute, DeployError> {
        let queue_id = self.runtime(placement)?.create_queue(device_name, depth as usize)?;
        Ok(QueueRoute {
            name: name.to_string(),
            device_name: device_name.to_string(),
            placement,
            queue_id,
        })
    }

    fn bind(&self, src: &QueueRoute, dst: &QueueRoute) -> Result<(), DeployError> {
        let dst_queue = self.runtime(dst.placement)?.queue(dst.queue_id)?;
        self.runtime(src.placement)?.bind(src.queue_id, dst_queue)?;
        Ok(())
    }

    fn destroy_queue(&self, route: &QueueRoute) -> Result<(), DeployError> {
        self.runtime(route.placement)?.destroy_queue(route.queue_id)?;
        Ok(())
    }
}

impl Drop for LocalCluster {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            tracing::warn!(error = %e, "local cluster shutdown reported an error");
        }
    }
}

impl std::fmt::Debug for LocalCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalCluster")
            .field("host_name", &self.host_name)
            .field("devices", &self.devices())
            .finish()
    }
}
