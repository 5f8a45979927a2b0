//! Control-side composition root.
//!
//! [`MasterModelDeployer`] plans a submodel set, provisions and binds the
//! plan's queues through a [`QueueFabric`], then drives each device daemon
//! through pre-download, chunked download and load. A failed deployment is
//! rolled back: devices unload the root model and every created queue is
//! destroyed.

mod client;
mod cluster;
mod deployed;

pub use client::{DeviceClient, LocalDeviceClient, QueueFabric};
pub use cluster::{ClusterConfig, LocalCluster, HOST_DEVICE_ID};
pub use deployed::{DeployedModel, DeployedSubmodel, QueueRoute};

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use futures::future::{join_all, try_join_all};
use thiserror::Error;
use tracing::Instrument;
use uuid::Uuid;

use crate::daemon::{DaemonError, DeployRequest, ProtocolError};
use crate::device::DeviceError;
use crate::planner::{DeployPlan, DeployPlanner, DeviceInfo, ModelRelation, PlanError, Submodel, SubmodelInfo};
use crate::status::{HasStatus, StatusCode};
use crate::telemetry::{self, DeploySpan, SpanExt};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeployError {
    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Daemon(#[from] DaemonError),

    #[error("Device {device} rejected {kind}: {message} ({status})")]
    Remote {
        device: DeviceInfo,
        kind: &'static str,
        status: StatusCode,
        message: String,
    },

    #[error("Device {device} timed out on {kind}")]
    Timeout { device: DeviceInfo, kind: &'static str },

    #[error("Transport to device {device} failed: {reason}")]
    Transport { device: DeviceInfo, reason: String },

    #[error("No client for device {0}")]
    UnknownDevice(DeviceInfo),

    #[error("No devices")]
    NoDevices,

    #[error("Queue {queue} is not placed on device {device}")]
    Placement { queue: String, device: DeviceInfo },

    #[error("Unknown boundary queue: {0}")]
    UnknownQueue(String),

    #[error("Root model {0} is not deployed")]
    NotDeployed(u32),
}

impl HasStatus for DeployError {
    fn status(&self) -> StatusCode {
        match self {
            DeployError::Plan(e) => e.status(),
            DeployError::Device(e) => e.status(),
            DeployError::Protocol(e) => e.status(),
            DeployError::Daemon(e) => e.status(),
            DeployError::Remote { status, .. } => *status,
            DeployError::Timeout { .. } | DeployError::Transport { .. } => StatusCode::Failed,
            DeployError::UnknownDevice(_) | DeployError::UnknownQueue(_) | DeployError::NotDeployed(_) => {
                StatusCode::NotFound
            }
            DeployError::NoDevices | DeployError::Placement { .. } => StatusCode::ParamInvalid,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DeployerConfig {
    pub request_timeout: Duration,
    pub download_chunk_size: usize,
    pub max_message_size: usize,
    pub default_queue_depth: u32,
}

impl Default for DeployerConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            download_chunk_size: 1024 * 1024,
            max_message_size: crate::daemon::DEFAULT_MAX_MESSAGE_SIZE,
            default_queue_depth: crate::planner::DEFAULT_QUEUE_DEPTH,
        }
    }
}

/// What a deployment created before it failed.
#[derive(Default)]
struct Progress {
    routes: Vec<QueueRoute>,
    devices: BTreeSet<DeviceInfo>,
}

pub struct MasterModelDeployer {
    planner: DeployPlanner,
    fabric: Arc<dyn QueueFabric>,
    clients: BTreeMap<DeviceInfo, Arc<dyn DeviceClient>>,
    config: DeployerConfig,
    deployed: DashMap<u32, DeployedModel>,
    next_root_id: AtomicU32,
}

impl MasterModelDeployer {
    pub fn new(fabric: Arc<dyn QueueFabric>, clients: Vec<Arc<dyn DeviceClient>>, config: DeployerConfig) -> Self {
        Self {
            planner: DeployPlanner::new().with_default_queue_depth(config.default_queue_depth),
            fabric,
            clients: clients.into_iter().map(|c| (c.device(), c)).collect(),
            config,
            deployed: DashMap::new(),
            next_root_id: AtomicU32::new(1),
        }
    }

    /// Devices with a registered client, in order.
    pub fn devices(&self) -> Vec<DeviceInfo> {
        self.clients.keys().copied().collect()
    }

    /// Deploy across every known device.
    pub async fn deploy(
        &self,
        models: &[Submodel],
        relation: Option<&ModelRelation>,
    ) -> Result<DeployedModel, DeployError> {
        let devices = self.devices();
        self.deploy_on(models, relation, &devices).await
    }

    pub async fn deploy_on(
        &self,
        models: &[Submodel],
        relation: Option<&ModelRelation>,
        devices: &[DeviceInfo],
    ) -> Result<DeployedModel, DeployError> {
        let started = Instant::now();
        let plan = self.planner.build_plan(models, relation, devices)?;
        if let Some(missing) = plan.devices().into_iter().find(|d| !self.clients.contains_key(d)) {
            return Err(DeployError::UnknownDevice(missing));
        }

        let root_model_id = self.next_root_id.fetch_add(1, Ordering::Relaxed);
        let span = DeploySpan::deploy(root_model_id, plan.submodels().len());
        let mut progress = Progress::default();
        let result = self
            .run_deploy(root_model_id, &plan, &mut progress)
            .instrument(span.clone())
            .await;
        span.record_result(&result);
        telemetry::record_deploy(started.elapsed(), result.is_ok());

        match result {
            Ok(deployed) => {
                self.deployed.insert(root_model_id, deployed.clone());
                telemetry::set_deployed_models(self.deployed.len());
                tracing::info!(
                    root_model_id,
                    route_id = %deployed.route_id,
                    submodels = deployed.submodels.len(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "deployment complete"
                );
                Ok(deployed)
            }
            Err(e) => {
                tracing::warn!(root_model_id, error = %e, "deployment failed, rolling back");
                self.rollback(root_model_id, progress).await;
                Err(e)
            }
        }
    }

    async fn run_deploy(
        &self,
        root_model_id: u32,
        plan: &DeployPlan,
        progress: &mut Progress,
    ) -> Result<DeployedModel, DeployError> {
        for queue in plan.queues() {
            let device_name = DeployedModel::queue_name(root_model_id, &queue.name);
            let route = self.fabric.create_queue(queue.placement, &queue.name, &device_name, queue.depth)?;
            progress.routes.push(route);
        }
        for binding in plan.bindings() {
            self.fabric
                .bind(&progress.routes[binding.src_index], &progress.routes[binding.dst_index])?;
        }

        let assignments: Vec<(&str, &SubmodelInfo, u32)> = plan
            .submodels()
            .iter()
            .enumerate()
            .map(|(i, (name, info))| (name.as_str(), info, i as u32))
            .collect();
        progress.devices = plan.devices();
        let routes = &progress.routes;

        try_join_all(assignments.iter().map(|&(_, info, model_id)| {
            self.call(
                info.device,
                DeployRequest::PreDownload {
                    root_model_id,
                    model_id,
                    model_size: info.artifact_size as u64,
                },
            )
        }))
        .await?;

        try_join_all(
            assignments
                .iter()
                .map(|&(name, info, model_id)| self.download(root_model_id, model_id, name, info)),
        )
        .await?;

        try_join_all(assignments.iter().map(|&(name, info, model_id)| async move {
            let input_queues = device_queue_names(routes, info.load_input_indices(), info.device)?;
            let output_queues = device_queue_names(routes, info.output_queue_indices.iter().copied(), info.device)?;
            tracing::debug!(root_model_id, model_id, submodel = name, device = %info.device, "loading");
            self.call(info.device, DeployRequest::Load { root_model_id, model_id, input_queues, output_queues })
                .await
        }))
        .await?;

        Ok(DeployedModel {
            root_model_id,
            route_id: Uuid::new_v4(),
            deployed_at: Utc::now(),
            devices: plan.devices(),
            submodels: assignments
                .iter()
                .map(|&(name, info, model_id)| {
                    let record = DeployedSubmodel {
                        model_id,
                        device: info.device,
                        artifact_digest: info.artifact_digest.clone(),
                    };
                    (name.to_string(), record)
                })
                .collect(),
            queues: routes.clone(),
            root_input_indices: plan.root_input_indices().to_vec(),
            root_output_indices: plan.root_output_indices().to_vec(),
            root_control_input_indices: plan.root_control_input_indices().to_vec(),
        })
    }

    async fn download(
        &self,
        root_model_id: u32,
        model_id: u32,
        name: &str,
        info: &SubmodelInfo,
    ) -> Result<(), DeployError> {
        let bytes = info.artifact.as_bytes();
        tracing::debug!(
            root_model_id,
            model_id,
            submodel = name,
            size = bytes.len(),
            digest = %info.artifact_digest,
            "downloading artifact"
        );
        let mut offset = 0u64;
        for piece in bytes.chunks(self.config.download_chunk_size.max(1)) {
            let request = DeployRequest::Download {
                root_model_id,
                model_id,
                offset,
                model_data: piece.to_vec(),
            };
            self.call(info.device, request).await?;
            offset += piece.len() as u64;
        }
        Ok(())
    }

    /// Send one request and turn a non-success response into an error.
    async fn call(&self, device: DeviceInfo, request: DeployRequest) -> Result<(), DeployError> {
        let client = self.clients.get(&device).ok_or(DeployError::UnknownDevice(device))?;
        let kind = request.kind();
        let span = DeploySpan::request(kind, &device.key());
        let result = match client.send(request).instrument(span.clone()).await {
            Ok(response) if response.is_success() => Ok(()),
            Ok(response) => Err(DeployError::Remote {
                device,
                kind,
                status: response.status(),
                message: response.error_message,
            }),
            Err(e) => Err(e),
        };
        span.record_result(&result);
        result
    }

    async fn rollback(&self, root_model_id: u32, progress: Progress) {
        let unloads = progress
            .devices
            .iter()
            .map(|&device| async move { (device, self.call(device, DeployRequest::Unload { model_id: root_model_id }).await) });
        for (device, outcome) in join_all(unloads).await {
            match outcome {
                Ok(()) => {}
                Err(e) if e.status() == StatusCode::NotFound => {}
                Err(e) => tracing::warn!(root_model_id, device = %device, error = %e, "rollback unload failed"),
            }
        }
        self.destroy_routes(&progress.routes);
    }

    fn destroy_routes(&self, routes: &[QueueRoute]) {
        for route in routes.iter().rev() {
            if let Err(e) = self.fabric.destroy_queue(route) {
                tracing::warn!(queue = %route.device_name, error = %e, "queue teardown failed");
            }
        }
    }

    /// Unload a deployed root model everywhere and destroy its queues.
    pub async fn undeploy(&self, root_model_id: u32) -> Result<(), DeployError> {
        let (_, deployed) = self
            .deployed
            .remove(&root_model_id)
            .ok_or(DeployError::NotDeployed(root_model_id))?;
        let span = DeploySpan::undeploy(root_model_id);
        let unloads = deployed
            .devices
            .iter()
            .map(|&device| self.call(device, DeployRequest::Unload { model_id: root_model_id }));
        let outcomes = join_all(unloads).instrument(span.clone()).await;
        self.destroy_routes(&deployed.queues);
        telemetry::set_deployed_models(self.deployed.len());

        let result = outcomes.into_iter().collect::<Result<Vec<_>, _>>().map(|_| ());
        span.record_result(&result);
        if result.is_ok() {
            tracing::info!(root_model_id, route_id = %deployed.route_id, "undeployed");
        }
        result
    }

    pub fn get(&self, root_model_id: u32) -> Option<DeployedModel> {
        self.deployed.get(&root_model_id).map(|d| d.clone())
    }

    pub fn deployed_count(&self) -> usize {
        self.deployed.len()
    }
}

fn device_queue_names(
    routes: &[QueueRoute],
    indices: impl Iterator<Item = usize>,
    device: DeviceInfo,
) -> Result<Vec<String>, DeployError> {
    indices
        .map(|i| {
            let route = &routes[i];
            if route.placement != Some(device) {
                return Err(DeployError::Placement { queue: route.name.clone(), device });
            }
            Ok(route.device_name.clone())
        })
        .collect()
}

impl std::fmt::Debug for MasterModelDeployer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterModelDeployer")
            .field("devices", &self.devices())
            .field("deployed", &self.deployed.len())
            .field("config", &self.config)
            .finish()
    }
}
