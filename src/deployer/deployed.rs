//! Record of one successful deployment.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::device::QueueId;
use crate::planner::DeviceInfo;

/// Where one planned queue was created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueRoute {
    /// Planner name.
    pub name: String,
    /// Name inside the hosting runtime, unique per root model.
    pub device_name: String,
    /// `None` is the host side.
    pub placement: Option<DeviceInfo>,
    pub queue_id: QueueId,
}

/// A submodel instance as loaded on its device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeployedSubmodel {
    pub model_id: u32,
    pub device: DeviceInfo,
    pub artifact_digest: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeployedModel {
    pub root_model_id: u32,
    pub route_id: Uuid,
    pub deployed_at: DateTime<Utc>,
    pub devices: BTreeSet<DeviceInfo>,
    pub submodels: BTreeMap<String, DeployedSubmodel>,
    /// Index-aligned with the plan's queue list.
    pub queues: Vec<QueueRoute>,
    pub root_input_indices: Vec<usize>,
    pub root_output_indices: Vec<usize>,
    pub root_control_input_indices: Vec<usize>,
}

impl DeployedModel {
    pub fn queue_name(root_model_id: u32, name: &str) -> String {
        format!("r{root_model_id}.{name}")
    }

    fn find(&self, indices: &[usize], name: &str) -> Option<&QueueRoute> {
        indices.iter().map(|&i| &self.queues[i]).find(|q| q.name == name)
    }

    pub fn input_route(&self, name: &str) -> Option<&QueueRoute> {
        self.find(&self.root_input_indices, name)
            .or_else(|| self.find(&self.root_control_input_indices, name))
    }

    pub fn output_route(&self, name: &str) -> Option<&QueueRoute> {
        self.find(&self.root_output_indices, name)
    }

    pub fn input_names(&self) -> impl Iterator<Item = &str> {
        self.root_input_indices.iter().map(|&i| self.queues[i].name.as_str())
    }

    pub fn output_names(&self) -> impl Iterator<Item = &str> {
        self.root_output_indices.iter().map(|&i| self.queues[i].name.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(name: &str, id: QueueId) -> QueueRoute {
        QueueRoute {
            name: name.into(),
            device_name: DeployedModel::queue_name(1, name),
            placement: None,
            queue_id: id,
        }
    }

    #[test]
    fn routes_resolve_by_boundary_name() {
        let deployed = DeployedModel {
            root_model_id: 1,
            route_id: Uuid::new_v4(),
            deployed_at: Utc::now(),
            devices: BTreeSet::new(),
            submodels: BTreeMap::new(),
            queues: vec![route("in", 1), route("out", 2), route("ext", 3)],
            root_input_indices: vec![0],
            root_output_indices: vec![1],
            root_control_input_indices: vec![2],
        };
        assert_eq!(deployed.input_route("in").unwrap().queue_id, 1);
        assert_eq!(deployed.input_route("ext").unwrap().queue_id, 3);
        assert!(deployed.input_route("out").is_none());
        assert_eq!(deployed.output_route("out").unwrap().device_name, "r1.out");
        assert_eq!(deployed.output_names().collect::<Vec<_>>(), vec!["out"]);
    }
}
