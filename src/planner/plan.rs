//! Deploy plan: the output of the planner and the contract with the deployer.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use super::device::DeviceInfo;
use super::submodel::Artifact;
use super::PlanError;

/// One entry of the global queue index space.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedQueue {
    pub name: String,
    pub depth: u32,
    /// Device hosting the queue; `None` places it on the host side.
    pub placement: Option<DeviceInfo>,
}

/// Data flows from `src_index` to `dst_index`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct QueueBinding {
    pub src_index: usize,
    pub dst_index: usize,
}

/// A resolved submodel instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubmodelInfo {
    /// Flat (pre-replication) submodel name.
    pub model_name: String,
    #[serde(skip)]
    pub artifact: Artifact,
    pub artifact_size: usize,
    /// Hex SHA-256 of the artifact.
    pub artifact_digest: String,
    pub device: DeviceInfo,
    pub input_queue_indices: Vec<usize>,
    pub output_queue_indices: Vec<usize>,
    pub control_input_queue_indices: Vec<usize>,
}

impl SubmodelInfo {
    /// Data inputs followed by control inputs, the order used at load time.
    pub fn load_input_indices(&self) -> impl Iterator<Item = usize> + '_ {
        self.input_queue_indices
            .iter()
            .chain(&self.control_input_queue_indices)
            .copied()
    }
}

/// Flat, device-resolved deployment artifact. Read-only once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeployPlan {
    pub(super) queues: Vec<PlannedQueue>,
    pub(super) bindings: Vec<QueueBinding>,
    pub(super) submodels: BTreeMap<String, SubmodelInfo>,
    pub(super) root_input_indices: Vec<usize>,
    pub(super) root_output_indices: Vec<usize>,
    pub(super) root_control_input_indices: Vec<usize>,
}

impl DeployPlan {
    pub fn queues(&self) -> &[PlannedQueue] {
        &self.queues
    }

    pub fn queue_count(&self) -> usize {
        self.queues.len()
    }

    pub fn bindings(&self) -> &[QueueBinding] {
        &self.bindings
    }

    pub fn submodels(&self) -> &BTreeMap<String, SubmodelInfo> {
        &self.submodels
    }

    pub fn root_input_indices(&self) -> &[usize] {
        &self.root_input_indices
    }

    pub fn root_output_indices(&self) -> &[usize] {
        &self.root_output_indices
    }

    pub fn root_control_input_indices(&self) -> &[usize] {
        &self.root_control_input_indices
    }

    /// Index of the queue with `name`, if any.
    pub fn queue_index(&self, name: &str) -> Option<usize> {
        self.queues.iter().position(|q| q.name == name)
    }

    /// Distinct devices hosting at least one submodel instance.
    pub fn devices(&self) -> BTreeSet<DeviceInfo> {
        self.submodels.values().map(|s| s.device).collect()
    }

    /// Check the structural invariants: unique names, valid indices,
    /// no self-bindings and no duplicate bindings.
    pub fn validate(&self) -> Result<(), PlanError> {
        let count = self.queues.len();
        let mut names = BTreeSet::new();
        for queue in &self.queues {
            if !names.insert(queue.name.as_str()) {
                return Err(PlanError::Inconsistent(format!("queue {} listed twice", queue.name)));
            }
        }

        let check = |idx: usize, owner: &str| {
            if idx < count {
                Ok(())
            } else {
                Err(PlanError::Inconsistent(format!("{} references queue index {}", owner, idx)))
            }
        };
        for (name, info) in &self.submodels {
            for idx in info
                .input_queue_indices
                .iter()
                .chain(&info.output_queue_indices)
                .chain(&info.control_input_queue_indices)
            {
                check(*idx, name)?;
            }
        }
        for idx in self
            .root_input_indices
            .iter()
            .chain(&self.root_output_indices)
            .chain(&self.root_control_input_indices)
        {
            check(*idx, "root")?;
        }

        let mut seen = BTreeSet::new();
        for binding in &self.bindings {
            check(binding.src_index, "binding")?;
            check(binding.dst_index, "binding")?;
            if binding.src_index == binding.dst_index {
                return Err(PlanError::Inconsistent(format!(
                    "self binding on queue {}",
                    binding.src_index
                )));
            }
            if !seen.insert(*binding) {
                return Err(PlanError::Inconsistent(format!("duplicate binding {:?}", binding)));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue(name: &str) -> PlannedQueue {
        PlannedQueue { name: name.into(), depth: 2, placement: None }
    }

    fn empty_plan() -> DeployPlan {
        DeployPlan {
            queues: vec![queue("a"), queue("b")],
            bindings: Vec::new(),
            submodels: BTreeMap::new(),
            root_input_indices: vec![0],
            root_output_indices: vec![1],
            root_control_input_indices: Vec::new(),
        }
    }

    #[test]
    fn valid_plan_passes() {
        let mut plan = empty_plan();
        plan.bindings.push(QueueBinding { src_index: 0, dst_index: 1 });
        assert!(plan.validate().is_ok());
        assert_eq!(plan.queue_index("b"), Some(1));
    }

    #[test]
    fn self_binding_is_rejected() {
        let mut plan = empty_plan();
        plan.bindings.push(QueueBinding { src_index: 1, dst_index: 1 });
        assert!(matches!(plan.validate(), Err(PlanError::Inconsistent(_))));
    }

    #[test]
    fn out_of_range_root_index_is_rejected() {
        let mut plan = empty_plan();
        plan.root_output_indices.push(7);
        assert!(plan.validate().is_err());
    }
}
