//! Plan construction: flatten, resolve devices, validate, index queues,
//! bind fan-out/fan-in and inject control inputs.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use super::device::DeviceInfo;
use super::flatten::{flatten, FlatModelSet};
use super::plan::{DeployPlan, PlannedQueue, QueueBinding, SubmodelInfo};
use super::relation::{ModelQueueInfo, ModelRelation, DEFAULT_QUEUE_DEPTH};
use super::submodel::Submodel;
use super::PlanError;
use crate::telemetry;

/// A submodel bound to one device, with its device-resolved queue names.
struct Instance {
    model: Submodel,
    device: DeviceInfo,
    info: ModelQueueInfo,
}

/// Global queue index space under construction.
#[derive(Default)]
struct QueueTable {
    queues: Vec<PlannedQueue>,
    index: HashMap<String, usize>,
}

impl QueueTable {
    fn intern(&mut self, name: &str, depth: u32, placement: Option<DeviceInfo>) -> usize {
        if let Some(&idx) = self.index.get(name) {
            return idx;
        }
        let idx = self.queues.len();
        self.queues.push(PlannedQueue { name: name.to_string(), depth, placement });
        self.index.insert(name.to_string(), idx);
        idx
    }
}

/// Builds [`DeployPlan`]s. Stateless between calls; each call is atomic.
#[derive(Debug, Clone)]
pub struct DeployPlanner {
    default_queue_depth: u32,
}

impl Default for DeployPlanner {
    fn default() -> Self {
        Self { default_queue_depth: DEFAULT_QUEUE_DEPTH }
    }
}

impl DeployPlanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Depth for root boundary queues the relation leaves undeclared.
    pub fn with_default_queue_depth(mut self, depth: u32) -> Self {
        self.default_queue_depth = depth.max(1);
        self
    }

    pub fn build_plan(
        &self,
        models: &[Submodel],
        relation: Option<&ModelRelation>,
        devices: &[DeviceInfo],
    ) -> Result<DeployPlan, PlanError> {
        if models.is_empty() {
            return Err(PlanError::EmptyModelSet);
        }
        let devices: Vec<DeviceInfo> = devices.iter().copied().collect::<BTreeSet<_>>().into_iter().collect();
        if devices.is_empty() {
            return Err(PlanError::NoDevices);
        }

        let mut model_map = BTreeMap::new();
        for model in models {
            if model_map.insert(model.name().to_string(), model.clone()).is_some() {
                return Err(PlanError::DuplicateSubmodel(model.name().to_string()));
            }
        }

        let flat = flatten(&model_map, relation)?;
        validate(&flat)?;

        let depths: HashMap<&str, u32> = flat
            .relation
            .queue_defs
            .iter()
            .map(|d| (d.name.as_str(), d.depth))
            .collect();
        let instances = resolve_devices(&flat, &devices);
        let plan = self.assemble(&flat.relation, &instances, &depths)?;

        telemetry::record_plan(plan.queue_count(), plan.bindings().len(), plan.submodels().len());
        tracing::info!(
            submodels = plan.submodels().len(),
            queues = plan.queue_count(),
            bindings = plan.bindings().len(),
            devices = devices.len(),
            "deploy plan built"
        );
        Ok(plan)
    }

    fn assemble(
        &self,
        relation: &ModelRelation,
        instances: &BTreeMap<String, Instance>,
        declared_depths: &HashMap<&str, u32>,
    ) -> Result<DeployPlan, PlanError> {
        let depth_of = |name: &str| {
            let base = name.split('@').next().unwrap_or(name);
            declared_depths
                .get(name)
                .or_else(|| declared_depths.get(base))
                .copied()
                .unwrap_or(self.default_queue_depth)
        };

        // Who references each queue, and from which devices.
        let mut consumers: HashMap<&str, Vec<&str>> = HashMap::new();
        let mut producers: HashMap<&str, Vec<&str>> = HashMap::new();
        let mut users: HashMap<&str, BTreeSet<DeviceInfo>> = HashMap::new();
        for (name, inst) in instances {
            for q in inst.info.input_queue_names.iter().chain(&inst.info.control_input_queue_names) {
                consumers.entry(q.as_str()).or_default().push(name.as_str());
            }
            for q in &inst.info.output_queue_names {
                producers.entry(q.as_str()).or_default().push(name.as_str());
            }
            for q in inst.info.all_names() {
                users.entry(q.as_str()).or_default().insert(inst.device);
            }
        }
        let placement_of = |name: &str| {
            users
                .get(name)
                .filter(|devs| devs.len() == 1)
                .and_then(|devs| devs.iter().next().copied())
        };

        let mut table = QueueTable::default();
        let root = &relation.root_model_queue_info;
        let root_input_indices = root
            .input_queue_names
            .iter()
            .map(|q| table.intern(q, depth_of(q), placement_of(q)))
            .collect();
        let root_output_indices = root
            .output_queue_names
            .iter()
            .map(|q| table.intern(q, depth_of(q), placement_of(q)))
            .collect();
        let root_control_input_indices = root
            .external_queue_names
            .iter()
            .chain(&root.control_input_queue_names)
            .map(|q| table.intern(q, depth_of(q), placement_of(q)))
            .collect();
        for inst in instances.values() {
            for q in inst.info.all_names() {
                table.intern(q, depth_of(q), placement_of(q));
            }
        }

        let mut bindings = BTreeSet::new();
        let mut bind = |src: usize, dst: usize| {
            if src != dst {
                bindings.insert(QueueBinding { src_index: src, dst_index: dst });
            }
        };

        let mut digests: HashMap<&str, String> = HashMap::new();
        let mut submodels = BTreeMap::new();
        for (name, inst) in instances {
            let dev = Some(inst.device);
            let fan_in = |q: &str| consumers.get(q).map_or(0, Vec::len) > 1;
            let fan_out = |q: &str| producers.get(q).map_or(0, Vec::len) > 1;

            let mut input_queue_indices = Vec::new();
            for q in &inst.info.input_queue_names {
                let shared = table.index[q.as_str()];
                if fan_in(q) {
                    let local = table.intern(&format!("{}#{}", q, name), depth_of(q), dev);
                    bind(shared, local);
                    input_queue_indices.push(local);
                } else {
                    input_queue_indices.push(shared);
                }
            }

            let mut output_queue_indices = Vec::new();
            for q in &inst.info.output_queue_names {
                let shared = table.index[q.as_str()];
                if fan_out(q) {
                    let local = table.intern(&format!("{}#{}", q, name), depth_of(q), dev);
                    bind(local, shared);
                    output_queue_indices.push(local);
                } else {
                    output_queue_indices.push(shared);
                }
            }

            let mut control_input_queue_indices = Vec::new();
            for q in &inst.info.control_input_queue_names {
                let shared = table.index[q.as_str()];
                if fan_in(q) {
                    let local = table.intern(&format!("{}#{}", q, name), depth_of(q), dev);
                    bind(shared, local);
                    control_input_queue_indices.push(local);
                } else {
                    control_input_queue_indices.push(shared);
                }
            }
            if inst.info.input_queue_names.is_empty() {
                // Externally driven model: trigger it through a private control queue.
                for q in &inst.info.external_queue_names {
                    let shared = table.index[q.as_str()];
                    let local = table.intern(&format!("{}#ctrl#{}", q, name), depth_of(q), dev);
                    bind(shared, local);
                    control_input_queue_indices.push(local);
                }
            }

            let artifact_digest = digests
                .entry(inst.model.name())
                .or_insert_with(|| inst.model.artifact().digest())
                .clone();
            submodels.insert(
                name.clone(),
                SubmodelInfo {
                    model_name: inst.model.name().to_string(),
                    artifact: inst.model.artifact().clone(),
                    artifact_size: inst.model.artifact().len(),
                    artifact_digest,
                    device: inst.device,
                    input_queue_indices,
                    output_queue_indices,
                    control_input_queue_indices,
                },
            );
        }

        let plan = DeployPlan {
            queues: table.queues,
            bindings: bindings.into_iter().collect(),
            submodels,
            root_input_indices,
            root_output_indices,
            root_control_input_indices,
        };
        plan.validate()?;
        Ok(plan)
    }
}

/// Separators of derived names: `#` for fan-in/fan-out and control copies,
/// `@` for device replicas.
const RESERVED_CHARS: [char; 2] = ['#', '@'];

fn check_name(name: &str) -> Result<(), PlanError> {
    if name.contains(RESERVED_CHARS) {
        return Err(PlanError::ReservedName(name.to_string()));
    }
    Ok(())
}

/// Relation entries and model map must match both ways; queue names must be
/// declared once or come from the root boundary. No user name may contain a
/// reserved separator, so derived names never alias declared ones.
fn validate(flat: &FlatModelSet) -> Result<(), PlanError> {
    let relation = &flat.relation;
    let mut declared = BTreeSet::new();
    for def in &relation.queue_defs {
        check_name(&def.name)?;
        if !declared.insert(def.name.as_str()) {
            return Err(PlanError::DuplicateQueue(def.name.clone()));
        }
    }
    let boundary = relation.root_boundary_names();
    for name in &boundary {
        check_name(name)?;
    }

    for name in relation.submodel_queue_infos.keys() {
        if !flat.models.contains_key(name) {
            return Err(PlanError::UnknownSubmodel(name.clone()));
        }
    }
    for name in flat.models.keys() {
        check_name(name)?;
        let info = relation
            .submodel_queue_infos
            .get(name)
            .ok_or_else(|| PlanError::MissingQueueInfo(name.clone()))?;
        for queue in info.all_names() {
            if !declared.contains(queue.as_str()) && !boundary.contains(queue.as_str()) {
                return Err(PlanError::UndeclaredQueue {
                    model: name.clone(),
                    queue: queue.clone(),
                });
            }
        }
    }
    Ok(())
}

/// One instance per submodel, or one per (submodel, device) when several
/// devices are targeted. Replicas keep root boundary names shared and get
/// device-local copies of every internal queue.
fn resolve_devices(flat: &FlatModelSet, devices: &[DeviceInfo]) -> BTreeMap<String, Instance> {
    let relation = &flat.relation;
    let mut instances = BTreeMap::new();

    if let [device] = devices {
        for (name, model) in &flat.models {
            let info = relation.submodel_queue_infos[name].clone();
            instances.insert(name.clone(), Instance { model: model.clone(), device: *device, info });
        }
        return instances;
    }

    let boundary = relation.root_boundary_names();
    for device in devices {
        let key = device.key();
        for (name, model) in &flat.models {
            let info = relation.submodel_queue_infos[name].map_names(|q| {
                if boundary.contains(q) {
                    q.to_string()
                } else {
                    format!("{}@{}", q, key)
                }
            });
            instances.insert(
                format!("{}@{}", name, key),
                Instance { model: model.clone(), device: *device, info },
            );
        }
    }
    instances
}
