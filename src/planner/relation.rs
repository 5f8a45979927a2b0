//! Declarative queue topology connecting submodels.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// Depth used for queues the relation does not declare explicitly.
pub const DEFAULT_QUEUE_DEPTH: u32 = 128;

/// A named queue and its capacity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDef {
    pub name: String,
    #[serde(default = "default_depth")]
    pub depth: u32,
}

fn default_depth() -> u32 {
    DEFAULT_QUEUE_DEPTH
}

impl QueueDef {
    pub fn new(name: impl Into<String>, depth: u32) -> Self {
        Self { name: name.into(), depth }
    }
}

/// Queue names a model (or the root boundary) reads from and writes to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelQueueInfo {
    #[serde(default)]
    pub input_queue_names: Vec<String>,
    #[serde(default)]
    pub output_queue_names: Vec<String>,
    /// Queues fed from outside the flow (e.g. host-side control signals).
    #[serde(default)]
    pub external_queue_names: Vec<String>,
    /// Queues carrying trigger-only inputs; no tensor data.
    #[serde(default)]
    pub control_input_queue_names: Vec<String>,
}

impl ModelQueueInfo {
    pub fn new(inputs: &[&str], outputs: &[&str]) -> Self {
        Self {
            input_queue_names: inputs.iter().map(|s| s.to_string()).collect(),
            output_queue_names: outputs.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    pub fn with_external(mut self, external: &[&str]) -> Self {
        self.external_queue_names = external.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Every queue name this entry references, in declaration order.
    pub fn all_names(&self) -> impl Iterator<Item = &String> {
        self.input_queue_names
            .iter()
            .chain(&self.output_queue_names)
            .chain(&self.external_queue_names)
            .chain(&self.control_input_queue_names)
    }

    /// Apply `rename` to every referenced queue name.
    pub fn map_names(&self, mut rename: impl FnMut(&str) -> String) -> Self {
        let mut apply = |names: &[String]| names.iter().map(|n| rename(n)).collect::<Vec<_>>();
        Self {
            input_queue_names: apply(&self.input_queue_names),
            output_queue_names: apply(&self.output_queue_names),
            external_queue_names: apply(&self.external_queue_names),
            control_input_queue_names: apply(&self.control_input_queue_names),
        }
    }
}

/// Named queues plus the root boundary and per-submodel queue usage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelRelation {
    #[serde(default)]
    pub queue_defs: Vec<QueueDef>,
    /// Root boundary: queues the caller feeds, fetches, or drives externally.
    #[serde(default)]
    pub root_model_queue_info: ModelQueueInfo,
    #[serde(default)]
    pub submodel_queue_infos: BTreeMap<String, ModelQueueInfo>,
}

impl ModelRelation {
    /// Relation for a lone model: its boundary names become its queues.
    pub fn trivial(model_name: &str, inputs: &[String], outputs: &[String]) -> Self {
        let queue_defs = inputs
            .iter()
            .chain(outputs)
            .map(|name| QueueDef::new(name.clone(), DEFAULT_QUEUE_DEPTH))
            .collect();
        let info = ModelQueueInfo {
            input_queue_names: inputs.to_vec(),
            output_queue_names: outputs.to_vec(),
            ..Default::default()
        };
        let mut submodel_queue_infos = BTreeMap::new();
        submodel_queue_infos.insert(model_name.to_string(), info.clone());
        Self {
            queue_defs,
            root_model_queue_info: info,
            submodel_queue_infos,
        }
    }

    pub fn find_queue_def(&self, name: &str) -> Option<&QueueDef> {
        self.queue_defs.iter().find(|q| q.name == name)
    }

    /// Names supplied by the root boundary (inputs, outputs, externals).
    pub fn root_boundary_names(&self) -> BTreeSet<&str> {
        self.root_model_queue_info.all_names().map(String::as_str).collect()
    }
}
