//! Deploy planner: turns (possibly nested) submodels plus a queue topology
//! into a flat, device-resolved [`DeployPlan`].

mod builder;
mod device;
mod flatten;
pub mod manifest;
mod plan;
mod relation;
mod submodel;

pub use builder::DeployPlanner;
pub use device::DeviceInfo;
pub use flatten::{flatten, FlatModelSet, MAX_NESTING_DEPTH};
pub use manifest::{DeploymentManifest, ManifestError, SubmodelSpec};
pub use plan::{DeployPlan, PlannedQueue, QueueBinding, SubmodelInfo};
pub use relation::{ModelQueueInfo, ModelRelation, QueueDef, DEFAULT_QUEUE_DEPTH};
pub use submodel::{Artifact, Submodel};

use thiserror::Error;

use crate::status::{HasStatus, StatusCode};

/// Planning failures. All but [`PlanError::Inconsistent`] are caller
/// configuration errors and are never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlanError {
    #[error("No submodels to deploy")]
    EmptyModelSet,

    #[error("No target devices")]
    NoDevices,

    #[error("Duplicate submodel name: {0}")]
    DuplicateSubmodel(String),

    #[error("A model relation is required to deploy {0} submodels")]
    MissingRelation(usize),

    #[error("Submodel {0} has nested submodels but no relation")]
    MissingNestedRelation(String),

    #[error("Submodel {0} has no queue info in the relation")]
    MissingQueueInfo(String),

    #[error("Relation references unknown submodel {0}")]
    UnknownSubmodel(String),

    #[error("Queue {queue} referenced by {model} is not declared")]
    UndeclaredQueue { model: String, queue: String },

    #[error("Queue {0} is declared more than once")]
    DuplicateQueue(String),

    #[error("Name {0} uses a character the planner reserves for derived queue names ('#' or '@')")]
    ReservedName(String),

    #[error("{model}: {kind} queue count mismatch (parent declares {parent}, nested relation declares {nested})")]
    CountMismatch {
        model: String,
        kind: &'static str,
        parent: usize,
        nested: usize,
    },

    #[error("Submodel nesting deeper than {0} levels")]
    NestingTooDeep(usize),

    #[error("Inconsistent plan: {0}")]
    Inconsistent(String),
}

impl HasStatus for PlanError {
    fn status(&self) -> StatusCode {
        match self {
            PlanError::Inconsistent(_) => StatusCode::Failed,
            _ => StatusCode::ParamInvalid,
        }
    }
}
