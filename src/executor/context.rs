//! Registry of model handles on one device.
//!
//! Owned by the daemon's event-loop thread and only reached through
//! `&mut self`, so it carries no lock.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::device::QueueId;

use super::handle::ModelHandle;
use super::{ExecutorEnv, ExecutorError};

#[derive(Debug)]
pub struct ExecutorContext {
    env: Arc<ExecutorEnv>,
    models: HashMap<u32, BTreeMap<u32, ModelHandle>>,
}

impl ExecutorContext {
    /// An empty context sharing `env` with every handle it creates.
    pub fn new(env: Arc<ExecutorEnv>) -> Self {
        Self { env, models: HashMap::new() }
    }

    pub fn env(&self) -> &Arc<ExecutorEnv> {
        &self.env
    }

    /// Register an empty handle for `model_id` under `root_model_id`.
    ///
    /// Fails with `ModelTooLarge` when `model_size` exceeds the configured
    /// limit, before anything is allocated, and with `ModelExists` when the
    /// pair is already registered.
    pub fn add_model(&mut self, root_model_id: u32, model_id: u32, model_size: u64) -> Result<(), ExecutorError> {
        let limit = self.env.config.max_model_size;
        if model_size > limit {
            return Err(ExecutorError::ModelTooLarge { size: model_size, limit });
        }
        let submodels = self.models.entry(root_model_id).or_default();
        if submodels.contains_key(&model_id) {
            return Err(ExecutorError::ModelExists { root_model_id, model_id });
        }
        submodels.insert(model_id, ModelHandle::new(root_model_id, model_id, model_size));
        tracing::debug!(root_model_id, model_id, model_size, "model handle created");
        Ok(())
    }

    /// The handle `add_model` created for the pair.
    pub fn model_mut(&mut self, root_model_id: u32, model_id: u32) -> Result<&mut ModelHandle, ExecutorError> {
        self.models
            .get_mut(&root_model_id)
            .and_then(|m| m.get_mut(&model_id))
            .ok_or(ExecutorError::ModelNotFound { root_model_id, model_id })
    }

    pub fn submodels(&self, root_model_id: u32) -> Result<&BTreeMap<u32, ModelHandle>, ExecutorError> {
        self.models
            .get(&root_model_id)
            .ok_or(ExecutorError::RootNotFound(root_model_id))
    }

    /// Bind a downloaded submodel to its device queues and start it.
    pub fn load_model(
        &mut self,
        root_model_id: u32,
        model_id: u32,
        input_queues: &[QueueId],
        output_queues: &[QueueId],
    ) -> Result<(), ExecutorError> {
        let env = Arc::clone(&self.env);
        self.model_mut(root_model_id, model_id)?
            .load_model(input_queues, output_queues, &env)
    }

    /// Unload and drop every submodel of `root_model_id`. The root is removed
    /// even when some submodels fail to unload; the failures are returned.
    pub fn unload_root(&mut self, root_model_id: u32) -> Result<Vec<(u32, ExecutorError)>, ExecutorError> {
        let submodels = self
            .models
            .remove(&root_model_id)
            .ok_or(ExecutorError::RootNotFound(root_model_id))?;
        let mut failures = Vec::new();
        for (model_id, mut handle) in submodels {
            if let Err(e) = handle.unload_model() {
                tracing::warn!(root_model_id, model_id, error = %e, "submodel unload failed");
                failures.push((model_id, e));
            }
        }
        Ok(failures)
    }

    /// Drop every handle without unloading explicitly (handles unload on drop).
    pub fn clear(&mut self) {
        self.models.clear();
    }

    /// Number of root models with at least one registered submodel.
    pub fn root_count(&self) -> usize {
        self.models.len()
    }
}
