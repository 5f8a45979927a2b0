//! Device-resident wrapper around one submodel.

use std::sync::Arc;

use crate::device::QueueId;
use crate::format::IncrementalModelParser;

use super::cycle::ExecutionCycle;
use super::dynamic::DynamicModelExecutor;
use super::static_model::StaticModelRunner;
use super::{ExecutorEnv, ExecutorError};

enum Loaded {
    Static(StaticModelRunner),
    Dynamic(DynamicModelExecutor),
}

pub struct ModelHandle {
    root_model_id: u32,
    model_id: u32,
    parser: IncrementalModelParser,
    loaded: Option<Loaded>,
    inner_model_id: Option<u32>,
}

impl ModelHandle {
    pub fn new(root_model_id: u32, model_id: u32, model_size: u64) -> Self {
        Self {
            root_model_id,
            model_id,
            parser: IncrementalModelParser::new(model_size),
            loaded: None,
            inner_model_id: None,
        }
    }

    pub fn parser(&self) -> &IncrementalModelParser {
        &self.parser
    }

    pub fn parse_partial_model(&mut self, offset: u64, data: &[u8]) -> Result<(), ExecutorError> {
        self.parser.parse_and_deserialize(offset, data)?;
        if self.parser.is_completed() {
            tracing::info!(
                root_model_id = self.root_model_id,
                model_id = self.model_id,
                size = self.parser.model_size(),
                "model download complete"
            );
        }
        Ok(())
    }

    /// Bind the parsed model to its queues and start executing on arrivals.
    /// Repeated calls are no-ops.
    pub fn load_model(
        &mut self,
        input_queues: &[QueueId],
        output_queues: &[QueueId],
        env: &ExecutorEnv,
    ) -> Result<(), ExecutorError> {
        if self.loaded.is_some() {
            tracing::info!(root_model_id = self.root_model_id, model_id = self.model_id, "model already loaded");
            return Ok(());
        }
        let root = self.parser.model()?;
        let dynamic = root.has_dynamic_shape();
        let cycle = ExecutionCycle::new(
            Arc::clone(&root.root),
            Arc::clone(&env.runtime),
            Arc::clone(&env.backend),
            input_queues,
            output_queues,
            env.config.queue_timeout,
        )?;

        let inner = env.next_model_id();
        let loaded = if dynamic {
            Loaded::Dynamic(DynamicModelExecutor::start(
                inner,
                cycle,
                Arc::clone(&env.runtime),
                Arc::clone(&env.dispatcher),
                env.config.worker_poll,
            )?)
        } else {
            Loaded::Static(StaticModelRunner::start(
                inner,
                cycle,
                Arc::clone(&env.runtime),
                Arc::clone(&env.dispatcher),
            )?)
        };
        self.loaded = Some(loaded);
        self.inner_model_id = Some(inner);
        tracing::info!(
            root_model_id = self.root_model_id,
            model_id = self.model_id,
            inner_model_id = inner,
            dynamic,
            "model loaded"
        );
        Ok(())
    }

    pub fn unload_model(&mut self) -> Result<(), ExecutorError> {
        let Some(loaded) = self.loaded.take() else {
            return Ok(());
        };
        self.inner_model_id = None;
        match loaded {
            Loaded::Static(runner) => runner.shutdown()?,
            Loaded::Dynamic(executor) => executor.shutdown()?,
        }
        tracing::info!(root_model_id = self.root_model_id, model_id = self.model_id, "model unloaded");
        Ok(())
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.is_some()
    }

    pub fn is_dynamic(&self) -> bool {
        matches!(self.loaded, Some(Loaded::Dynamic(_)))
    }

    /// Id the dispatcher knows the loaded model by.
    pub fn inner_model_id(&self) -> Option<u32> {
        self.inner_model_id
    }
}

impl Drop for ModelHandle {
    fn drop(&mut self) {
        if let Err(e) = self.unload_model() {
            tracing::warn!(model_id = self.model_id, error = %e, "unload on drop failed");
        }
    }
}

impl std::fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelHandle")
            .field("root_model_id", &self.root_model_id)
            .field("model_id", &self.model_id)
            .field("stage", &self.parser.stage())
            .field("loaded", &self.is_loaded())
            .finish()
    }
}
