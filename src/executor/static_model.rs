//! Static-shape models: the cycle runs inline on the dispatcher thread.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::device::{DeviceEvent, DeviceRuntime, EventChannel, QueueId};
use crate::status::{HasStatus, StatusCode};
use crate::telemetry;

use super::cycle::{subscribe_all, unsubscribe_all, ExecutionCycle};
use super::dispatcher::{ActivatedModel, Completion, EventDispatcher};
use super::ExecutorError;

struct InlineModel {
    model_id: u32,
    cycle: Mutex<ExecutionCycle>,
    runtime: Arc<DeviceRuntime>,
}

impl ActivatedModel for InlineModel {
    fn model_id(&self) -> u32 {
        self.model_id
    }

    fn execute_async(&self) -> Result<Completion, ExecutorError> {
        let started = Instant::now();
        let result = self.cycle.lock().run();
        let (tx, rx) = oneshot::channel();
        let status = match &result {
            // An input is still missing: nothing ran, nothing to report.
            Ok(false) => {
                let _ = tx.send(Ok(()));
                return Ok(rx);
            }
            Ok(true) => StatusCode::Success,
            Err(e) => {
                tracing::warn!(model_id = self.model_id, error = %e, "static model execution failed");
                e.status()
            }
        };
        telemetry::record_execution(started.elapsed(), result.is_ok());
        let end = DeviceEvent::EndGraph { model_id: self.model_id, status };
        if let Err(e) = self.runtime.events(EventChannel::Notify).submit(end) {
            tracing::warn!(model_id = self.model_id, error = %e, "end-of-graph notification dropped");
        }
        let _ = tx.send(result.map(|_| ()));
        Ok(rx)
    }
}

pub struct StaticModelRunner {
    model: Arc<InlineModel>,
    dispatcher: Arc<EventDispatcher>,
    activation_queues: Vec<QueueId>,
    registered: bool,
}

impl StaticModelRunner {
    pub fn start(
        model_id: u32,
        cycle: ExecutionCycle,
        runtime: Arc<DeviceRuntime>,
        dispatcher: Arc<EventDispatcher>,
    ) -> Result<Self, ExecutorError> {
        let activation_queues = cycle.activation_queues();
        let model = Arc::new(InlineModel { model_id, cycle: Mutex::new(cycle), runtime });
        subscribe_all(&model.runtime, &activation_queues, model_id)?;
        dispatcher.register(Arc::clone(&model) as Arc<dyn ActivatedModel>);
        tracing::info!(model_id, "static model runner started");
        Ok(Self { model, dispatcher, activation_queues, registered: true })
    }

    pub fn model_id(&self) -> u32 {
        self.model.model_id
    }

    /// Run one cycle on the calling thread; a no-op while an input is missing.
    pub fn execute(&self) -> Result<(), ExecutorError> {
        self.model.execute_async()?.try_recv().map_err(|_| ExecutorError::WorkerStopped(self.model.model_id))?
    }

    pub fn shutdown(mut self) -> Result<(), ExecutorError> {
        self.teardown();
        Ok(())
    }

    fn teardown(&mut self) {
        if !std::mem::take(&mut self.registered) {
            return;
        }
        self.dispatcher.deregister(self.model.model_id);
        unsubscribe_all(&self.model.runtime, &self.activation_queues, self.model.model_id);
    }
}

impl Drop for StaticModelRunner {
    fn drop(&mut self) {
        self.teardown();
    }
}
