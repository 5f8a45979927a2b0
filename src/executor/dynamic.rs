//! Event-driven executor for models with dynamic shapes.
//!
//! Each executor owns a worker thread fed through a single-slot task FIFO:
//! `Some(task)` runs one cycle and resolves the task's completion, `None`
//! shuts the worker down. At most one execution is in flight; a further
//! activation waits in the slot, and one more blocks the dispatcher until
//! the slot frees up.

use std::sync::mpsc::{self, RecvTimeoutError, SyncSender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::device::{DeviceEvent, DeviceRuntime, EventChannel, QueueId};
use crate::status::{HasStatus, StatusCode};
use crate::telemetry;

use super::cycle::{subscribe_all, unsubscribe_all, ExecutionCycle};
use super::dispatcher::{ActivatedModel, Completion, EventDispatcher};
use super::ExecutorError;

type Task = oneshot::Sender<Result<(), ExecutorError>>;

/// The part of an executor shared with the dispatcher registry.
struct TaskSlot {
    model_id: u32,
    tasks: SyncSender<Option<Task>>,
}

impl ActivatedModel for TaskSlot {
    fn model_id(&self) -> u32 {
        self.model_id
    }

    fn execute_async(&self) -> Result<Completion, ExecutorError> {
        let (tx, rx) = oneshot::channel();
        self.tasks
            .send(Some(tx))
            .map_err(|_| ExecutorError::WorkerStopped(self.model_id))?;
        Ok(rx)
    }
}

pub struct DynamicModelExecutor {
    model_id: u32,
    slot: Arc<TaskSlot>,
    worker: Option<JoinHandle<()>>,
    stop: CancellationToken,
    runtime: Arc<DeviceRuntime>,
    dispatcher: Arc<EventDispatcher>,
    context: u32,
    activation_queues: Vec<QueueId>,
}

impl DynamicModelExecutor {
    /// Create the device context, start the worker, subscribe every input
    /// queue and register with the dispatcher.
    pub fn start(
        model_id: u32,
        cycle: ExecutionCycle,
        runtime: Arc<DeviceRuntime>,
        dispatcher: Arc<EventDispatcher>,
        poll: Duration,
    ) -> Result<Self, ExecutorError> {
        let context = runtime.create_context();
        let activation_queues = cycle.activation_queues();
        let (tasks, rx) = mpsc::sync_channel::<Option<Task>>(1);
        let stop = CancellationToken::new();

        let worker = {
            let runtime = Arc::clone(&runtime);
            let stop = stop.clone();
            let dispatcher_stop = dispatcher.stop_token();
            std::thread::Builder::new()
                .name(format!("model-{}", model_id))
                .spawn(move || {
                    if let Err(e) = runtime.set_current_context(context) {
                        tracing::error!(model_id, error = %e, "worker could not bind device context");
                    }
                    worker_loop(model_id, cycle, rx, &runtime, poll, &stop, &dispatcher_stop);
                })
        };
        let worker = match worker {
            Ok(handle) => handle,
            Err(e) => {
                let _ = runtime.destroy_context(context);
                return Err(ExecutorError::Spawn(e.to_string()));
            }
        };

        let executor = Self {
            model_id,
            slot: Arc::new(TaskSlot { model_id, tasks }),
            worker: Some(worker),
            stop,
            runtime,
            dispatcher,
            context,
            activation_queues,
        };
        subscribe_all(&executor.runtime, &executor.activation_queues, model_id)?;
        executor.dispatcher.register(Arc::clone(&executor.slot) as Arc<dyn ActivatedModel>);
        tracing::info!(model_id, context, "dynamic executor started");
        Ok(executor)
    }

    pub fn model_id(&self) -> u32 {
        self.model_id
    }

    /// Queue one execution; the receiver resolves with its outcome.
    pub fn execute_async(&self) -> Result<Completion, ExecutorError> {
        self.slot.execute_async()
    }

    /// Deregister, stop the worker after its current task, and destroy the
    /// device context.
    pub fn shutdown(mut self) -> Result<(), ExecutorError> {
        self.teardown()
    }

    fn teardown(&mut self) -> Result<(), ExecutorError> {
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };
        self.dispatcher.deregister(self.model_id);
        unsubscribe_all(&self.runtime, &self.activation_queues, self.model_id);
        self.stop.cancel();
        // The worker may already have exited; a closed channel is fine.
        let _ = self.slot.tasks.send(None);
        if worker.join().is_err() {
            tracing::error!(model_id = self.model_id, "model worker panicked");
        }
        self.runtime.destroy_context(self.context)?;
        tracing::info!(model_id = self.model_id, "dynamic executor stopped");
        Ok(())
    }
}

impl Drop for DynamicModelExecutor {
    fn drop(&mut self) {
        if let Err(e) = self.teardown() {
            tracing::warn!(model_id = self.model_id, error = %e, "executor teardown failed");
        }
    }
}

fn worker_loop(
    model_id: u32,
    mut cycle: ExecutionCycle,
    tasks: mpsc::Receiver<Option<Task>>,
    runtime: &DeviceRuntime,
    poll: Duration,
    stop: &CancellationToken,
    dispatcher_stop: &CancellationToken,
) {
    let notify = runtime.events(EventChannel::Notify);
    loop {
        let done = match tasks.recv_timeout(poll) {
            Ok(Some(done)) => done,
            Ok(None) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {
                if stop.is_cancelled() {
                    break;
                }
                continue;
            }
        };

        let started = Instant::now();
        let result = cycle.run();
        let status = match &result {
            Ok(false) => {
                // Inputs incomplete; the missing arrival activates again.
                let _ = done.send(Ok(()));
                continue;
            }
            Ok(true) => StatusCode::Success,
            Err(e) => {
                tracing::error!(model_id, error = %e, "model execution failed, stopping dispatcher");
                dispatcher_stop.cancel();
                e.status()
            }
        };
        telemetry::record_execution(started.elapsed(), result.is_ok());
        if let Err(e) = notify.submit(DeviceEvent::EndGraph { model_id, status }) {
            tracing::warn!(model_id, error = %e, "end-of-graph notification dropped");
        }
        // The issuer may have stopped waiting.
        let _ = done.send(result.map(|_| ()));
    }
    tracing::debug!(model_id, "model worker exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::backend::{ExecutionBackend, IdentityBackend, InputTensor, OutputTensor};
    use crate::format::{CompiledModel, DataType, ModelDef, TensorDesc};
    use crate::planner::DeviceInfo;

    const WAIT: Duration = Duration::from_millis(100);

    struct Failing;

    impl ExecutionBackend for Failing {
        fn execute(
            &self,
            _model: &CompiledModel,
            _inputs: &[InputTensor<'_>],
            _outputs: &mut [OutputTensor],
        ) -> Result<(), ExecutorError> {
            Err(ExecutorError::Backend("boom".into()))
        }
    }

    fn start(backend: Arc<dyn ExecutionBackend>) -> (Arc<DeviceRuntime>, Arc<EventDispatcher>, DynamicModelExecutor, QueueId) {
        let runtime = Arc::new(DeviceRuntime::new(DeviceInfo::new(0, 0, 0), 1 << 20));
        let dispatcher = EventDispatcher::start(Arc::clone(&runtime), Duration::from_millis(5)).unwrap();
        let mut def = ModelDef::new("dyn");
        def.inputs.push(TensorDesc::new("x", DataType::Uint8, vec![4]));
        def.outputs.push(TensorDesc::new("y", DataType::Uint8, vec![-1]));
        let qin = runtime.create_queue("in", 4).unwrap();
        let qout = runtime.create_queue("out", 4).unwrap();
        let cycle = ExecutionCycle::new(
            Arc::new(CompiledModel::new(def)),
            Arc::clone(&runtime),
            backend,
            &[qin],
            &[qout],
            WAIT,
        )
        .unwrap();
        let executor = DynamicModelExecutor::start(
            7,
            cycle,
            Arc::clone(&runtime),
            Arc::clone(&dispatcher),
            Duration::from_millis(5),
        )
        .unwrap();
        (runtime, dispatcher, executor, qin)
    }

    #[tokio::test]
    async fn execute_async_resolves_once() {
        let (runtime, dispatcher, executor, qin) = start(Arc::new(IdentityBackend));
        // Not through the queue: no activation races the direct call.
        runtime.unsubscribe(qin).unwrap();
        runtime.enqueue(qin, runtime.mbuf_from(b"abcd").unwrap(), WAIT).unwrap();
        let done = executor.execute_async().unwrap();
        done.await.unwrap().unwrap();
        let notify = runtime.events(EventChannel::Notify);
        assert_eq!(
            notify.wait(WAIT).unwrap(),
            Some(DeviceEvent::EndGraph { model_id: 7, status: StatusCode::Success })
        );
        executor.shutdown().unwrap();
        assert_eq!(runtime.context_count(), 0);
        assert_eq!(dispatcher.registered(), 0);
        dispatcher.stop();
    }

    #[tokio::test]
    async fn failure_stops_dispatcher_but_still_completes() {
        let (runtime, dispatcher, executor, qin) = start(Arc::new(Failing));
        runtime.unsubscribe(qin).unwrap();
        runtime.enqueue(qin, runtime.mbuf_from(b"abcd").unwrap(), WAIT).unwrap();
        let result = executor.execute_async().unwrap().await.unwrap();
        assert!(matches!(result, Err(ExecutorError::Backend(_))));
        assert!(dispatcher.is_stopped());
        let event = runtime.events(EventChannel::Notify).wait(WAIT).unwrap();
        assert_eq!(event, Some(DeviceEvent::EndGraph { model_id: 7, status: StatusCode::Failed }));
        drop(executor);
        assert_eq!(runtime.context_count(), 0);
        dispatcher.stop();
    }
}
