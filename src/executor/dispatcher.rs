//! Per-device event dispatcher.
//!
//! One thread waits on the scheduler channel and hands `ActivateModel`
//! events to the registered model. The registry is written by the daemon
//! thread (load/unload) and read by the dispatcher thread, so it is the one
//! registry guarded by a lock.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::device::{DeviceEvent, DeviceRuntime, EventChannel};
use crate::telemetry;

use super::ExecutorError;

/// Completion handoff for one activation; resolved exactly once.
pub type Completion = oneshot::Receiver<Result<(), ExecutorError>>;

/// A loaded model the dispatcher can activate.
pub trait ActivatedModel: Send + Sync {
    fn model_id(&self) -> u32;

    /// Queue one execution; the returned receiver resolves when it finishes.
    fn execute_async(&self) -> Result<Completion, ExecutorError>;
}

pub struct EventDispatcher {
    registry: Mutex<HashMap<u32, Arc<dyn ActivatedModel>>>,
    stop: CancellationToken,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl EventDispatcher {
    /// Spawn the dispatcher thread for `runtime`.
    ///
    /// The thread keeps the dispatcher alive until [`EventDispatcher::stop`].
    pub fn start(runtime: Arc<DeviceRuntime>, poll: Duration) -> Result<Arc<Self>, ExecutorError> {
        let dispatcher = Arc::new(Self {
            registry: Mutex::new(HashMap::new()),
            stop: CancellationToken::new(),
            thread: Mutex::new(None),
        });
        let worker = Arc::clone(&dispatcher);
        let handle = std::thread::Builder::new()
            .name(format!("dispatch-{}", runtime.device().key()))
            .spawn(move || worker.run(&runtime, poll))
            .map_err(|e| ExecutorError::Spawn(e.to_string()))?;
        *dispatcher.thread.lock() = Some(handle);
        Ok(dispatcher)
    }

    pub fn register(&self, model: Arc<dyn ActivatedModel>) {
        let id = model.model_id();
        self.registry.lock().insert(id, model);
        tracing::debug!(model_id = id, "model registered with dispatcher");
    }

    pub fn deregister(&self, model_id: u32) -> bool {
        self.registry.lock().remove(&model_id).is_some()
    }

    pub fn registered(&self) -> usize {
        self.registry.lock().len()
    }

    /// Token that stops the dispatcher when cancelled.
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Stop the thread and wait for it to exit.
    pub fn stop(&self) {
        self.stop.cancel();
        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() != std::thread::current().id() && handle.join().is_err() {
                tracing::error!("dispatcher thread panicked");
            }
        }
    }

    /// Look `model_id` up and queue one execution.
    pub fn activate(&self, model_id: u32) -> Result<Completion, ExecutorError> {
        let model = self.registry.lock().get(&model_id).cloned();
        let model = model.ok_or(ExecutorError::UnknownActivation(model_id))?;
        telemetry::record_activation();
        model.execute_async()
    }

    fn run(&self, runtime: &DeviceRuntime, poll: Duration) {
        let events = runtime.events(EventChannel::Scheduler);
        tracing::info!(device = %runtime.device(), "event dispatcher started");
        while !self.stop.is_cancelled() {
            match events.wait(poll) {
                Ok(Some(DeviceEvent::ActivateModel { model_id })) => {
                    if let Err(e) = self.activate(model_id) {
                        tracing::warn!(model_id, error = %e, "activation failed");
                    }
                }
                Ok(Some(event)) => tracing::debug!(?event, "dispatcher ignored event"),
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(error = %e, "scheduler channel failed");
                    self.stop.cancel();
                }
            }
        }
        tracing::info!(device = %runtime.device(), "event dispatcher stopped");
    }
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("registered", &self.registered())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::DeviceInfo;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        id: u32,
        hits: Arc<AtomicUsize>,
    }

    impl ActivatedModel for Counting {
        fn model_id(&self) -> u32 {
            self.id
        }

        fn execute_async(&self) -> Result<Completion, ExecutorError> {
            self.hits.fetch_add(1, Ordering::SeqCst);
            let (tx, rx) = oneshot::channel();
            let _ = tx.send(Ok(()));
            Ok(rx)
        }
    }

    fn runtime() -> Arc<DeviceRuntime> {
        Arc::new(DeviceRuntime::new(DeviceInfo::new(0, 0, 0), 1 << 16))
    }

    #[test]
    fn unknown_model_is_reported() {
        let rt = runtime();
        let dispatcher = EventDispatcher::start(rt, Duration::from_millis(5)).unwrap();
        assert!(matches!(dispatcher.activate(42), Err(ExecutorError::UnknownActivation(42))));
        dispatcher.stop();
        assert!(dispatcher.is_stopped());
    }

    #[test]
    fn concurrent_register_and_activate() {
        let rt = runtime();
        let dispatcher = EventDispatcher::start(Arc::clone(&rt), Duration::from_millis(1)).unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let events = Arc::clone(rt.events(EventChannel::Scheduler));

        let writer = {
            let dispatcher = Arc::clone(&dispatcher);
            let hits = Arc::clone(&hits);
            std::thread::spawn(move || {
                for _ in 0..200 {
                    dispatcher.register(Arc::new(Counting { id: 1, hits: Arc::clone(&hits) }));
                    dispatcher.deregister(1);
                }
                dispatcher.register(Arc::new(Counting { id: 1, hits }));
            })
        };
        for _ in 0..200 {
            events.submit(DeviceEvent::ActivateModel { model_id: 1 }).unwrap();
        }
        writer.join().unwrap();
        events.submit(DeviceEvent::ActivateModel { model_id: 1 }).unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while events.pending() > 0 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        std::thread::sleep(Duration::from_millis(20));
        let seen = hits.load(Ordering::SeqCst);
        assert!(seen >= 1 && seen <= 201);
        dispatcher.stop();
    }
}
