//! Per-device capability surface consumed by the daemon and executors.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::ThreadId;
use std::time::Duration;

use parking_lot::Mutex;

use super::event::{EventChannel, EventGroup};
use super::mbuf::{Mbuf, MbufPool};
use super::queue::HwQueue;
use super::{DeviceError, QueueId};
use crate::planner::DeviceInfo;

#[derive(Debug, Default)]
struct QueueRegistry {
    by_id: HashMap<QueueId, Arc<HwQueue>>,
    by_name: HashMap<String, QueueId>,
}

#[derive(Debug, Default)]
struct Contexts {
    live: HashSet<u32>,
    current: HashMap<ThreadId, u32>,
}

#[derive(Debug)]
pub struct DeviceRuntime {
    device: DeviceInfo,
    queues: Mutex<QueueRegistry>,
    next_queue_id: AtomicU32,
    mbufs: Arc<MbufPool>,
    contexts: Mutex<Contexts>,
    next_context_id: AtomicU32,
    daemon_events: Arc<EventGroup>,
    response_events: Arc<EventGroup>,
    scheduler_events: Arc<EventGroup>,
    notify_events: Arc<EventGroup>,
}

impl DeviceRuntime {
    pub fn new(device: DeviceInfo, mbuf_capacity: usize) -> Self {
        Self {
            device,
            queues: Mutex::new(QueueRegistry::default()),
            next_queue_id: AtomicU32::new(1),
            mbufs: MbufPool::new(mbuf_capacity),
            contexts: Mutex::new(Contexts::default()),
            next_context_id: AtomicU32::new(1),
            daemon_events: Arc::new(EventGroup::new(EventChannel::Daemon)),
            response_events: Arc::new(EventGroup::new(EventChannel::Response)),
            scheduler_events: Arc::new(EventGroup::new(EventChannel::Scheduler)),
            notify_events: Arc::new(EventGroup::new(EventChannel::Notify)),
        }
    }

    pub fn device(&self) -> DeviceInfo {
        self.device
    }

    // Queues

    pub fn create_queue(&self, name: &str, depth: usize) -> Result<QueueId, DeviceError> {
        let mut registry = self.queues.lock();
        if registry.by_name.contains_key(name) {
            return Err(DeviceError::QueueExists(name.to_string()));
        }
        let id = self.next_queue_id.fetch_add(1, Ordering::Relaxed);
        registry.by_id.insert(id, Arc::new(HwQueue::new(id, name, depth)));
        registry.by_name.insert(name.to_string(), id);
        tracing::debug!(device = %self.device, queue = name, id, depth, "queue created");
        Ok(id)
    }

    pub fn destroy_queue(&self, id: QueueId) -> Result<(), DeviceError> {
        let queue = {
            let mut registry = self.queues.lock();
            let queue = registry.by_id.remove(&id).ok_or(DeviceError::QueueNotFound(id))?;
            registry.by_name.remove(queue.name());
            queue
        };
        queue.close();
        Ok(())
    }

    pub fn queue(&self, id: QueueId) -> Result<Arc<HwQueue>, DeviceError> {
        self.queues
            .lock()
            .by_id
            .get(&id)
            .cloned()
            .ok_or(DeviceError::QueueNotFound(id))
    }

    pub fn queue_id(&self, name: &str) -> Result<QueueId, DeviceError> {
        self.queues
            .lock()
            .by_name
            .get(name)
            .copied()
            .ok_or_else(|| DeviceError::QueueNameNotFound(name.to_string()))
    }

    pub fn queue_count(&self) -> usize {
        self.queues.lock().by_id.len()
    }

    pub fn enqueue(&self, id: QueueId, mbuf: Mbuf, timeout: Duration) -> Result<(), DeviceError> {
        self.queue(id)?.enqueue(mbuf, timeout)
    }

    pub fn dequeue(&self, id: QueueId, timeout: Duration) -> Result<Mbuf, DeviceError> {
        self.queue(id)?.dequeue(timeout)
    }

    /// Bind `src` to a destination queue, possibly owned by another runtime.
    pub fn bind(&self, src: QueueId, dst: Arc<HwQueue>) -> Result<(), DeviceError> {
        self.queue(src)?.bind(dst)
    }

    /// Route enqueues on `queue` to an `ActivateModel{model_id}` event on the
    /// scheduler channel.
    pub fn subscribe(&self, queue: QueueId, model_id: u32) -> Result<(), DeviceError> {
        self.queue(queue)?
            .subscribe(Arc::clone(&self.scheduler_events), model_id);
        Ok(())
    }

    pub fn unsubscribe(&self, queue: QueueId) -> Result<(), DeviceError> {
        self.queue(queue)?.unsubscribe();
        Ok(())
    }

    // Mbufs

    pub fn alloc_mbuf(&self, len: usize) -> Result<Mbuf, DeviceError> {
        self.mbufs.alloc(len)
    }

    pub fn mbuf_from(&self, bytes: &[u8]) -> Result<Mbuf, DeviceError> {
        self.mbufs.alloc_from(bytes)
    }

    pub fn mbuf_pool(&self) -> &Arc<MbufPool> {
        &self.mbufs
    }

    // Contexts

    pub fn create_context(&self) -> u32 {
        let id = self.next_context_id.fetch_add(1, Ordering::Relaxed);
        self.contexts.lock().live.insert(id);
        id
    }

    pub fn destroy_context(&self, id: u32) -> Result<(), DeviceError> {
        let mut contexts = self.contexts.lock();
        if !contexts.live.remove(&id) {
            return Err(DeviceError::ContextNotFound(id));
        }
        contexts.current.retain(|_, ctx| *ctx != id);
        Ok(())
    }

    /// Make `id` current for the calling thread.
    pub fn set_current_context(&self, id: u32) -> Result<(), DeviceError> {
        let mut contexts = self.contexts.lock();
        if !contexts.live.contains(&id) {
            return Err(DeviceError::ContextNotFound(id));
        }
        contexts.current.insert(std::thread::current().id(), id);
        Ok(())
    }

    pub fn current_context(&self) -> Option<u32> {
        self.contexts.lock().current.get(&std::thread::current().id()).copied()
    }

    pub fn context_count(&self) -> usize {
        self.contexts.lock().live.len()
    }

    // Events

    pub fn events(&self, channel: EventChannel) -> &Arc<EventGroup> {
        match channel {
            EventChannel::Daemon => &self.daemon_events,
            EventChannel::Response => &self.response_events,
            EventChannel::Scheduler => &self.scheduler_events,
            EventChannel::Notify => &self.notify_events,
        }
    }

    /// Close every channel and queue; blocked waiters return promptly.
    pub fn shutdown(&self) {
        for channel in EventChannel::ALL {
            self.events(channel).close();
        }
        let queues: Vec<_> = {
            let mut registry = self.queues.lock();
            registry.by_name.clear();
            registry.by_id.drain().map(|(_, q)| q).collect()
        };
        for queue in queues {
            queue.close();
        }
        tracing::debug!(device = %self.device, "device runtime shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runtime() -> DeviceRuntime {
        DeviceRuntime::new(DeviceInfo::new(0, 0, 0), 1 << 20)
    }

    #[test]
    fn queue_names_are_unique() {
        let rt = runtime();
        let id = rt.create_queue("q", 2).unwrap();
        assert_eq!(rt.queue_id("q").unwrap(), id);
        assert_eq!(rt.create_queue("q", 2).unwrap_err(), DeviceError::QueueExists("q".into()));
        rt.destroy_queue(id).unwrap();
        assert!(rt.queue_id("q").is_err());
        assert_eq!(rt.destroy_queue(id).unwrap_err(), DeviceError::QueueNotFound(id));
    }

    #[test]
    fn contexts_are_per_thread() {
        let rt = Arc::new(runtime());
        let ctx = rt.create_context();
        rt.set_current_context(ctx).unwrap();
        assert_eq!(rt.current_context(), Some(ctx));
        let other = Arc::clone(&rt);
        assert_eq!(std::thread::spawn(move || other.current_context()).join().unwrap(), None);
        rt.destroy_context(ctx).unwrap();
        assert_eq!(rt.current_context(), None);
        assert!(rt.set_current_context(ctx).is_err());
    }

    #[test]
    fn subscribe_feeds_scheduler_channel() {
        let rt = runtime();
        let q = rt.create_queue("in", 2).unwrap();
        rt.subscribe(q, 4).unwrap();
        rt.enqueue(q, rt.mbuf_from(b"x").unwrap(), Duration::from_millis(10)).unwrap();
        assert_eq!(rt.events(EventChannel::Scheduler).pending(), 1);
    }
}
