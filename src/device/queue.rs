//! Bounded hardware message queue of mbufs.
//!
//! A queue with outgoing bindings does not store mbufs: each enqueue forwards
//! one copy per bound destination (the original goes to the last one). A
//! queue may have one subscriber, which gets an `ActivateModel` event per
//! enqueued mbuf.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use super::event::{DeviceEvent, EventGroup};
use super::mbuf::Mbuf;
use super::{DeviceError, QueueId};

#[derive(Debug)]
struct Subscriber {
    events: Arc<EventGroup>,
    model_id: u32,
}

#[derive(Debug, Default)]
struct QueueState {
    items: VecDeque<Mbuf>,
    closed: bool,
    forward: Vec<Arc<HwQueue>>,
    subscriber: Option<Subscriber>,
}

/// A named FIFO of at most `depth` mbufs, shared between the threads of one
/// device. Blocking operations take a timeout instead of waiting forever.
#[derive(Debug)]
pub struct HwQueue {
    id: QueueId,
    name: String,
    depth: usize,
    state: Mutex<QueueState>,
    not_empty: Condvar,
    not_full: Condvar,
}

impl HwQueue {
    /// A depth of zero is raised to one.
    pub fn new(id: QueueId, name: impl Into<String>, depth: usize) -> Self {
        Self {
            id,
            name: name.into(),
            depth: depth.max(1),
            state: Mutex::new(QueueState::default()),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    pub fn id(&self) -> QueueId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Mbufs currently stored. Always zero for a queue that forwards.
    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forward every future enqueue to `dst` as well.
    ///
    /// Binding the same destination twice is a no-op, and binding a queue
    /// to itself is rejected with `InvalidArgument`. Mbufs already stored
    /// stay where they are.
    pub fn bind(&self, dst: Arc<HwQueue>) -> Result<(), DeviceError> {
        if std::ptr::eq(Arc::as_ptr(&dst), self) {
            return Err(DeviceError::InvalidArgument(format!("queue {} bound to itself", self.name)));
        }
        let mut state = self.state.lock();
        if !state.forward.iter().any(|q| Arc::ptr_eq(q, &dst)) {
            state.forward.push(dst);
        }
        Ok(())
    }

    /// Make `model_id` the queue's only subscriber, replacing any previous one.
    pub(crate) fn subscribe(&self, events: Arc<EventGroup>, model_id: u32) {
        self.state.lock().subscriber = Some(Subscriber { events, model_id });
    }

    pub(crate) fn unsubscribe(&self) {
        self.state.lock().subscriber = None;
    }

    /// Store `mbuf`, or hand it to the bound destinations when the queue
    /// forwards.
    ///
    /// Waits up to `timeout` for room and fails with `QueueFull` after that,
    /// or with `QueueClosed` once the queue is closed. A stored mbuf submits
    /// one `ActivateModel` to the subscriber, if there is one. A failed
    /// forward stops at the first destination that refuses.
    pub fn enqueue(&self, mbuf: Mbuf, timeout: Duration) -> Result<(), DeviceError> {
        let forward = {
            let state = self.state.lock();
            if state.closed {
                return Err(DeviceError::QueueClosed(self.id));
            }
            state.forward.clone()
        };
        if let Some((last, rest)) = forward.split_last() {
            for dst in rest {
                dst.enqueue(mbuf.try_clone()?, timeout)?;
            }
            return last.enqueue(mbuf, timeout);
        }

        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.items.len() >= self.depth {
            if state.closed {
                return Err(DeviceError::QueueClosed(self.id));
            }
            if self.not_full.wait_until(&mut state, deadline).timed_out()
                && state.items.len() >= self.depth
            {
                return Err(DeviceError::QueueFull(self.id));
            }
        }
        if state.closed {
            return Err(DeviceError::QueueClosed(self.id));
        }
        state.items.push_back(mbuf);
        let activation = state
            .subscriber
            .as_ref()
            .map(|s| (Arc::clone(&s.events), s.model_id));
        drop(state);
        self.not_empty.notify_one();

        if let Some((events, model_id)) = activation {
            if let Err(e) = events.submit(DeviceEvent::ActivateModel { model_id }) {
                tracing::warn!(queue = %self.name, model_id, error = %e, "activation dropped");
            }
        }
        Ok(())
    }

    /// Take the oldest mbuf, waiting up to `timeout` for one.
    ///
    /// Returns `QueueEmpty` on timeout and `QueueClosed` when the queue is
    /// closed while empty.
    pub fn dequeue(&self, timeout: Duration) -> Result<Mbuf, DeviceError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if let Some(mbuf) = state.items.pop_front() {
                drop(state);
                self.not_full.notify_one();
                return Ok(mbuf);
            }
            if state.closed {
                return Err(DeviceError::QueueClosed(self.id));
            }
            if self.not_empty.wait_until(&mut state, deadline).timed_out() && state.items.is_empty() {
                return Err(DeviceError::QueueEmpty(self.id));
            }
        }
    }

    /// Wake every waiter and drop queued mbufs.
    pub fn close(&self) {
        let drained = {
            let mut state = self.state.lock();
            state.closed = true;
            state.forward.clear();
            state.subscriber = None;
            std::mem::take(&mut state.items)
        };
        drop(drained);
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::event::EventChannel;
    use crate::device::mbuf::MbufPool;

    const WAIT: Duration = Duration::from_millis(20);

    #[test]
    fn full_queue_times_out() {
        let pool = MbufPool::new(1024);
        let queue = HwQueue::new(1, "q", 1);
        queue.enqueue(pool.alloc(1).unwrap(), WAIT).unwrap();
        let err = queue.enqueue(pool.alloc(1).unwrap(), WAIT).unwrap_err();
        assert_eq!(err, DeviceError::QueueFull(1));
        assert_eq!(queue.dequeue(WAIT).unwrap().len(), 1);
        assert_eq!(queue.dequeue(WAIT).unwrap_err(), DeviceError::QueueEmpty(1));
    }

    #[test]
    fn bound_queue_forwards_one_copy_per_edge() {
        let pool = MbufPool::new(1024);
        let src = HwQueue::new(1, "src", 4);
        let a = Arc::new(HwQueue::new(2, "a", 4));
        let b = Arc::new(HwQueue::new(3, "b", 4));
        src.bind(Arc::clone(&a)).unwrap();
        src.bind(Arc::clone(&b)).unwrap();
        src.enqueue(pool.alloc_from(b"xy").unwrap(), WAIT).unwrap();
        assert!(src.is_empty());
        assert_eq!(a.dequeue(WAIT).unwrap().as_slice(), b"xy");
        assert_eq!(b.dequeue(WAIT).unwrap().as_slice(), b"xy");
    }

    #[test]
    fn subscriber_is_activated_per_enqueue() {
        let pool = MbufPool::new(1024);
        let events = Arc::new(EventGroup::new(EventChannel::Scheduler));
        let queue = HwQueue::new(1, "in", 4);
        queue.subscribe(Arc::clone(&events), 9);
        queue.enqueue(pool.alloc(1).unwrap(), WAIT).unwrap();
        queue.enqueue(pool.alloc(1).unwrap(), WAIT).unwrap();
        assert_eq!(events.pending(), 2);
        assert_eq!(events.wait(WAIT).unwrap(), Some(DeviceEvent::ActivateModel { model_id: 9 }));
    }

    #[test]
    fn close_releases_mbufs_and_rejects() {
        let pool = MbufPool::new(1024);
        let queue = HwQueue::new(1, "q", 4);
        queue.enqueue(pool.alloc(8).unwrap(), WAIT).unwrap();
        queue.close();
        assert_eq!(pool.in_use(), 0);
        assert_eq!(queue.dequeue(WAIT).unwrap_err(), DeviceError::QueueClosed(1));
    }
}
