//! Event groups: device notification channels with timed waits.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::Serialize;

use super::DeviceError;
use crate::status::StatusCode;

/// Events carried on a device's notification channels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeviceEvent {
    Heartbeat,
    Finalize,
    RequestAvailable,
    ActivateModel { model_id: u32 },
    EndGraph { model_id: u32, status: StatusCode },
    RequestDone { success: bool },
}

/// The per-device channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventChannel {
    /// Daemon control: heartbeat, finalize, request-available.
    Daemon,
    /// Request completion reported back to the control side.
    Response,
    /// Model activations consumed by the event dispatcher.
    Scheduler,
    /// End-of-graph notifications for the device scheduler.
    Notify,
}

impl EventChannel {
    pub const ALL: [EventChannel; 4] = [
        EventChannel::Daemon,
        EventChannel::Response,
        EventChannel::Scheduler,
        EventChannel::Notify,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventChannel::Daemon => "daemon",
            EventChannel::Response => "response",
            EventChannel::Scheduler => "scheduler",
            EventChannel::Notify => "notify",
        }
    }
}

#[derive(Debug, Default)]
struct EventState {
    pending: VecDeque<DeviceEvent>,
    closed: bool,
}

#[derive(Debug)]
pub struct EventGroup {
    channel: EventChannel,
    state: Mutex<EventState>,
    ready: Condvar,
}

impl EventGroup {
    pub fn new(channel: EventChannel) -> Self {
        Self {
            channel,
            state: Mutex::new(EventState::default()),
            ready: Condvar::new(),
        }
    }

    pub fn channel(&self) -> EventChannel {
        self.channel
    }

    pub fn submit(&self, event: DeviceEvent) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(DeviceError::ChannelClosed(self.channel.as_str()));
        }
        state.pending.push_back(event);
        drop(state);
        self.ready.notify_one();
        Ok(())
    }

    /// Next event, or `Ok(None)` on timeout. Pending events are still
    /// delivered after close; a closed, drained group is an error.
    pub fn wait(&self, timeout: Duration) -> Result<Option<DeviceEvent>, DeviceError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if let Some(event) = state.pending.pop_front() {
                return Ok(Some(event));
            }
            if state.closed {
                return Err(DeviceError::ChannelClosed(self.channel.as_str()));
            }
            if self.ready.wait_until(&mut state, deadline).timed_out() {
                return Ok(state.pending.pop_front());
            }
        }
    }

    pub fn close(&self) {
        self.state.lock().closed = true;
        self.ready.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn pending(&self) -> usize {
        self.state.lock().pending.len()
    }
}
