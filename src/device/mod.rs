//! In-process device runtime: hardware queues, managed buffers (mbufs),
//! device contexts and event groups.
//!
//! Every blocking call takes a timeout so callers can observe a stop flag.

mod event;
mod mbuf;
mod queue;
mod runtime;

pub use event::{DeviceEvent, EventChannel, EventGroup};
pub use mbuf::{BufferView, BufferViewMut, Mbuf, MbufPool};
pub use queue::HwQueue;
pub use runtime::DeviceRuntime;

use thiserror::Error;

use crate::status::{HasStatus, StatusCode};

/// Hardware queue identifier, unique per runtime.
pub type QueueId = u32;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("Queue {0} not found")]
    QueueNotFound(QueueId),

    #[error("Queue named {0} not found")]
    QueueNameNotFound(String),

    #[error("Queue named {0} already exists")]
    QueueExists(String),

    #[error("Queue {0} is full")]
    QueueFull(QueueId),

    #[error("Queue {0} is empty")]
    QueueEmpty(QueueId),

    #[error("Queue {0} was destroyed")]
    QueueClosed(QueueId),

    #[error("Mbuf allocation of {requested} bytes exceeds capacity ({in_use} of {capacity} in use)")]
    OutOfMemory {
        requested: usize,
        in_use: usize,
        capacity: usize,
    },

    #[error("Context {0} not found")]
    ContextNotFound(u32),

    #[error("Event channel {0} closed")]
    ChannelClosed(&'static str),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl HasStatus for DeviceError {
    fn status(&self) -> StatusCode {
        match self {
            DeviceError::QueueNotFound(_)
            | DeviceError::QueueNameNotFound(_)
            | DeviceError::ContextNotFound(_) => StatusCode::NotFound,
            DeviceError::QueueExists(_) | DeviceError::InvalidArgument(_) => StatusCode::ParamInvalid,
            DeviceError::QueueFull(_) | DeviceError::OutOfMemory { .. } => StatusCode::ResourceExhaustion,
            DeviceError::QueueEmpty(_) | DeviceError::QueueClosed(_) => StatusCode::Failed,
            DeviceError::ChannelClosed(_) => StatusCode::Fatal,
        }
    }
}
