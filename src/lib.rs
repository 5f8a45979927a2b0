//! GG-DEPLOY
//!
//! Deploys a set of compiled submodels across heterogeneous devices and
//! runs them as a dataflow graph connected by bounded message queues.
//!
//! # Layers
//!
//! - **planner**: flattens nested submodels, replicates them across devices
//!   and derives the queues and bindings connecting them.
//! - **format**: model container codec and the incremental parser that
//!   accepts the container in arbitrary chunks.
//! - **device**: in-process device runtime with queues, mbufs and event
//!   channels.
//! - **executor**: per-device model handles and the event-driven executor
//!   for dynamic submodels.
//! - **daemon**: device-side request handler and event loop.
//! - **deployer**: control-side master deployer and the local cluster.

pub mod cli;
pub mod config;
pub mod daemon;
pub mod deployer;
pub mod device;
pub mod executor;
pub mod format;
pub mod planner;
pub mod status;
pub mod telemetry;

pub use status::{HasStatus, StatusCode};
