//! Request dispatch for the device daemon.

use std::sync::Arc;

use crate::device::{DeviceRuntime, QueueId};
use crate::executor::{ExecutorContext, ExecutorEnv};
use crate::status::{HasStatus, StatusCode};
use crate::telemetry;

use super::comm::CommLibrary;
use super::protocol::{decode_request, request_seq, DeployRequest, DeployResponse};
use super::var_manager::VarManager;
use super::DaemonError;

/// Applies deploy requests to the device's executor context and variable
/// manager. Lives on the daemon thread and handles one request at a time.
pub struct EventHandler {
    context: ExecutorContext,
    vars: VarManager,
    comm: CommLibrary,
    max_message_size: usize,
}

impl EventHandler {
    pub fn new(env: Arc<ExecutorEnv>, comm: CommLibrary, max_message_size: usize) -> Self {
        Self {
            context: ExecutorContext::new(env),
            vars: VarManager::new(),
            comm,
            max_message_size,
        }
    }

    pub fn context(&self) -> &ExecutorContext {
        &self.context
    }

    pub fn vars(&self) -> &VarManager {
        &self.vars
    }

    pub fn comm(&self) -> &CommLibrary {
        &self.comm
    }

    /// Decode and handle one encoded request. The response echoes the
    /// request's sequence number whenever one can be read, including for
    /// requests that fail to decode.
    pub fn process(&mut self, bytes: &[u8]) -> DeployResponse {
        let response = match decode_request(bytes, self.max_message_size) {
            Ok(request) => self.handle(request),
            Err(e) => {
                tracing::warn!(error = %e, size = bytes.len(), "undecodable deploy request");
                telemetry::record_request("undecodable", e.status());
                DeployResponse::error(e.status(), e.to_string())
            }
        };
        response.with_seq(request_seq(bytes))
    }

    /// Apply one request and answer it.
    ///
    /// Never fails: every error becomes a response carrying the error's
    /// status code and message, and the request is counted under its kind.
    pub fn handle(&mut self, request: DeployRequest) -> DeployResponse {
        let kind = request.kind();
        let response = match self.handle_request(request) {
            Ok(()) => DeployResponse::success(),
            Err(e) => {
                tracing::warn!(kind, error = %e, "deploy request failed");
                DeployResponse::error(e.status(), e.to_string())
            }
        };
        telemetry::record_request(kind, response.status());
        response
    }

    fn handle_request(&mut self, request: DeployRequest) -> Result<(), DaemonError> {
        match request {
            DeployRequest::PreDownload { root_model_id, model_id, model_size } => {
                self.context.add_model(root_model_id, model_id, model_size)?;
            }
            DeployRequest::Download { root_model_id, model_id, offset, model_data } => {
                self.context
                    .model_mut(root_model_id, model_id)?
                    .parse_partial_model(offset, &model_data)?;
                telemetry::record_download(model_data.len());
            }
            DeployRequest::Load { root_model_id, model_id, input_queues, output_queues } => {
                let runtime = Arc::clone(&self.context.env().runtime);
                let inputs = resolve_queues(&runtime, &input_queues)?;
                let outputs = resolve_queues(&runtime, &output_queues)?;
                self.context.load_model(root_model_id, model_id, &inputs, &outputs)?;
            }
            DeployRequest::Unload { model_id } => {
                let failures = self.context.unload_root(model_id)?;
                if !failures.is_empty() {
                    let detail = failures
                        .iter()
                        .map(|(id, e)| format!("{id}: {e}"))
                        .collect::<Vec<_>>()
                        .join("; ");
                    return Err(DaemonError::PartialUnload { root_model_id: model_id, detail });
                }
                tracing::info!(root_model_id = model_id, "root model unloaded");
            }
            DeployRequest::MultiVarManagerInfo { var_manager_info } => {
                self.vars.seed(&var_manager_info)?;
            }
            DeployRequest::SharedContentDesc(chunk) => {
                self.vars.fill_shared_content(&chunk)?;
            }
            DeployRequest::DeployRankTableMessage { rank_table, rank_id } => {
                self.comm.init_rank_table(&rank_table, rank_id)?;
            }
        }
        Ok(())
    }

    /// Drop every model (each unloads on drop) and session.
    pub fn clear(&mut self) {
        self.context.clear();
        self.vars.clear();
    }
}

fn resolve_queues(runtime: &DeviceRuntime, names: &[String]) -> Result<Vec<QueueId>, DaemonError> {
    names
        .iter()
        .map(|name| runtime.queue_id(name).map_err(DaemonError::from))
        .collect()
}

impl std::fmt::Debug for EventHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventHandler")
            .field("roots", &self.context.root_count())
            .field("comm", &self.comm)
            .finish()
    }
}
