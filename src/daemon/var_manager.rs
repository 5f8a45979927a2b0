//! Per-session variable memory on one device.
//!
//! Sessions are seeded with memory limits by `multi_var_manager_info`, then
//! filled chunk by chunk through `shared_content_desc`. A variable turns
//! ready once every byte of its declared length has arrived.

use std::collections::HashMap;

use thiserror::Error;

use crate::format::TensorDesc;
use crate::status::{HasStatus, StatusCode};

use super::protocol::{SharedContentDesc, VarManagerInfo};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VarError {
    #[error("Session {0} has no variable manager")]
    SessionNotFound(u64),

    #[error("Session {session_id}: variable memory size must be non-zero")]
    ZeroVarMemory { session_id: u64 },

    #[error("Variable {node}: {reason}")]
    InvalidChunk { node: String, reason: String },

    #[error("Variable {node}: chunk at {got}, expected {expected}")]
    OutOfOrder { node: String, expected: u64, got: u64 },

    #[error("Session {session_id}: variable memory exhausted ({requested} bytes at {offset}, limit {limit})")]
    Exhausted {
        session_id: u64,
        offset: u64,
        requested: u64,
        limit: u64,
    },
}

impl HasStatus for VarError {
    fn status(&self) -> StatusCode {
        match self {
            VarError::SessionNotFound(_) => StatusCode::NotFound,
            VarError::ZeroVarMemory { .. } | VarError::InvalidChunk { .. } => StatusCode::ParamInvalid,
            VarError::OutOfOrder { .. } => StatusCode::ProtocolViolation,
            VarError::Exhausted { .. } => StatusCode::ResourceExhaustion,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Variable {
    head_offset: u64,
    mem_type: u32,
    desc: Option<TensorDesc>,
    data: Vec<u8>,
    total_length: u64,
}

impl Variable {
    pub fn head_offset(&self) -> u64 {
        self.head_offset
    }

    pub fn mem_type(&self) -> u32 {
        self.mem_type
    }

    pub fn desc(&self) -> Option<&TensorDesc> {
        self.desc.as_ref()
    }

    pub fn received(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn is_ready(&self) -> bool {
        self.received() == self.total_length
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

#[derive(Debug)]
struct Session {
    device_id: u32,
    graph_mem_max_size: u64,
    var_mem_max_size: u64,
    vars: HashMap<String, Variable>,
}

#[derive(Debug, Default)]
pub struct VarManager {
    sessions: HashMap<u64, Session>,
}

impl VarManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed or resize sessions. Existing variables are kept.
    pub fn seed(&mut self, infos: &[VarManagerInfo]) -> Result<(), VarError> {
        if let Some(info) = infos.iter().find(|i| i.var_mem_max_size == 0) {
            return Err(VarError::ZeroVarMemory { session_id: info.session_id });
        }
        for info in infos {
            let session = self.sessions.entry(info.session_id).or_insert_with(|| Session {
                device_id: info.device_id,
                graph_mem_max_size: 0,
                var_mem_max_size: 0,
                vars: HashMap::new(),
            });
            session.device_id = info.device_id;
            session.graph_mem_max_size = info.graph_mem_max_size;
            session.var_mem_max_size = info.var_mem_max_size;
            tracing::debug!(
                session_id = info.session_id,
                device_id = info.device_id,
                var_mem = info.var_mem_max_size,
                graph_mem = info.graph_mem_max_size,
                "variable manager seeded"
            );
        }
        Ok(())
    }

    /// Append one chunk. Returns whether the variable is now complete.
    pub fn fill_shared_content(&mut self, chunk: &SharedContentDesc) -> Result<bool, VarError> {
        let session = self
            .sessions
            .get_mut(&chunk.session_id)
            .ok_or(VarError::SessionNotFound(chunk.session_id))?;
        let node = &chunk.node_name;
        if node.is_empty() {
            return Err(VarError::InvalidChunk { node: String::new(), reason: "empty node name".into() });
        }
        let chunk_len = chunk.om_content.len() as u64;
        let chunk_end = chunk.current_offset.checked_add(chunk_len);
        if chunk_end.map_or(true, |end| end > chunk.total_length) {
            return Err(VarError::InvalidChunk {
                node: node.clone(),
                reason: format!(
                    "chunk {}+{} exceeds total length {}",
                    chunk.current_offset, chunk_len, chunk.total_length
                ),
            });
        }
        let var_end = chunk.head_offset.checked_add(chunk.total_length);
        if var_end.map_or(true, |end| end > session.var_mem_max_size) {
            return Err(VarError::Exhausted {
                session_id: chunk.session_id,
                offset: chunk.head_offset,
                requested: chunk.total_length,
                limit: session.var_mem_max_size,
            });
        }

        let var = session.vars.entry(node.clone()).or_insert_with(|| Variable {
            head_offset: chunk.head_offset,
            mem_type: chunk.mem_type,
            desc: chunk.tensor_desc.clone(),
            data: Vec::new(),
            total_length: chunk.total_length,
        });
        if var.total_length != chunk.total_length || var.head_offset != chunk.head_offset {
            return Err(VarError::InvalidChunk {
                node: node.clone(),
                reason: "layout differs from earlier chunks".into(),
            });
        }
        if var.is_ready() && chunk.current_offset == 0 {
            // Re-sent content replaces the previous value.
            var.data.clear();
        }
        if chunk.current_offset != var.received() {
            return Err(VarError::OutOfOrder {
                node: node.clone(),
                expected: var.received(),
                got: chunk.current_offset,
            });
        }
        var.data.extend_from_slice(&chunk.om_content);
        if var.desc.is_none() {
            var.desc = chunk.tensor_desc.clone();
        }
        let ready = var.is_ready();
        if ready {
            tracing::info!(session_id = chunk.session_id, node = %node, bytes = var.total_length, "variable ready");
        }
        Ok(ready)
    }

    pub fn variable(&self, session_id: u64, node: &str) -> Option<&Variable> {
        self.sessions.get(&session_id)?.vars.get(node)
    }

    pub fn is_ready(&self, session_id: u64, node: &str) -> bool {
        self.variable(session_id, node).is_some_and(Variable::is_ready)
    }

    pub fn has_session(&self, session_id: u64) -> bool {
        self.sessions.contains_key(&session_id)
    }

    pub fn graph_mem_limit(&self, session_id: u64) -> Option<u64> {
        self.sessions.get(&session_id).map(|s| s.graph_mem_max_size)
    }

    pub fn clear(&mut self) {
        self.sessions.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded() -> VarManager {
        let mut vars = VarManager::new();
        vars.seed(&[VarManagerInfo { device_id: 0, session_id: 7, graph_mem_max_size: 0, var_mem_max_size: 64 }])
            .unwrap();
        vars
    }

    fn chunk(offset: u64, bytes: &[u8]) -> SharedContentDesc {
        SharedContentDesc {
            session_id: 7,
            head_offset: 0,
            total_length: 6,
            current_offset: offset,
            mem_type: 0,
            node_name: "w".into(),
            tensor_desc: None,
            om_content: bytes.to_vec(),
        }
    }

    #[test]
    fn ready_only_on_final_chunk() {
        let mut vars = seeded();
        assert!(!vars.fill_shared_content(&chunk(0, b"abc")).unwrap());
        assert!(!vars.is_ready(7, "w"));
        assert!(vars.fill_shared_content(&chunk(3, b"def")).unwrap());
        assert_eq!(vars.variable(7, "w").unwrap().data(), b"abcdef");
    }

    #[test]
    fn gaps_are_protocol_violations() {
        let mut vars = seeded();
        vars.fill_shared_content(&chunk(0, b"ab")).unwrap();
        let err = vars.fill_shared_content(&chunk(4, b"ef")).unwrap_err();
        assert_eq!(err.status(), StatusCode::ProtocolViolation);
    }

    #[test]
    fn unseeded_session_and_overflow_are_rejected() {
        let mut vars = VarManager::new();
        assert_eq!(vars.fill_shared_content(&chunk(0, b"a")).unwrap_err().status(), StatusCode::NotFound);

        let mut vars = seeded();
        let mut big = chunk(0, b"a");
        big.head_offset = 60;
        assert_eq!(vars.fill_shared_content(&big).unwrap_err().status(), StatusCode::ResourceExhaustion);
        assert_eq!(vars.fill_shared_content(&chunk(5, b"xy")).unwrap_err().status(), StatusCode::ParamInvalid);
    }

    #[test]
    fn zero_var_memory_is_param_invalid() {
        let mut vars = VarManager::new();
        let err = vars
            .seed(&[VarManagerInfo { device_id: 0, session_id: 1, graph_mem_max_size: 8, var_mem_max_size: 0 }])
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::ParamInvalid);
        assert!(!vars.has_session(1));
    }
}
