//! Device deployment protocol: requests and responses carried as JSON inside
//! mbufs on the daemon's request and response queues.
//!
//! Byte payloads (`model_data`, `om_content`) travel hex-encoded. A client
//! may add a `seq` field next to the request's `type`; the daemon echoes it
//! in the response so late answers to abandoned requests can be told apart.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::format::TensorDesc;
use crate::status::{HasStatus, StatusCode};

/// Default bound on an encoded request or response.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Invalid message format: {0}")]
    InvalidFormat(String),

    #[error("Unknown request type: {0}")]
    UnknownType(String),

    #[error("Message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },
}

impl From<serde_json::Error> for ProtocolError {
    fn from(e: serde_json::Error) -> Self {
        ProtocolError::InvalidFormat(e.to_string())
    }
}

impl HasStatus for ProtocolError {
    fn status(&self) -> StatusCode {
        match self {
            ProtocolError::UnknownType(_) => StatusCode::Unsupported,
            ProtocolError::InvalidFormat(_) | ProtocolError::MessageTooLarge { .. } => {
                StatusCode::ParamInvalid
            }
        }
    }
}

/// Per-session memory limits seeded before shared content arrives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VarManagerInfo {
    pub device_id: u32,
    pub session_id: u64,
    pub graph_mem_max_size: u64,
    pub var_mem_max_size: u64,
}

/// One chunk of externally supplied variable content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedContentDesc {
    pub session_id: u64,
    /// Offset of the variable inside the session's variable memory.
    pub head_offset: u64,
    pub total_length: u64,
    /// Offset of this chunk inside the variable.
    pub current_offset: u64,
    #[serde(default)]
    pub mem_type: u32,
    pub node_name: String,
    #[serde(default)]
    pub tensor_desc: Option<TensorDesc>,
    #[serde(with = "hex_bytes")]
    pub om_content: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeployRequest {
    PreDownload {
        root_model_id: u32,
        model_id: u32,
        model_size: u64,
    },
    Download {
        root_model_id: u32,
        model_id: u32,
        offset: u64,
        #[serde(with = "hex_bytes")]
        model_data: Vec<u8>,
    },
    /// Queue names are device-local and resolved by the daemon.
    Load {
        root_model_id: u32,
        model_id: u32,
        input_queues: Vec<String>,
        output_queues: Vec<String>,
    },
    /// Unload every submodel of root model `model_id`.
    Unload { model_id: u32 },
    MultiVarManagerInfo { var_manager_info: Vec<VarManagerInfo> },
    SharedContentDesc(SharedContentDesc),
    DeployRankTableMessage { rank_table: String, rank_id: i32 },
}

impl DeployRequest {
    /// Wire tags of every known variant.
    pub const KINDS: [&'static str; 7] = [
        "pre_download",
        "download",
        "load",
        "unload",
        "multi_var_manager_info",
        "shared_content_desc",
        "deploy_rank_table_message",
    ];

    pub fn kind(&self) -> &'static str {
        match self {
            DeployRequest::PreDownload { .. } => "pre_download",
            DeployRequest::Download { .. } => "download",
            DeployRequest::Load { .. } => "load",
            DeployRequest::Unload { .. } => "unload",
            DeployRequest::MultiVarManagerInfo { .. } => "multi_var_manager_info",
            DeployRequest::SharedContentDesc(_) => "shared_content_desc",
            DeployRequest::DeployRankTableMessage { .. } => "deploy_rank_table_message",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployResponse {
    pub status_code: u32,
    #[serde(default)]
    pub error_message: String,
    /// Sequence number of the request this answers, when it carried one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
}

impl DeployResponse {
    pub fn success() -> Self {
        Self { status_code: StatusCode::Success.code(), error_message: String::new(), seq: None }
    }

    pub fn error(status: StatusCode, message: impl Into<String>) -> Self {
        Self { status_code: status.code(), error_message: message.into(), seq: None }
    }

    pub fn with_seq(mut self, seq: Option<u64>) -> Self {
        self.seq = seq;
        self
    }

    /// Unknown codes read as `Failed`.
    pub fn status(&self) -> StatusCode {
        StatusCode::from_code(self.status_code).unwrap_or(StatusCode::Failed)
    }

    pub fn is_success(&self) -> bool {
        self.status().is_success()
    }
}

pub fn encode_request(request: &DeployRequest, max: usize) -> Result<Vec<u8>, ProtocolError> {
    let bytes = serde_json::to_vec(request)?;
    check_size(bytes.len(), max)?;
    Ok(bytes)
}

/// Encode `request` with a client sequence number alongside its fields.
pub fn encode_sequenced_request(request: &DeployRequest, seq: u64, max: usize) -> Result<Vec<u8>, ProtocolError> {
    let mut value = serde_json::to_value(request)?;
    if let serde_json::Value::Object(fields) = &mut value {
        fields.insert("seq".into(), seq.into());
    }
    let bytes = serde_json::to_vec(&value)?;
    check_size(bytes.len(), max)?;
    Ok(bytes)
}

/// The `seq` an encoded request carries, even when the rest of it does not
/// decode.
pub fn request_seq(bytes: &[u8]) -> Option<u64> {
    #[derive(Deserialize)]
    struct Sequenced {
        seq: Option<u64>,
    }
    serde_json::from_slice::<Sequenced>(bytes).ok().and_then(|s| s.seq)
}

/// Decode a request, telling unknown request types apart from malformed
/// ones. The size is checked before parsing.
pub fn decode_request(bytes: &[u8], max: usize) -> Result<DeployRequest, ProtocolError> {
    check_size(bytes.len(), max)?;
    let value: serde_json::Value = serde_json::from_slice(bytes)?;
    let kind = value
        .get("type")
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| ProtocolError::InvalidFormat("missing request type".into()))?;
    if !DeployRequest::KINDS.contains(&kind) {
        return Err(ProtocolError::UnknownType(kind.to_string()));
    }
    Ok(serde_json::from_value(value)?)
}

pub fn encode_response(response: &DeployResponse) -> Result<Vec<u8>, ProtocolError> {
    Ok(serde_json::to_vec(response)?)
}

pub fn decode_response(bytes: &[u8], max: usize) -> Result<DeployResponse, ProtocolError> {
    check_size(bytes.len(), max)?;
    Ok(serde_json::from_slice(bytes)?)
}

fn check_size(size: usize, max: usize) -> Result<(), ProtocolError> {
    if size > max {
        return Err(ProtocolError::MessageTooLarge { size, max });
    }
    Ok(())
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        hex::decode(text).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn download_payload_is_hex() {
        let request = DeployRequest::Download {
            root_model_id: 1,
            model_id: 2,
            offset: 0,
            model_data: vec![0xde, 0xad],
        };
        let bytes = encode_request(&request, DEFAULT_MAX_MESSAGE_SIZE).unwrap();
        let text = String::from_utf8(bytes.clone()).unwrap();
        assert!(text.contains("\"type\":\"download\""));
        assert!(text.contains("\"dead\""));
        assert_eq!(decode_request(&bytes, DEFAULT_MAX_MESSAGE_SIZE).unwrap(), request);
    }

    #[test]
    fn sequence_number_rides_along_and_is_echoed() {
        let request = DeployRequest::Unload { model_id: 4 };
        let bytes = encode_sequenced_request(&request, 17, 1024).unwrap();
        assert_eq!(request_seq(&bytes), Some(17));
        assert_eq!(decode_request(&bytes, 1024).unwrap(), request);
        assert_eq!(request_seq(&encode_request(&request, 1024).unwrap()), None);
        assert_eq!(request_seq(br#"{"type":"load","seq":3,"model_id":"x"}"#), Some(3));

        let echoed = DeployResponse::success().with_seq(Some(17));
        let decoded = decode_response(&encode_response(&echoed).unwrap(), 1024).unwrap();
        assert_eq!(decoded.seq, Some(17));
        let plain = encode_response(&DeployResponse::success()).unwrap();
        assert!(!String::from_utf8(plain).unwrap().contains("seq"));
    }

    #[test]
    fn unknown_type_is_unsupported() {
        let err = decode_request(br#"{"type":"reboot"}"#, 1024).unwrap_err();
        assert_eq!(err, ProtocolError::UnknownType("reboot".into()));
        assert_eq!(err.status(), StatusCode::Unsupported);
    }

    #[test]
    fn malformed_known_type_is_param_invalid() {
        let err = decode_request(br#"{"type":"load","model_id":"x"}"#, 1024).unwrap_err();
        assert_eq!(err.status(), StatusCode::ParamInvalid);
        assert_eq!(decode_request(b"not json", 1024).unwrap_err().status(), StatusCode::ParamInvalid);
    }

    #[test]
    fn size_checked_before_parse() {
        let err = decode_request(&[b' '; 33], 32).unwrap_err();
        assert_eq!(err, ProtocolError::MessageTooLarge { size: 33, max: 32 });
    }

    #[test]
    fn unknown_status_code_reads_failed() {
        let response = DeployResponse { status_code: 99, error_message: String::new(), seq: None };
        assert_eq!(response.status(), StatusCode::Failed);
        assert!(DeployResponse::success().is_success());
    }
}
