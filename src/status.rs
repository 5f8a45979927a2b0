//! Stable status codes shared by every layer of the runtime.
//!
//! Module errors carry rich diagnostics, but callers branch on the
//! [`StatusCode`] they map to, never on message text.

use serde::{Deserialize, Serialize};

/// Outcome classes reported across the device protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusCode {
    Success,
    /// Generic failure: size mismatch, unsupported content, downstream error.
    Failed,
    /// Malformed or inconsistent caller-supplied topology, offsets or counts.
    ParamInvalid,
    /// Unknown root or submodel id.
    NotFound,
    /// Out-of-order offsets, double registration, interrupted transfer.
    ProtocolViolation,
    /// Buffer or queue allocation failure.
    ResourceExhaustion,
    /// Request variant the receiver does not implement.
    Unsupported,
    /// Event-channel failure; the only class that stops a daemon.
    Fatal,
}

impl StatusCode {
    /// Numeric wire value.
    pub fn code(self) -> u32 {
        match self {
            StatusCode::Success => 0,
            StatusCode::Failed => 1,
            StatusCode::ParamInvalid => 2,
            StatusCode::NotFound => 3,
            StatusCode::ProtocolViolation => 4,
            StatusCode::ResourceExhaustion => 5,
            StatusCode::Unsupported => 6,
            StatusCode::Fatal => 7,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        let status = match code {
            0 => StatusCode::Success,
            1 => StatusCode::Failed,
            2 => StatusCode::ParamInvalid,
            3 => StatusCode::NotFound,
            4 => StatusCode::ProtocolViolation,
            5 => StatusCode::ResourceExhaustion,
            6 => StatusCode::Unsupported,
            7 => StatusCode::Fatal,
            _ => return None,
        };
        Some(status)
    }

    pub fn is_success(self) -> bool {
        self == StatusCode::Success
    }

    /// Short label used for metrics and log fields.
    pub fn as_str(self) -> &'static str {
        match self {
            StatusCode::Success => "success",
            StatusCode::Failed => "failed",
            StatusCode::ParamInvalid => "param_invalid",
            StatusCode::NotFound => "not_found",
            StatusCode::ProtocolViolation => "protocol_violation",
            StatusCode::ResourceExhaustion => "resource_exhaustion",
            StatusCode::Unsupported => "unsupported",
            StatusCode::Fatal => "fatal",
        }
    }
}

impl std::fmt::Display for StatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Implemented by every module error so handlers can report a stable code.
pub trait HasStatus {
    fn status(&self) -> StatusCode;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_roundtrip() {
        for code in 0..8 {
            let status = StatusCode::from_code(code).unwrap();
            assert_eq!(status.code(), code);
        }
        assert!(StatusCode::from_code(8).is_none());
    }

    #[test]
    fn only_success_is_success() {
        assert!(StatusCode::Success.is_success());
        assert!(!StatusCode::Failed.is_success());
        assert!(!StatusCode::Fatal.is_success());
    }

    #[test]
    fn serde_uses_snake_case() {
        let json = serde_json::to_string(&StatusCode::ParamInvalid).unwrap();
        assert_eq!(json, "\"param_invalid\"");
    }
}
