//! Span factories and result recording.

use tracing::{info_span, Span};

pub trait SpanExt {
    /// Record `status` and, on failure, `error.message`.
    fn record_result<T, E>(&self, result: &Result<T, E>)
    where
        E: std::fmt::Display;
}

impl SpanExt for Span {
    fn record_result<T, E>(&self, result: &Result<T, E>)
    where
        E: std::fmt::Display,
    {
        match result {
            Ok(_) => {
                self.record("status", "ok");
            }
            Err(e) => {
                self.record("status", "error");
                self.record("error.message", e.to_string().as_str());
            }
        }
    }
}

pub struct DeploySpan;

impl DeploySpan {
    /// Span around one whole deployment.
    pub fn deploy(root_model_id: u32, submodels: usize) -> Span {
        info_span!(
            "deploy",
            root_model_id,
            submodels,
            status = tracing::field::Empty,
            error.message = tracing::field::Empty,
        )
    }

    /// Span around one device request round trip.
    pub fn request(kind: &'static str, device: &str) -> Span {
        info_span!(
            "device_request",
            kind,
            device = %device,
            status = tracing::field::Empty,
            error.message = tracing::field::Empty,
        )
    }

    pub fn undeploy(root_model_id: u32) -> Span {
        info_span!(
            "undeploy",
            root_model_id,
            status = tracing::field::Empty,
            error.message = tracing::field::Empty,
        )
    }
}
