//! Query API request metrics.

use crate::error::ControllerError;
use axum::http::StatusCode;
use prometheus::{Encoder, IntCounterVec, Opts, Registry, TextEncoder};

/// Request counter of the query API, labelled by handler and status code.
#[derive(Clone)]
pub struct ApiMetrics {
    registry: Registry,
    requests: IntCounterVec,
}

impl ApiMetrics {
    /// Creates the counter in a fresh registry.
    pub fn new() -> Result<Self, ControllerError> {
        let registry = Registry::new();
        let requests = IntCounterVec::new(
            Opts::new("api_requests", "Requests served by the metadata API"),
            &["handler", "status"],
        )?;
        registry.register(Box::new(requests.clone()))?;
        Ok(Self { registry, requests })
    }

    /// Counts one response.
    pub fn record(&self, handler: &str, status: StatusCode) {
        self.requests
            .with_label_values(&[handler, status.as_str()])
            .inc();
    }

    /// Responses counted so far for `handler` with `status`.
    pub fn requests(&self, handler: &str, status: StatusCode) -> u64 {
        self.requests
            .with_label_values(&[handler, status.as_str()])
            .get()
    }

    /// Prometheus text exposition of the registry.
    pub fn encode(&self) -> Result<Vec<u8>, ControllerError> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(buffer)
    }
}
