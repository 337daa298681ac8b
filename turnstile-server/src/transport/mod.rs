//! Transport layer for the admission service
//!
//! Transports accept requests from gateways, hand them to the shared
//! [`AdmissionPipeline`] and translate verdicts back to the wire.
//!
//! # Available Transports
//!
//! - [`http`]: REST API with JSON, plus administrative and metrics endpoints

pub mod http;

#[cfg(test)]
mod http_test;

use crate::metrics::Metrics;
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use turnstile::AdmissionPipeline;

/// State shared by every transport
#[derive(Clone)]
pub struct ServerState {
    pub pipeline: Arc<AdmissionPipeline>,
    pub metrics: Arc<Metrics>,
}

impl ServerState {
    pub fn new(pipeline: Arc<AdmissionPipeline>) -> Self {
        ServerState {
            pipeline,
            metrics: Arc::new(Metrics::new()),
        }
    }
}

/// Common interface for all transport implementations
#[async_trait]
pub trait Transport {
    /// Bind, serve requests, and return once the pipeline is shut down
    async fn start(self, state: ServerState) -> Result<()>;
}
