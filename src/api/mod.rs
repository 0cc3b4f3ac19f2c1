//! HTTP surface over the processing queue
//!
//! Exposes enqueue, cancel, progress polling and debug capture endpoints.

use anyhow::Result;
use std::sync::Arc;
use tracing::info;

use crate::catalog::ItemStore;
use crate::queue::ProcessingQueueController;

pub mod handlers;
pub mod models;
pub mod server;

/// API server wrapping a queue controller
pub struct ApiServer {
    controller: ProcessingQueueController,
    store: Arc<dyn ItemStore>,
    port: u16,
}

impl ApiServer {
    pub fn new(
        controller: ProcessingQueueController,
        store: Arc<dyn ItemStore>,
        port: u16,
    ) -> Self {
        Self {
            controller,
            store,
            port,
        }
    }

    pub async fn start(self) -> Result<()> {
        info!("🚀 Starting API server on port {}", self.port);
        server::start_http_server(self.controller, self.store, self.port).await
    }
}
