//! Shared application state for the server.

use std::sync::Arc;

use pipeline::service::RunService;

/// Shared state accessible from all request handlers.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<RunService>,
}

impl AppState {
    pub fn new(service: RunService) -> Self {
        Self {
            service: Arc::new(service),
        }
    }
}
