//! Application state for the API server.

use std::sync::Arc;

use periscope_core::session::SessionRegistry;
use periscope_proxy::LifecycleController;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Session registry shared with the interceptor.
    pub registry: Arc<SessionRegistry>,
    /// Controller driving listener start/stop.
    pub controller: Arc<LifecycleController>,
}

impl AppState {
    /// Creates state with a fresh registry and controller.
    pub fn new() -> Self {
        let registry = Arc::new(SessionRegistry::new());
        let controller = Arc::new(LifecycleController::new(registry.clone()));
        Self {
            registry,
            controller,
        }
    }

    /// Creates state over an existing registry.
    pub fn with_registry(registry: Arc<SessionRegistry>) -> Self {
        let controller = Arc::new(LifecycleController::new(registry.clone()));
        Self {
            registry,
            controller,
        }
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}
