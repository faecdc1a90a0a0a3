//! Control-plane handlers.
//!
//! This module defines `AppState` (the shared state carried through axum
//! extractors) and re-exports the handler functions used by the router.

pub mod control;
pub mod health;

pub use control::*;
pub use health::{health_handler, liveness_handler};

use std::sync::Arc;
use std::time::Instant;

use super::ShutdownController;
use crate::service::Daemon;

/// Shared state passed to every control handler via `State` extraction.
#[derive(Clone)]
pub struct AppState {
    pub daemon: Arc<Daemon>,
    /// Lifecycle phase and in-flight tracking.
    pub shutdown: Arc<ShutdownController>,
    /// Daemon start time, used for uptime.
    pub start_time: Instant,
}

impl AppState {
    #[must_use]
    pub fn new(daemon: Arc<Daemon>) -> Self {
        Self {
            shutdown: daemon.shutdown_controller(),
            daemon,
            start_time: Instant::now(),
        }
    }
}
