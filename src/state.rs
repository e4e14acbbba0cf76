//! Shared application state.

use crate::admission::AdmissionGate;
use crate::config::Options;
use crate::resolver::CommandResolver;
use crate::shutdown::ShutdownCoordinator;
use std::sync::Arc;

/// Shared by every request handler and session.
#[derive(Clone)]
pub struct AppState {
    pub options: Arc<Options>,
    pub gate: Arc<AdmissionGate>,
    pub shutdown: Arc<ShutdownCoordinator>,
    pub resolver: CommandResolver,
    pub hostname: Arc<str>,
}

impl AppState {
    pub fn new(options: Options, resolver: CommandResolver) -> Self {
        let hostname = nix::unistd::gethostname()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "localhost".to_string());
        Self {
            gate: AdmissionGate::new(options.max_connection),
            options: Arc::new(options),
            shutdown: ShutdownCoordinator::new(),
            resolver,
            hostname: hostname.into(),
        }
    }
}
