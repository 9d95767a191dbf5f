//! Shared application state passed to every handler via Axum's `State` extractor.

use std::sync::Arc;
use std::time::Instant;

use crate::config::Config;
use crate::diagnostics::DiagnosticsSampler;
use crate::files::FileOpsClient;
use crate::sessions::SessionRegistry;
use crate::shell::ShellBridge;
use crate::tunnel::TunnelProxy;

/// Shared application state for the sshmux server.
#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// Monotonic instant when the server started (for uptime calculation).
    pub start_time: Instant,
    /// Owns every session and its SSH connection.
    pub registry: SessionRegistry,
    /// Interactive terminals bound to WebSocket clients.
    pub shells: ShellBridge,
    /// Cached file-transfer channels.
    pub files: FileOpsClient,
    /// Batched host probes and per-session history.
    pub diagnostics: DiagnosticsSampler,
    /// Raw TCP tunnels bound to WebSocket clients.
    pub tunnels: TunnelProxy,
}

impl AppState {
    /// Build every consumer around one registry. Consumers with per-session
    /// state subscribe to session teardown here.
    pub fn new(config: Config) -> Self {
        let registry = SessionRegistry::new(config.registry_settings());
        let shells = ShellBridge::new(registry.clone(), config.shell_settings());
        let files = FileOpsClient::new(registry.clone(), config.file_settings());
        let diagnostics = DiagnosticsSampler::new(registry.clone(), config.diagnostics_settings());
        let tunnels = TunnelProxy::new(registry.clone(), config.tunnel_settings());

        registry.add_listener(Arc::new(files.clone()));
        registry.add_listener(Arc::new(diagnostics.clone()));

        Self {
            config: Arc::new(config),
            start_time: Instant::now(),
            registry,
            shells,
            files,
            diagnostics,
            tunnels,
        }
    }
}
