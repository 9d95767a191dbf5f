//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `SSHMUX_LISTEN`, `SSHMUX_SSH_HOST`,
//!    `SSHMUX_SSH_PORT`, `SSHMUX_LOG`
//! 2. **Config file** — path via `--config <path>`, or `sshmux.toml` in CWD
//! 3. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:3000"
//! max_concurrent_requests = 100
//!
//! [session]
//! idle_timeout_secs = 3600
//! sweep_interval_secs = 600
//!
//! [channels]
//! ceiling = 8              # keep below the server's MaxSessions (OpenSSH: 10)
//! acquire_wait_ms = 2000
//! open_timeout_secs = 10
//!
//! [ssh]
//! default_host = "localhost"
//! default_port = 22
//! connect_timeout_secs = 10
//! keepalive_interval_secs = 30
//!
//! [shell]
//! term = "xterm-256color"
//! default_cols = 80
//! default_rows = 24
//! wake_grace_ms = 600
//! wake_retry_ms = 1500
//!
//! [diagnostics]
//! history_capacity = 60
//! top_processes = 10
//! command_timeout_secs = 15
//! default_interval_ms = 3000
//! min_interval_ms = 1000
//!
//! [files]
//! max_file_size = 2097152      # 2 MiB
//! max_upload_size = 104857600  # 100 MiB
//! fallback_home = "/"
//!
//! [tunnel]
//! default_route = "direct"     # or "ssh"
//! default_host = "localhost"
//! default_port = 5900
//!
//! [logging]
//! level = "info"
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::diagnostics::DiagnosticsSettings;
use crate::files::FileSettings;
use crate::sessions::RegistrySettings;
use crate::shell::ShellSettings;
use crate::transport::ssh::SshConnectOptions;
use crate::tunnel::{TunnelRoute, TunnelSettings};

const DEFAULT_CONFIG_FILE: &str = "sshmux.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
    #[error("invalid value for {var}: {value:?}")]
    InvalidEnv { var: &'static str, value: String },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub channels: ChannelConfig,
    #[serde(default)]
    pub ssh: SshConfig,
    #[serde(default)]
    pub shell: ShellConfig,
    #[serde(default)]
    pub diagnostics: DiagnosticsConfig,
    #[serde(default)]
    pub files: FilesConfig,
    #[serde(default)]
    pub tunnel: TunnelConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind (default `0.0.0.0:3000`).
    #[serde(default = "default_listen")]
    pub listen: String,
    /// In-flight HTTP request cap across `/api` (default 100).
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,
}

/// Session lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Sessions idle longer than this are torn down (default 3600).
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    /// How often the background sweep runs (default 600).
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

/// Per-connection channel limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Maximum simultaneously open channels per connection (default 8).
    #[serde(default = "default_ceiling")]
    pub ceiling: usize,
    /// How long an open request may wait for a free slot (default 2000).
    #[serde(default = "default_acquire_wait")]
    pub acquire_wait_ms: u64,
    /// Upper bound for establishing a channel (default 10).
    #[serde(default = "default_open_timeout")]
    pub open_timeout_secs: u64,
}

/// Upstream SSH connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshConfig {
    /// Host used when a login omits one (default `localhost`).
    #[serde(default = "default_ssh_host")]
    pub default_host: String,
    #[serde(default = "default_ssh_port")]
    pub default_port: u16,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_keepalive")]
    pub keepalive_interval_secs: u64,
}

/// Interactive terminal settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellConfig {
    #[serde(default = "default_term")]
    pub term: String,
    #[serde(default = "default_cols")]
    pub default_cols: u16,
    #[serde(default = "default_rows")]
    pub default_rows: u16,
    /// Silence before the first wake-up newline (default 600).
    #[serde(default = "default_wake_grace")]
    pub wake_grace_ms: u64,
    /// Delay before the second and last wake-up newline (default 1500).
    #[serde(default = "default_wake_retry")]
    pub wake_retry_ms: u64,
}

/// Remote diagnostics sampling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticsConfig {
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
    #[serde(default = "default_top_processes")]
    pub top_processes: usize,
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
    #[serde(default = "default_interval")]
    pub default_interval_ms: u64,
    /// Floor for client-requested polling intervals (default 1000).
    #[serde(default = "default_min_interval")]
    pub min_interval_ms: u64,
}

/// Remote file operation limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilesConfig {
    /// Maximum size for whole-file read/write (default 2 MiB).
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
    /// Maximum size for streamed uploads (default 100 MiB).
    #[serde(default = "default_max_upload_size")]
    pub max_upload_size: u64,
    /// Returned when the remote home directory cannot be determined.
    #[serde(default = "default_fallback_home")]
    pub fallback_home: String,
}

/// Display tunnel defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConfig {
    #[serde(default)]
    pub default_route: TunnelRoute,
    #[serde(default = "default_ssh_host")]
    pub default_host: String,
    #[serde(default = "default_tunnel_port")]
    pub default_port: u16,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `tracing` filter directive (default `"info"`). `RUST_LOG` overrides it.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_listen() -> String {
    "0.0.0.0:3000".to_string()
}
fn default_max_concurrent_requests() -> usize {
    100
}
fn default_idle_timeout() -> u64 {
    3600
}
fn default_sweep_interval() -> u64 {
    600
}
fn default_ceiling() -> usize {
    8
}
fn default_acquire_wait() -> u64 {
    2000
}
fn default_open_timeout() -> u64 {
    10
}
fn default_ssh_host() -> String {
    "localhost".to_string()
}
fn default_ssh_port() -> u16 {
    22
}
fn default_connect_timeout() -> u64 {
    10
}
fn default_keepalive() -> u64 {
    30
}
fn default_term() -> String {
    "xterm-256color".to_string()
}
fn default_cols() -> u16 {
    80
}
fn default_rows() -> u16 {
    24
}
fn default_wake_grace() -> u64 {
    600
}
fn default_wake_retry() -> u64 {
    1500
}
fn default_history_capacity() -> usize {
    60
}
fn default_top_processes() -> usize {
    10
}
fn default_command_timeout() -> u64 {
    15
}
fn default_interval() -> u64 {
    3000
}
fn default_min_interval() -> u64 {
    1000
}
fn default_max_file_size() -> u64 {
    2 * 1024 * 1024
}
fn default_max_upload_size() -> u64 {
    100 * 1024 * 1024
}
fn default_fallback_home() -> String {
    "/".to_string()
}
fn default_tunnel_port() -> u16 {
    5900
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            max_concurrent_requests: default_max_concurrent_requests(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_idle_timeout(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            ceiling: default_ceiling(),
            acquire_wait_ms: default_acquire_wait(),
            open_timeout_secs: default_open_timeout(),
        }
    }
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            default_host: default_ssh_host(),
            default_port: default_ssh_port(),
            connect_timeout_secs: default_connect_timeout(),
            keepalive_interval_secs: default_keepalive(),
        }
    }
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            term: default_term(),
            default_cols: default_cols(),
            default_rows: default_rows(),
            wake_grace_ms: default_wake_grace(),
            wake_retry_ms: default_wake_retry(),
        }
    }
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            history_capacity: default_history_capacity(),
            top_processes: default_top_processes(),
            command_timeout_secs: default_command_timeout(),
            default_interval_ms: default_interval(),
            min_interval_ms: default_min_interval(),
        }
    }
}

impl Default for FilesConfig {
    fn default() -> Self {
        Self {
            max_file_size: default_max_file_size(),
            max_upload_size: default_max_upload_size(),
            fallback_home: default_fallback_home(),
        }
    }
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            default_route: TunnelRoute::default(),
            default_host: default_ssh_host(),
            default_port: default_tunnel_port(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, that file must exist. Otherwise `sshmux.toml` in
    /// the current directory is used when present.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let file = match path {
            Some(p) => Some(p),
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => Some(DEFAULT_CONFIG_FILE),
            None => None,
        };
        let mut config = match file {
            Some(p) => {
                let content = std::fs::read_to_string(p).map_err(|source| ConfigError::Read {
                    path: p.to_string(),
                    source,
                })?;
                Self::from_toml(p, &content)?
            }
            None => Self::default(),
        };
        config.apply_env(|var| std::env::var(var).ok())?;
        config.validate()?;
        Ok(config)
    }

    fn from_toml(path: &str, content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })
    }

    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(listen) = lookup("SSHMUX_LISTEN") {
            self.server.listen = listen;
        }
        if let Some(host) = lookup("SSHMUX_SSH_HOST") {
            self.ssh.default_host = host;
        }
        if let Some(port) = lookup("SSHMUX_SSH_PORT") {
            self.ssh.default_port = port.parse().map_err(|_| ConfigError::InvalidEnv {
                var: "SSHMUX_SSH_PORT",
                value: port,
            })?;
        }
        if let Some(level) = lookup("SSHMUX_LOG") {
            self.logging.level = level;
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.channels.ceiling == 0 {
            return Err(ConfigError::Invalid("channels.ceiling must be at least 1".into()));
        }
        if self.server.max_concurrent_requests == 0 {
            return Err(ConfigError::Invalid(
                "server.max_concurrent_requests must be at least 1".into(),
            ));
        }
        if self.session.sweep_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "session.sweep_interval_secs must be at least 1".into(),
            ));
        }
        if !self.files.fallback_home.starts_with('/') {
            return Err(ConfigError::Invalid("files.fallback_home must be absolute".into()));
        }
        Ok(())
    }

    pub fn channel_open_timeout(&self) -> Duration {
        Duration::from_secs(self.channels.open_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.session.sweep_interval_secs)
    }

    pub fn registry_settings(&self) -> RegistrySettings {
        RegistrySettings {
            idle_timeout: Duration::from_secs(self.session.idle_timeout_secs),
            channel_ceiling: self.channels.ceiling,
            acquire_wait: Duration::from_millis(self.channels.acquire_wait_ms),
        }
    }

    pub fn shell_settings(&self) -> ShellSettings {
        ShellSettings {
            term: self.shell.term.clone(),
            default_cols: self.shell.default_cols,
            default_rows: self.shell.default_rows,
            wake_grace: Duration::from_millis(self.shell.wake_grace_ms),
            wake_retry: Duration::from_millis(self.shell.wake_retry_ms),
            open_timeout: self.channel_open_timeout(),
        }
    }

    pub fn diagnostics_settings(&self) -> DiagnosticsSettings {
        DiagnosticsSettings {
            history_capacity: self.diagnostics.history_capacity,
            top_processes: self.diagnostics.top_processes,
            command_timeout: Duration::from_secs(self.diagnostics.command_timeout_secs),
            default_interval: Duration::from_millis(self.diagnostics.default_interval_ms),
            min_interval: Duration::from_millis(self.diagnostics.min_interval_ms),
        }
    }

    pub fn file_settings(&self) -> FileSettings {
        FileSettings {
            max_file_size: self.files.max_file_size,
            max_upload_size: self.files.max_upload_size,
            fallback_home: self.files.fallback_home.clone(),
            open_timeout: self.channel_open_timeout(),
        }
    }

    pub fn tunnel_settings(&self) -> TunnelSettings {
        TunnelSettings {
            connect_timeout: self.channel_open_timeout(),
            default_route: self.tunnel.default_route,
        }
    }

    /// Connection options for a login; `host`/`port` fall back to `[ssh]`.
    pub fn ssh_options(
        &self,
        host: Option<&str>,
        port: Option<u16>,
        username: &str,
        password: &str,
    ) -> SshConnectOptions {
        SshConnectOptions {
            host: host
                .filter(|h| !h.is_empty())
                .unwrap_or(&self.ssh.default_host)
                .to_string(),
            port: port.unwrap_or(self.ssh.default_port),
            username: username.to_string(),
            password: password.to_string(),
            connect_timeout: Duration::from_secs(self.ssh.connect_timeout_secs),
            keepalive_interval: Duration::from_secs(self.ssh.keepalive_interval_secs),
        }
    }
}
