#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # sshmux
//!
//! Multiplexed SSH session manager for a browser-based server console.
//!
//! A user logs in once with SSH credentials; the resulting connection is then
//! shared by a web terminal, an SFTP file manager, a diagnostics sampler and a
//! display tunnel. Channels on the connection are rationed so concurrent
//! consumers never exceed the server's per-connection limit.
//!
//! ## Subcommands
//!
//! - `sshmux serve` (default) — run the HTTP/WS server
//! - `sshmux check-config` — print the resolved configuration and exit
//!
//! ## API surface
//!
//! | Method | Path                          | Auth | Description                        |
//! |--------|-------------------------------|------|------------------------------------|
//! | GET    | `/api/health`                 | No   | Liveness probe                     |
//! | POST   | `/api/auth/login`             | No   | SSH login, returns `sessionId`     |
//! | POST   | `/api/auth/logout`            | Yes  | Terminate the session              |
//! | GET    | `/api/auth/session`           | Yes  | Session metadata, channel usage    |
//! | GET    | `/api/diagnostics/snapshot`   | Yes  | One batched probe plus history     |
//! | GET    | `/api/diagnostics/history`    | Yes  | Stored history only                |
//! | GET    | `/api/files/home`             | Yes  | Remote home directory              |
//! | GET    | `/api/files/list`             | Yes  | Directory listing                  |
//! | GET    | `/api/files/stat`             | Yes  | File info                          |
//! | GET    | `/api/files/read`             | Yes  | Read a file                        |
//! | PUT    | `/api/files/write`            | Yes  | Write a file                       |
//! | POST   | `/api/files/rename`           | Yes  | Rename/move                        |
//! | DELETE | `/api/files`                  | Yes  | Delete a file or directory         |
//! | POST   | `/api/files/mkdir`            | Yes  | Create a directory                 |
//! | GET    | `/api/files/download`         | Yes  | Streamed download                  |
//! | POST   | `/api/files/upload`           | Yes  | Streamed multipart upload          |
//! | GET    | `/api/tunnel/probe`           | Yes  | Display target reachability        |
//! | GET    | `/api/ws`                     | Yes* | Terminals, tunnels, live metrics   |
//!
//! *WebSocket auth is via `?session=<id>` query param (no `Authorization`
//! header available during the upgrade handshake).
//!
//! ## Architecture
//!
//! ```text
//! main.rs          — entry point, clap subcommands, router setup, graceful shutdown
//! auth.rs          — Bearer session-token middleware
//! config.rs        — TOML + env-var configuration
//! error.rs         — MuxError taxonomy and HTTP/WS error mapping
//! transport/
//!   mod.rs         — Transport, ShellChannel, FileChannel traits
//!   ssh.rs         — russh / russh-sftp implementation
//! sessions/
//!   mod.rs         — SessionRegistry (register, lookup, terminate, sweep)
//!   connection.rs  — ConnectionHandle (health flag, cancellation)
//!   budget.rs      — ChannelBudget and permits
//! shell/           — ShellBridge, first-prompt wake schedule
//! files/           — FileOpsClient
//! diagnostics/     — DiagnosticsSampler, probe command and section parsers
//! tunnel/          — TunnelProxy
//! routes/          — REST handlers
//! ws/              — WebSocket upgrade and message dispatch
//! ```

use axum::{
    extract::DefaultBodyLimit,
    middleware,
    routing::{delete, get, post, put},
    Router,
};
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use sshmux::sessions::CloseReason;
use sshmux::{auth, routes, ws, AppState, Config};

/// Multiplexed SSH session manager.
#[derive(Parser)]
#[command(name = "sshmux", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP/WS server (default when no subcommand given).
    Serve {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
    /// Print the resolved configuration as TOML and exit.
    CheckConfig {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::CheckConfig { config }) => {
            let config = load_config(config.as_deref());
            match toml::to_string_pretty(&config) {
                Ok(text) => print!("{text}"),
                Err(e) => {
                    eprintln!("Failed to render configuration: {e}");
                    std::process::exit(1);
                }
            }
        }
        Some(Commands::Serve { config }) => run_server(config.as_deref()).await,
        None => run_server(None).await,
    }
}

fn load_config(path: Option<&str>) -> Config {
    Config::load(path).unwrap_or_else(|e| {
        eprintln!("{e}");
        std::process::exit(1);
    })
}

/// Assemble the public, authenticated and WebSocket routes with the shared
/// middleware stack.
fn build_router(state: AppState) -> Router {
    let files = &state.config.files;
    // Base64 inflates content by 4/3; leave room for the JSON envelope.
    let write_limit = usize::try_from(files.max_file_size / 3 * 4 + 64 * 1024).unwrap_or(usize::MAX);

    let public_routes = Router::new()
        .route("/api/health", get(routes::health::health))
        .route("/api/auth/login", post(routes::session::login));

    let authed_routes = Router::new()
        .route("/api/auth/logout", post(routes::session::logout))
        .route("/api/auth/session", get(routes::session::info))
        .route("/api/diagnostics/snapshot", get(routes::diagnostics::snapshot))
        .route("/api/diagnostics/history", get(routes::diagnostics::history))
        .route("/api/files", delete(routes::files::delete))
        .route("/api/files/home", get(routes::files::home))
        .route("/api/files/list", get(routes::files::list))
        .route("/api/files/stat", get(routes::files::stat))
        .route("/api/files/read", get(routes::files::read))
        .route(
            "/api/files/write",
            put(routes::files::write).layer(DefaultBodyLimit::max(write_limit)),
        )
        .route("/api/files/rename", post(routes::files::rename))
        .route("/api/files/mkdir", post(routes::files::mkdir))
        .route("/api/files/download", get(routes::files::download))
        .route(
            "/api/files/upload",
            // The upload cap is enforced while streaming.
            post(routes::files::upload).layer(DefaultBodyLimit::disable()),
        )
        .route("/api/tunnel/probe", get(routes::tunnel::probe))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_session,
        ));

    let ws_route = Router::new().route("/api/ws", get(ws::ws_upgrade));

    Router::new()
        .merge(public_routes)
        .merge(authed_routes)
        .merge(ws_route)
        .layer(ConcurrencyLimitLayer::new(
            state.config.server.max_concurrent_requests,
        ))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn run_server(config_path: Option<&str>) {
    let config = load_config(config_path);

    // Initialize tracing
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    info!("sshmux v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Listening on {}", config.server.listen);
    info!(
        ceiling = config.channels.ceiling,
        idle_timeout_secs = config.session.idle_timeout_secs,
        ssh_default = %format!("{}:{}", config.ssh.default_host, config.ssh.default_port),
        "Session limits"
    );

    let state = AppState::new(config);
    let app = build_router(state.clone());

    let listener = TcpListener::bind(&state.config.server.listen)
        .await
        .expect("Failed to bind");

    info!("Server ready");

    // Periodic sweep: tear down idle and dead sessions
    let registry = state.registry.clone();
    let sweep_every = state.config.sweep_interval();
    let sweep_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(sweep_every);
        loop {
            interval.tick().await;
            let swept = registry.sweep().await;
            if !swept.is_empty() {
                info!("Sweep closed {} session(s)", swept.len());
            }
        }
    });

    // Graceful shutdown
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("Failed to register SIGTERM");
            tokio::select! {
                _ = ctrl_c => info!("Received SIGINT"),
                _ = sigterm.recv() => info!("Received SIGTERM"),
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
            info!("Received SIGINT");
        }
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .expect("Server error");

    // Cleanup
    info!("Shutting down...");
    sweep_task.abort();
    state.registry.terminate_all(CloseReason::Shutdown).await;
    info!("Goodbye");
}
