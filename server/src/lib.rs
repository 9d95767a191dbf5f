#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::unused_async)]
#![allow(clippy::implicit_hasher)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! sshmux library — one SSH connection per user session, shared by a web
//! terminal, a file manager, a diagnostics sampler and a display tunnel.
//!
//! - `sessions` — session registry, connection handles, channel budget
//! - `transport` — SSH/SFTP seam (`Transport`, `ShellChannel`, `FileChannel`)
//! - `shell` — terminals bridged onto WebSocket clients
//! - `files` — lazily opened SFTP channel per session
//! - `diagnostics` — batched host probe, throughput rates, history
//! - `tunnel` — raw TCP tunnels over WebSocket binary frames
//! - `routes` / `ws` — REST and WebSocket surfaces
//! - `auth` / `config` — session-token middleware, configuration loading

pub mod auth;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod files;
pub mod routes;
pub mod sessions;
pub mod shell;
pub mod state;
pub mod transport;
pub mod tunnel;
pub mod util;
pub mod ws;

// Re-export key types at crate root for convenience.
pub use config::Config;
pub use error::MuxError;
pub use sessions::SessionRegistry;
pub use state::AppState;
