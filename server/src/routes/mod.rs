//! HTTP route handlers.
//!
//! Each sub-module corresponds to an API endpoint group. All handlers except
//! [`health`] and [`session::login`] require a live session via the
//! [`crate::auth::require_session`] middleware, which makes the
//! [`crate::auth::SessionContext`] extension available.

pub mod diagnostics;
pub mod files;
pub mod health;
pub mod session;
pub mod tunnel;
