//! HTTP listener and process lifecycle.
//!
//! `start_server` binds the configured address, flips the readiness flag once
//! the listener is live, and drives graceful shutdown: when the shutdown flag
//! rises the listener stops accepting, in-flight requests get the configured
//! grace period to finish, and whatever is still open after that is aborted.

mod server;
mod shutdown;

pub use server::{start_server, ServerError};
pub use shutdown::spawn_signal_listener;
