//! Shared types for kmcp
//!
//! Holds the pieces every other kmcp crate leans on: the layered static
//! configuration and its extended-config registries, the per-request
//! context carried into derived clients, the common error type, backoff
//! helpers and telemetry setup.

#![deny(missing_docs)]

pub mod backoff;
pub mod config;
pub mod context;
pub mod error;
pub mod telemetry;

pub use backoff::Backoff;
pub use config::{GroupVersionKind, StaticConfig};
pub use context::RequestContext;
pub use error::{Error, Result};

/// Name reported in user agents and log targets
pub const SERVER_NAME: &str = "kmcp";

/// Version of this build
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default user agent for clients that act as the server's own identity
pub fn default_user_agent() -> String {
    format!("{SERVER_NAME}/{VERSION}")
}
