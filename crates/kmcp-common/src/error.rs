//! Error types shared across kmcp crates
//!
//! Variants carry the name of the thing that failed so logs stay useful
//! without a backtrace.

use thiserror::Error;

/// Result alias for kmcp-common operations
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors raised while loading configuration and setting up shared state
#[derive(Debug, Error)]
pub enum Error {
    /// A configuration file could not be read
    #[error("failed to read config {path}: {source}")]
    Io {
        /// Path of the file or directory that failed
        path: String,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// A configuration document could not be parsed
    #[error("failed to parse config {origin}: {message}")]
    Parse {
        /// File path, or "overrides" for the build-time override document
        origin: String,
        /// Parser message
        message: String,
    },

    /// An extended (provider or toolset) table failed to parse or validate
    #[error("invalid {kind} config {name:?}: {message}")]
    ExtendedConfig {
        /// Registry kind, "provider" or "toolset"
        kind: String,
        /// Registered table name
        name: String,
        /// What was wrong
        message: String,
    },

    /// A value in the merged configuration is invalid
    #[error("invalid configuration: {0}")]
    Invalid(String),

    /// Telemetry could not be initialized
    #[error("failed to initialize telemetry: {0}")]
    Telemetry(String),
}

impl Error {
    /// Create a parse error for a named origin
    pub fn parse(origin: impl Into<String>, message: impl ToString) -> Self {
        Self::Parse {
            origin: origin.into(),
            message: message.to_string(),
        }
    }

    /// Create an I/O error for a path
    pub fn io(path: impl AsRef<std::path::Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().display().to_string(),
            source,
        }
    }

    /// Create an invalid configuration error
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid(message.into())
    }
}
