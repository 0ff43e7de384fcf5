//! Error types for the function runtime
//!
//! Configuration and startup errors are fatal and stop the process before
//! the listener binds. Everything that can go wrong while serving a request
//! is captured as an [`InvocationFailure`] and turned into an HTTP response.

use thiserror::Error;

/// Invalid or missing configuration, detected at startup
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("the {0} environment variable must be provided")]
    Missing(&'static str),

    #[error("invalid value {value:?} for {name}: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },

    #[error("no function named {name} available, available functions are: {available}")]
    UnknownHandler { name: String, available: String },
}

impl ConfigError {
    pub(crate) fn invalid(name: &'static str, value: &str, reason: impl ToString) -> Self {
        ConfigError::Invalid {
            name,
            value: value.to_owned(),
            reason: reason.to_string(),
        }
    }
}

/// Anything that stops the runtime from starting to serve
#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("metrics registration failed: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Why an invocation did not produce a payload
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvocationFailure {
    /// The handler returned an error, panicked, or its worker died
    #[error("handler failed: {0}")]
    Handler(String),

    /// The isolation mechanism itself could not be started
    #[error("dispatch failed: {0}")]
    Dispatch(String),
}

/// Reasons the normalizer fell back to opaque bytes
#[derive(Debug, Error)]
pub(crate) enum NormalizeError {
    #[error("body is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("data_base64 is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),
}
