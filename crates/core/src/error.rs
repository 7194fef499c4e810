//! Error types for module loading and symbol resolution

use std::path::PathBuf;
use thiserror::Error;

/// Failure to bring a provider module into the registry
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("module file not found: {0}")]
    NotFound(PathBuf),

    #[error("failed to open module {path}: {reason}")]
    Open { path: PathBuf, reason: String },

    #[error("module {path} is missing required symbols: {}", missing.join(", "))]
    MissingSymbols {
        path: PathBuf,
        missing: Vec<&'static str>,
    },

    #[error("module {0} is already loaded")]
    AlreadyLoaded(String),

    #[error("module {name} failed to initialize: {reason}")]
    Init { name: String, reason: String },

    #[error("module {0} registered no used variables")]
    Unused(String),

    #[error("unknown built-in module: {0}")]
    UnknownBuiltin(String),
}

/// Failure to bind a variable's method name to a callable
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("module {module} has no method {method}")]
    UnknownMethod { module: String, method: String },

    #[error("method {method} does not match the declared signature")]
    SignatureMismatch { method: String },

    #[error("method name {0:?} is not a valid symbol")]
    InvalidName(String),
}
