//! Manifest error types.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while loading or validating a tool manifest.
#[derive(Debug, Error)]
pub enum ManifestError {
    /// `tool.yaml` could not be read.
    #[error("failed to read {}: {reason}", path.display())]
    ReadFailed { path: PathBuf, reason: String },

    /// `tool.yaml` is not valid YAML for a manifest.
    #[error("failed to parse {}: {reason}", path.display())]
    ParseFailed { path: PathBuf, reason: String },

    /// A required field is missing or empty.
    #[error("manifest validation failed: '{field}' is required")]
    MissingField { field: &'static str },

    /// The entrypoint does not exist or escapes the tool directory.
    #[error("invalid entrypoint '{entrypoint}': {reason}")]
    InvalidEntrypoint { entrypoint: String, reason: String },

    /// The entrypoint's first line could not be read.
    #[error("failed to read shebang file: {}", path.display())]
    ShebangUnreadable { path: PathBuf },

    /// The entrypoint's first line does not start with `#!`.
    #[error("invalid shebang prefix: {line}")]
    ShebangInvalidPrefix { path: PathBuf, line: String },

    /// The shebang names no interpreter.
    #[error("invalid shebang: {line}, expected an interpreter")]
    ShebangEmpty { path: PathBuf, line: String },
}
