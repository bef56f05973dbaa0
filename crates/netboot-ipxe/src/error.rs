//! Error types for boot script generation

use std::path::PathBuf;
use thiserror::Error;

/// Error type for iPXE operations
#[derive(Debug, Error)]
pub enum IpxeError {
    /// Template failed to compile or render
    #[error("template error: {0}")]
    Template(#[from] minijinja::Error),

    /// Profile or group file could not be read
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Profile or group file is not valid JSON
    #[error("invalid JSON in {path}: {source}")]
    InvalidJson {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// A group names a profile that does not exist
    #[error("group {group} references missing profile {profile}")]
    MissingProfile { group: String, profile: String },
}

/// Result type for iPXE operations
pub type Result<T> = std::result::Result<T, IpxeError>;
