//! Error handling for the companion CLI

use thiserror::Error;

use crate::config::ConfigError;

/// CLI-specific error types
#[derive(Error, Debug)]
pub enum CliError {
    #[error("Link error: {0}")]
    Link(#[from] companion_ble::LinkError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    #[error("Pairing failed: {0}")]
    PairingFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for CLI operations
pub type Result<T> = std::result::Result<T, CliError>;
