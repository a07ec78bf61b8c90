//! Error types for tilestream

use thiserror::Error;

/// Main error type for the crate
#[derive(Debug, Error)]
pub enum Error {
    #[error("Device error: {0}")]
    Device(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config error: {0}")]
    Config(#[from] serde_json::Error),

    #[error("Unknown tiled texture {0}")]
    UnknownTexture(u32),

    #[error("Invalid texture description: {0}")]
    InvalidDesc(String),
}
