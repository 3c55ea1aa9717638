//! Core error types

use thiserror::Error;

/// Errors produced by the core types
#[derive(Error, Debug)]
pub enum CoreError {
    /// Firmware version string could not be parsed
    #[error("Invalid firmware version: {0}")]
    InvalidVersion(String),

    /// Peripheral identifier is empty or malformed
    #[error("Invalid peripheral id: {0}")]
    InvalidPeripheralId(String),

    /// Node update kind tag is not recognized
    #[error("Unknown node update kind: {0}")]
    UnknownUpdateKind(u8),
}

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, CoreError>;
