//! Error types for session manager operations
//!
//! Errors in this crate follow the observable-state discipline: transport
//! and handshake failures are recorded in the session (`last_error`) and the
//! published connection state, not thrown across the consumer boundary. The
//! handle API returns `Err` only for caller errors and channel breakage.

use thiserror::Error;

use meshlink_core::FirmwareVersion;

/// Main error type for session manager operations
#[derive(Error, Debug)]
pub enum SessionError {
    // ===== Transport Errors =====
    /// The radio adapter is powered off or missing
    #[error("Transport unavailable: radio is off")]
    TransportUnavailable,

    /// A connect attempt timed out
    #[error("Connect timeout on attempt {attempt} of {max_attempts}")]
    ConnectTimeout {
        /// Attempt that timed out (1-based)
        attempt: u8,
        /// Configured ceiling
        max_attempts: u8,
    },

    /// The transport reported a connect failure
    #[error("Connect failed: {0}")]
    ConnectFailed(String),

    /// The transport link dropped
    #[error("Link dropped: {0}")]
    LinkDropped(String),

    /// The peripheral is not currently visible to the transport
    #[error("Peripheral not found: {0}")]
    PeripheralNotFound(String),

    /// A transport write failed
    #[error("Write error: {0}")]
    WriteError(String),

    // ===== Handshake Errors =====
    /// Device firmware is older than the supported minimum
    #[error("Incompatible firmware {version} (minimum supported {minimum})")]
    IncompatibleFirmware {
        /// Version the device reported
        version: FirmwareVersion,
        /// Minimum supported version
        minimum: FirmwareVersion,
    },

    /// A handshake step failed or timed out; the handshake restarts from scratch
    #[error("Handshake failed during {step}: {reason}")]
    HandshakeFailure {
        /// Step that failed (identity, config, subscribe)
        step: &'static str,
        /// Failure reason
        reason: String,
    },

    // ===== Protocol Errors =====
    /// Frame did not start with the expected magic number
    #[error("Invalid magic number: expected 0x94C3, got 0x{got:04X}")]
    InvalidMagic {
        /// The received magic number
        got: u16,
    },

    /// Frame contents could not be decoded
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    /// Frame payload exceeds the allowed maximum
    #[error("Frame too large: {size} bytes exceeds maximum of {max} bytes")]
    FrameTooLarge {
        /// Actual payload size
        size: usize,
        /// Maximum allowed size
        max: usize,
    },

    // ===== Caller Errors =====
    /// Outbound call made while the session is not subscribed
    #[error("Session is not subscribed")]
    NotSubscribed,

    // ===== Plumbing =====
    /// Persistent store error
    #[error("Store error: {0}")]
    Store(#[from] meshlink_state::StateError),

    /// Command or event channel closed
    #[error("Channel closed")]
    ChannelClosed,
}

impl SessionError {
    /// Whether local recovery (retry/reconnect) is appropriate
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SessionError::TransportUnavailable
                | SessionError::ConnectTimeout { .. }
                | SessionError::ConnectFailed(_)
                | SessionError::LinkDropped(_)
                | SessionError::HandshakeFailure { .. }
        )
    }

    /// Whether this error is terminal for the current device
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionError::IncompatibleFirmware { .. })
    }

    /// Get an error code for logging/metrics
    pub fn error_code(&self) -> &'static str {
        match self {
            SessionError::TransportUnavailable => "TRANSPORT_UNAVAILABLE",
            SessionError::ConnectTimeout { .. } => "CONNECT_TIMEOUT",
            SessionError::ConnectFailed(_) => "CONNECT_FAILED",
            SessionError::LinkDropped(_) => "LINK_DROPPED",
            SessionError::PeripheralNotFound(_) => "PERIPHERAL_NOT_FOUND",
            SessionError::WriteError(_) => "WRITE_ERROR",
            SessionError::IncompatibleFirmware { .. } => "INCOMPATIBLE_FIRMWARE",
            SessionError::HandshakeFailure { .. } => "HANDSHAKE_FAILURE",
            SessionError::InvalidMagic { .. } => "INVALID_MAGIC",
            SessionError::InvalidFrame(_) => "INVALID_FRAME",
            SessionError::FrameTooLarge { .. } => "FRAME_TOO_LARGE",
            SessionError::NotSubscribed => "NOT_SUBSCRIBED",
            SessionError::Store(_) => "STORE_ERROR",
            SessionError::ChannelClosed => "CHANNEL_CLOSED",
        }
    }
}

/// Result type alias for session manager operations
pub type Result<T> = std::result::Result<T, SessionError>;

// Conversion from tokio mpsc send error
impl<T> From<tokio::sync::mpsc::error::SendError<T>> for SessionError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        SessionError::ChannelClosed
    }
}

// Conversion from btleplug errors (only when the ble feature is enabled)
#[cfg(feature = "ble")]
impl From<btleplug::Error> for SessionError {
    fn from(err: btleplug::Error) -> Self {
        match err {
            btleplug::Error::DeviceNotFound => {
                SessionError::PeripheralNotFound("device not found".to_string())
            }
            btleplug::Error::NotConnected => {
                SessionError::LinkDropped("not connected".to_string())
            }
            btleplug::Error::TimedOut(duration) => {
                SessionError::ConnectFailed(format!("timed out after {duration:?}"))
            }
            other => SessionError::ConnectFailed(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let err = SessionError::NotSubscribed;
        assert_eq!(err.error_code(), "NOT_SUBSCRIBED");
    }

    #[test]
    fn test_is_recoverable() {
        assert!(SessionError::TransportUnavailable.is_recoverable());
        assert!(SessionError::ConnectTimeout {
            attempt: 3,
            max_attempts: 10
        }
        .is_recoverable());
        assert!(SessionError::HandshakeFailure {
            step: "identity",
            reason: "timeout".into()
        }
        .is_recoverable());
        assert!(!SessionError::NotSubscribed.is_recoverable());
    }

    #[test]
    fn test_incompatible_firmware_is_terminal() {
        let err = SessionError::IncompatibleFirmware {
            version: "2.1.0".parse().unwrap(),
            minimum: "2.3.0".parse().unwrap(),
        };
        assert!(err.is_terminal());
        assert!(!err.is_recoverable());
        assert!(err.to_string().contains("2.1.0"));
        assert!(err.to_string().contains("2.3.0"));
    }
}
