use thiserror::Error;

/// Session-wide error type
///
/// Device and transport failures are kept apart so the session can pick
/// between a retry and a status line.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Missing session code")]
    MissingCode,

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Device unavailable: {0}")]
    DeviceUnavailable(String),

    /// Capability absent on this platform; the message is shown as-is
    #[error("{0}")]
    Unsupported(String),

    #[error("Peer {0} is not connected")]
    TargetUnreachable(String),

    #[error("Disconnected from rendezvous service")]
    TransportDisconnected,

    #[error("Negotiation failed: {0}")]
    NegotiationFailed(String),

    #[error("Data link is not open")]
    SendOnClosedLink,

    /// Any other rendezvous service error, surfaced verbatim
    #[error("{0}")]
    Rendezvous(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for SessionError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

impl From<serde_json::Error> for SessionError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<webrtc::Error> for SessionError {
    fn from(e: webrtc::Error) -> Self {
        Self::NegotiationFailed(e.to_string())
    }
}

/// Result type alias for session operations
pub type Result<T> = std::result::Result<T, SessionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsupported_message_is_verbatim() {
        let err = SessionError::Unsupported("Screen sharing not supported".to_string());
        assert_eq!(err.to_string(), "Screen sharing not supported");
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: SessionError = io.into();
        assert!(matches!(err, SessionError::Io(_)));
    }
}
