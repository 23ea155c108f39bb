use thiserror::Error;

/// Engine-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Capture unavailable [{kind}]: {reason}")]
    CaptureUnavailable { kind: String, reason: String },

    #[error("Video error: {0}")]
    VideoError(String),

    #[error("Audio error: {0}")]
    AudioError(String),

    #[error("WebRTC error: {0}")]
    WebRtcError(String),

    #[error("Negotiation failed: {0}")]
    NegotiationFailed(String),
}

impl AppError {
    /// Build a capture-unavailable error for the given source kind
    pub fn capture_unavailable(kind: impl ToString, reason: impl Into<String>) -> Self {
        Self::CaptureUnavailable {
            kind: kind.to_string(),
            reason: reason.into(),
        }
    }

    /// True when the error is terminal for a relay session
    pub fn is_terminal_for_session(&self) -> bool {
        matches!(self, AppError::NegotiationFailed(_))
    }
}

/// Result type alias used throughout the crate
pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_unavailable_message() {
        let err = AppError::capture_unavailable("camera", "executable not found");
        assert_eq!(
            err.to_string(),
            "Capture unavailable [camera]: executable not found"
        );
        assert!(!err.is_terminal_for_session());
    }

    #[test]
    fn test_negotiation_is_terminal() {
        let err = AppError::NegotiationFailed("no reachable candidates".to_string());
        assert!(err.is_terminal_for_session());
    }
}
