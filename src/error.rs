//! Error types for preview connections.

use thiserror::Error;

/// Errors that can occur while establishing or tearing down a preview.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PreviewError {
    /// Relay unreachable, or the source cannot be produced right now.
    #[error("Relay unavailable: {0}")]
    Unavailable(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    /// Relay rejected the negotiation or sent something we could not decode.
    #[error("Protocol rejection: {0}")]
    Protocol(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Signaling error: {0}")]
    Signaling(String),

    /// Cooperative cancellation. Not a failure.
    #[error("Cancelled")]
    Cancelled,

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl PreviewError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, PreviewError::Cancelled)
    }

    /// Whether a later attempt has a reasonable chance of succeeding.
    ///
    /// Unavailability is left to the caller; configuration errors never heal.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PreviewError::Timeout(_)
                | PreviewError::Protocol(_)
                | PreviewError::Transport(_)
                | PreviewError::Signaling(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, PreviewError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(PreviewError::Cancelled.is_cancelled());
        assert!(!PreviewError::Cancelled.is_retryable());
        assert!(!PreviewError::Unavailable("down".into()).is_retryable());
        assert!(PreviewError::Timeout("track".into()).is_retryable());
        assert!(PreviewError::Protocol("500".into()).is_retryable());
    }

    #[test]
    fn test_display() {
        let e = PreviewError::Protocol("relay returned 404".into());
        assert_eq!(e.to_string(), "Protocol rejection: relay returned 404");
    }
}
