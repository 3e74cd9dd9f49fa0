use thiserror::Error;

/// Failures surfaced by sessions, the registry and the executor.
///
/// Timeouts are deliberately absent: running out of patience is a normal
/// outcome and is reported as response text, not as an error.
#[derive(Debug, Error)]
pub enum ExecError {
    /// The process or connection behind a session could not be established
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),
    /// The session was never connected or has already been closed
    #[error("shell not connected")]
    NotConnected,
    /// A previously healthy channel broke while in use
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    /// The intervention checkpoint aborted the request
    #[error("execution cancelled")]
    Cancelled,
}

impl ExecError {
    /// Whether a full reset and resend is worth attempting.
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            ExecError::BackendUnavailable(_) | ExecError::ConnectionLost(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connectivity_classification() {
        assert!(ExecError::BackendUnavailable("spawn".into()).is_connectivity());
        assert!(ExecError::ConnectionLost("eof".into()).is_connectivity());
        assert!(!ExecError::NotConnected.is_connectivity());
        assert!(!ExecError::Cancelled.is_connectivity());
    }

    #[test]
    fn test_display() {
        let err = ExecError::ConnectionLost("broken pipe".into());
        assert_eq!(err.to_string(), "connection lost: broken pipe");
    }
}
