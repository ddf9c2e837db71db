use thiserror::Error;

/// Failure of a single stage attempt.
///
/// Every executor and provider reports failures in these two kinds; the
/// coordinator applies the same retry policy regardless of stage.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StageError {
    /// Retryable: timeouts, rate limits, transient I/O
    #[error("transient: {0}")]
    Transient(String),

    /// Not retryable: malformed input, unsupported format, provider refusal
    #[error("permanent: {0}")]
    Permanent(String),
}

impl StageError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Transient(m) | Self::Permanent(m) => m,
        }
    }

    /// Classify a local I/O failure.
    ///
    /// Missing inputs and permission problems will not fix themselves;
    /// everything else (full disk, interrupted writes) gets another try.
    pub fn from_io(context: &str, err: &std::io::Error) -> Self {
        use std::io::ErrorKind;
        let msg = format!("{}: {}", context, err);
        match err.kind() {
            ErrorKind::NotFound | ErrorKind::PermissionDenied | ErrorKind::InvalidData => {
                Self::Permanent(msg)
            }
            _ => Self::Transient(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_classification() {
        let denied = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope");
        let interrupted = std::io::Error::new(std::io::ErrorKind::Interrupted, "again");

        assert!(!StageError::from_io("write", &denied).is_transient());
        assert!(StageError::from_io("write", &interrupted).is_transient());
        assert_eq!(
            StageError::from_io("write", &denied).message(),
            "write: nope"
        );
    }
}
