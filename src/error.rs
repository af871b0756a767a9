//! Typed failures for the device trust engine.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TrustError {
    /// No pending approval matches the presented token.
    #[error("approval token does not match a pending request")]
    TokenInvalid,

    /// The token matched but the approval window has passed.
    #[error("approval token expired")]
    TokenExpired,

    /// The approval code did not match; the attempt counter was incremented.
    #[error("approval code does not match")]
    CodeInvalid,

    /// Code attempts are exhausted. Terminal for this request; a fresh
    /// approval must be issued.
    #[error("approval code attempts exhausted")]
    MaxAttemptsReached,

    /// The request was already approved, denied, or superseded by another
    /// caller.
    #[error("approval request already resolved")]
    DeviceAlreadyResolved,

    /// The collision-retry budget for secret generation ran out. Retryable
    /// server error.
    #[error("secret generation retry budget exhausted")]
    SecretGenerationExhausted,

    /// A concurrent mutation won the race on the device row.
    #[error("conflicting update on device")]
    Conflict,

    #[error("device not found")]
    DeviceNotFound,

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

pub type TrustResult<T> = std::result::Result<T, TrustError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages_never_mention_secrets() {
        let errors = [
            TrustError::TokenInvalid,
            TrustError::TokenExpired,
            TrustError::CodeInvalid,
            TrustError::MaxAttemptsReached,
            TrustError::DeviceAlreadyResolved,
            TrustError::SecretGenerationExhausted,
            TrustError::Conflict,
            TrustError::DeviceNotFound,
        ];
        for err in errors {
            let message = err.to_string();
            assert!(!message.is_empty());
            assert!(!message.contains("plaintext"));
        }
    }

    #[test]
    fn storage_errors_wrap_transparently() {
        let err: TrustError = anyhow::anyhow!("connection refused").into();
        assert!(matches!(err, TrustError::Storage(_)));
        assert_eq!(err.to_string(), "connection refused");
    }
}
