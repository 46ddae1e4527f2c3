//! Protocol error taxonomy.
//!
//! Decoding/validation errors are never thrown across the stack as
//! exceptions: every fallible
//! operation returns `Result<T, ProtocolError>`, and the one place that
//! receives them converts to a `reject` message plus a misbehavior score
//! adjustment.

use thiserror::Error;

/// A protocol error, carrying the misbehavior weight it warrants.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("non-continuous or consensus-invalid header: {0}")]
    BadHeader(String),

    #[error("encoding invariant violated: {0}")]
    BadEncoding(String),

    #[error("cheap-hash collision in block transactions")]
    CheapHashCollision,

    #[error("reconstruction stubs disagree: {0}")]
    ReconstructionMismatch(String),

    #[error("merkle root mismatch on block reconstruction")]
    MerkleMismatch,

    #[error("peer is stalling block download")]
    Stalling,

    #[error("transaction does not belong to any active builder")]
    UnwantedTransaction,
}

impl ProtocolError {
    /// Misbehavior weight to apply to the peer that triggered this error.
    /// `None` means the error is internal/benign and must never reach a
    /// peer's score.
    pub fn misbehavior_weight(&self) -> Option<i32> {
        match self {
            ProtocolError::BadHeader(_) => Some(20),
            ProtocolError::BadEncoding(_) => Some(10),
            ProtocolError::CheapHashCollision => None,
            ProtocolError::ReconstructionMismatch(_) => None,
            ProtocolError::MerkleMismatch => None,
            ProtocolError::Stalling => None,
            ProtocolError::UnwantedTransaction => None,
        }
    }

    /// Whether a `reject` wire message should be sent back to the peer.
    pub fn should_reject(&self) -> bool {
        matches!(
            self,
            ProtocolError::BadHeader(_) | ProtocolError::BadEncoding(_)
        )
    }
}

/// `reject` message reason, truncated to the wire limit.
pub const MAX_REJECT_MESSAGE_LENGTH: usize = 111;

pub fn truncate_reject_reason(reason: &str) -> String {
    if reason.len() <= MAX_REJECT_MESSAGE_LENGTH {
        reason.to_string()
    } else {
        reason.chars().take(MAX_REJECT_MESSAGE_LENGTH).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bad_header_carries_weight_twenty() {
        assert_eq!(
            ProtocolError::BadHeader("break".into()).misbehavior_weight(),
            Some(20)
        );
    }

    #[test]
    fn reconstruction_mismatch_is_internal() {
        assert_eq!(
            ProtocolError::ReconstructionMismatch("x".into()).misbehavior_weight(),
            None
        );
        assert!(!ProtocolError::ReconstructionMismatch("x".into()).should_reject());
    }

    #[test]
    fn reject_reason_is_truncated() {
        let long = "x".repeat(500);
        assert_eq!(truncate_reject_reason(&long).len(), MAX_REJECT_MESSAGE_LENGTH);
    }
}
