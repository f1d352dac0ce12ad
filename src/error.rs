//! Error types for the transaction coordinator

use thiserror::Error;

/// Coordinator error type
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Caller credential is missing or expired
    #[error("Identity error: {0}")]
    Identity(String),

    /// Proposal inputs are malformed
    #[error("Invalid proposal: {0}")]
    InvalidProposal(String),

    /// An endorsing peer failed to answer the proposal
    #[error("Endorsement from peer {peer} failed: {reason}")]
    Endorsement { peer: String, reason: String },

    /// An endorsing peer did not answer within its window
    #[error("Endorsement from peer {peer} timed out after {timeout_ms}ms")]
    EndorsementTimeout { peer: String, timeout_ms: u64 },

    /// Ordering service transport failure or non-success status
    #[error("Ordering error: {0}")]
    Ordering(String),

    /// The transaction id was already handed to the ordering service
    #[error("Transaction already submitted for ordering: {0}")]
    DuplicateSubmission(String),

    /// Commit notification registration failed
    #[error("Subscription error: {0}")]
    Subscription(String),

    /// Envelope encoding failed
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Transaction not tracked
    #[error("Transaction not found: {0}")]
    TransactionNotFound(String),

    /// Too many submissions tracked at once
    #[error("Maximum tracked submissions reached: {0}")]
    CapacityExceeded(usize),

    /// Configuration rejected
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
