//! Error taxonomy shared by every ledger component.

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, LedgerError>;

/// Typed failures surfaced to callers.
///
/// Degraded hashing and failed consensus are not errors.  They are reported
/// through [`HashOutcome::cryptographically_sound`](crate::HashOutcome)
/// and [`ConsensusResult::achieved`](crate::ConsensusResult) respectively.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum LedgerError {
    /// A proof was requested from a tree without leaves.
    #[error("merkle tree is empty")]
    EmptyTree,
    /// No leaf carries the requested digest.
    #[error("digest {digest} not found in merkle tree")]
    NotFound {
        /// Digest that was searched for.
        digest: String,
    },
    /// The integrity monitor has never seen this record.
    #[error("record {record_id} is not registered with the integrity monitor")]
    UnknownRecord {
        /// Identifier of the unregistered record.
        record_id: String,
    },
    /// Another operation currently holds the record's advisory lock.
    #[error("record {record_id} is locked by an in-flight transaction")]
    LockHeld {
        /// Identifier of the locked record.
        record_id: String,
    },
    /// The external store rejected or failed an operation.
    #[error("persistence failure: {0}")]
    Persistence(String),
    /// A collaborator call exceeded its deadline.
    #[error("{operation} timed out after {timeout_ms} ms")]
    Timeout {
        /// Name of the operation that timed out.
        operation: &'static str,
        /// Deadline that was exceeded.
        timeout_ms: u64,
    },
    /// A record failed schema validation at the boundary.
    #[error("invalid record: {0}")]
    InvalidRecord(String),
    /// The user lacks the entitlement required for a feature.
    #[error("user {user_id} is not entitled to {feature}")]
    NotEntitled {
        /// User whose entitlement was checked.
        user_id: String,
        /// Feature that was requested.
        feature: String,
    },
    /// Configuration could not be loaded or failed validation.
    #[error("config error: {0}")]
    Config(String),
    /// A serialized proof document could not be decoded.
    #[error("malformed proof: {0}")]
    Proof(String),
}
