#![deny(missing_docs)]

//! # memory_ledger
//!
//! **memory_ledger** is the integrity core behind a memory recording product:
//! recorded memos are hashed, appended to a Merkle tree and put to a
//! simulated vote, then persisted by an external store together with their
//! ledger metadata.  Only stored versions are registered with the tamper
//! monitor.
//!
//! It is a demonstration, not a distributed ledger.  The tree is rebuilt
//! from scratch on every append, consensus is a majority vote among named
//! in-process nodes, locks are process-local, and all state lives in memory.
//!
//! ## Features
//!
//! * **Canonical hashing** via [`hash_value`]: sorted-key JSON, SHA-256, and an
//!   explicit [`HashOutcome::cryptographically_sound`] flag for the degraded path.
//! * **Merkle tree** via [`MerkleTree`]: append, root, depth, inclusion
//!   proofs and the pure [`verify_proof`] check.
//! * **Integrity monitor** via [`IntegrityMonitor`]: O(1) tamper detection by
//!   record id.
//! * **Simulated consensus** via [`ConsensusSimulator`]: strict majority,
//!   memoized per digest, failing voters count as "no".
//! * **Advisory locking** via [`AtomicUpdateCoordinator`]: one in-flight
//!   operation per record id, with a transaction journal.
//! * **Context object** [`MemoryLedger`] wiring the above to a
//!   [`RecordStore`], [`ContentAnalyzer`] and [`EntitlementSource`].
//!
//! ## Usage
//!
//! ```rust
//! use memory_ledger::{verify_proof, MerkleTree};
//!
//! let mut tree = MerkleTree::new();
//! tree.add_leaf("a");
//! let b = tree.add_leaf("b");
//! tree.add_leaf("c");
//!
//! assert_eq!(tree.depth(), 2);
//! let proof = tree.generate_proof(&b.digest).unwrap();
//! assert_eq!(proof.steps.len(), 2);
//! assert!(verify_proof(&b.digest, &proof.steps, tree.root().unwrap()));
//! ```

pub mod collaborators;
pub mod consensus;
pub mod coordinator;
mod config;
mod error;
mod hash;
mod integrity;
mod ledger;
mod merkle;
mod prng;
mod record;

pub use collaborators::{
    ContentAnalysis, ContentAnalyzer, EntitlementSource, FixedAnalyzer, InMemoryStore,
    LedgerAnchor, RecordStore, StaticEntitlements, StoredRecord,
};
pub use config::{LedgerConfig, VoterKind};
pub use consensus::{
    ConfidenceVoter, ConsensusPayload, ConsensusResult, ConsensusSimulator, DigestFormatVoter,
    FnVoter, SeededVoter, VoteError, Voter,
};
pub use coordinator::{AtomicUpdateCoordinator, TransactionRecord, TransactionStatus};
pub use error::{LedgerError, Result};
pub use hash::{
    canonical_bytes, hash_bytes, hash_pair, hash_value, leaf_digest, Digest, HashOutcome,
};
pub use integrity::{IntegrityCheck, IntegrityMonitor, IntegrityRecord, IntegrityStatus};
pub use ledger::{MemoryLedger, SubmissionReceipt, VerificationReport};
pub use merkle::{
    verify_proof, LeafInsert, MerkleLeaf, MerkleNode, MerkleTree, Proof, ProofStep, Side,
};
pub use prng::SeededStream;
pub use record::MemoryRecord;

/// Milliseconds since the Unix epoch, zero if the clock is before it.
pub(crate) fn unix_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
