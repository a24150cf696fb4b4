//! Tamper detection by record id.
//!
//! The monitor keeps the last known content digest of every registered record
//! in a keyed map, so registration and verification are O(1) per record.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{LedgerError, Result};
use crate::hash::{hash_value, Digest, HashOutcome};

/// Outcome of the most recent check of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrityStatus {
    /// Content matched the stored digest.
    Verified,
    /// Content differed from the stored digest.
    Tampered,
    /// The stored digest was a degraded identifier, so no comparison is meaningful.
    Unknown,
}

/// Last known state of a registered record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityRecord {
    /// Digest captured at registration.
    pub digest: Digest,
    /// Time of the last registration or verification, Unix milliseconds.
    pub last_verified_at_ms: u64,
    /// Outcome of the last check.
    pub status: IntegrityStatus,
}

/// Result of [`IntegrityMonitor::verify`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityCheck {
    /// Whether the current content matches the stored digest.
    pub verified: bool,
    /// Digest captured at registration.
    pub stored_digest: Digest,
    /// Digest of the content that was just checked.
    pub current_digest: Digest,
}

/// Keyed map from record id to its last known digest.
#[derive(Debug, Default)]
pub struct IntegrityMonitor {
    records: HashMap<String, IntegrityRecord>,
}

impl IntegrityMonitor {
    /// Creates an empty monitor.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores the digest of `record` under `record_id`, replacing any
    /// previous entry.
    pub fn register<T: Serialize + ?Sized>(&mut self, record_id: &str, record: &T) -> Digest {
        self.register_outcome(record_id, hash_value(record))
    }

    /// Stores a digest computed earlier with [`hash_value`].
    pub fn register_outcome(&mut self, record_id: &str, outcome: HashOutcome) -> Digest {
        let status = if outcome.cryptographically_sound {
            IntegrityStatus::Verified
        } else {
            IntegrityStatus::Unknown
        };
        self.records.insert(
            record_id.to_string(),
            IntegrityRecord {
                digest: outcome.digest.clone(),
                last_verified_at_ms: crate::unix_millis(),
                status,
            },
        );
        tracing::debug!(record_id, digest = %outcome.digest, "integrity registered");
        outcome.digest
    }

    /// Compares the digest of `current` against the stored one and records
    /// the outcome.
    pub fn verify<T: Serialize + ?Sized>(
        &mut self,
        record_id: &str,
        current: &T,
    ) -> Result<IntegrityCheck> {
        let entry = self
            .records
            .get_mut(record_id)
            .ok_or_else(|| LedgerError::UnknownRecord {
                record_id: record_id.to_string(),
            })?;
        let outcome = hash_value(current);
        let verified = outcome.cryptographically_sound
            && entry.status != IntegrityStatus::Unknown
            && outcome.digest == entry.digest;
        entry.status = if !outcome.cryptographically_sound || entry.status == IntegrityStatus::Unknown
        {
            IntegrityStatus::Unknown
        } else if verified {
            IntegrityStatus::Verified
        } else {
            IntegrityStatus::Tampered
        };
        entry.last_verified_at_ms = crate::unix_millis();
        if entry.status == IntegrityStatus::Tampered {
            tracing::warn!(record_id, stored = %entry.digest, current = %outcome.digest, "record content changed since registration");
        }
        Ok(IntegrityCheck {
            verified,
            stored_digest: entry.digest.clone(),
            current_digest: outcome.digest,
        })
    }

    /// Returns the stored state for `record_id`.
    pub fn status(&self, record_id: &str) -> Option<&IntegrityRecord> {
        self.records.get(record_id)
    }

    /// Forgets a record.  Entries are never removed any other way.
    pub fn purge(&mut self, record_id: &str) -> Option<IntegrityRecord> {
        self.records.remove(record_id)
    }

    /// Number of registered records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns true when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
