//! Boundaries to the services the ledger depends on but does not own.
//!
//! The record store, content analyzer and entitlement check are expressed as
//! object-safe async traits so a deployment can plug in real services while
//! tests and the CLI use the in-memory implementations below.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::{LedgerError, Result};
use crate::hash::Digest;
use crate::record::MemoryRecord;

/// Ledger metadata attached to a persisted record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerAnchor {
    /// Leaf digest appended to the Merkle tree.
    pub leaf_digest: Digest,
    /// Nonce-free digest registered with the integrity monitor.
    pub content_digest: Digest,
    /// Tree root right after the leaf was appended.
    pub merkle_root: Digest,
    /// Whether simulated consensus approved the leaf.
    pub consensus_achieved: bool,
    /// Block height reported by the consensus round.
    pub block_height: u64,
}

/// A record as held by the external store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    /// Authoritative record content.
    pub record: MemoryRecord,
    /// Metadata added by the ledger.
    pub anchor: LedgerAnchor,
}

/// Output of a content analysis service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentAnalysis {
    /// Confidence in `[0, 1]` that the content is authentic.
    pub confidence_score: f64,
    /// Free-form findings.
    #[serde(default)]
    pub flags: Vec<String>,
}

/// Persistent record store.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Inserts or replaces a record and returns what was stored.
    async fn insert(&self, record: StoredRecord) -> Result<StoredRecord>;

    /// Fetches the current copy of a record, `None` if absent.
    async fn fetch(&self, record_id: &str) -> Result<Option<StoredRecord>>;
}

/// Black-box authenticity scoring.
#[async_trait]
pub trait ContentAnalyzer: Send + Sync {
    /// Scores `content`.
    async fn analyze(&self, content: &str) -> Result<ContentAnalysis>;
}

/// Subscription check.
#[async_trait]
pub trait EntitlementSource: Send + Sync {
    /// Returns true if `user_id` may use `feature`.
    async fn is_entitled(&self, user_id: &str, feature: &str) -> Result<bool>;
}

/// Store backed by a process-local map.  Contents are lost on restart.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    records: RwLock<HashMap<String, StoredRecord>>,
}

impl InMemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies `edit` to a stored record in place, bypassing the ledger.
    /// Used to simulate out-of-band tampering.
    pub async fn tamper<F>(&self, record_id: &str, edit: F) -> Result<()>
    where
        F: FnOnce(&mut MemoryRecord) + Send,
    {
        let mut records = self.records.write().await;
        let stored = records
            .get_mut(record_id)
            .ok_or_else(|| LedgerError::Persistence(format!("no record {record_id}")))?;
        edit(&mut stored.record);
        Ok(())
    }

    /// Number of stored records.
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    /// Returns true when the store is empty.
    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl RecordStore for InMemoryStore {
    async fn insert(&self, record: StoredRecord) -> Result<StoredRecord> {
        self.records
            .write()
            .await
            .insert(record.record.id.clone(), record.clone());
        Ok(record)
    }

    async fn fetch(&self, record_id: &str) -> Result<Option<StoredRecord>> {
        Ok(self.records.read().await.get(record_id).cloned())
    }
}

/// Analyzer that returns the same score for every input.
#[derive(Debug, Clone)]
pub struct FixedAnalyzer {
    /// Score returned for every call.
    pub confidence_score: f64,
    /// Flags returned for every call.
    pub flags: Vec<String>,
}

impl FixedAnalyzer {
    /// Creates an analyzer with no flags.
    pub fn new(confidence_score: f64) -> Self {
        Self {
            confidence_score,
            flags: Vec::new(),
        }
    }
}

#[async_trait]
impl ContentAnalyzer for FixedAnalyzer {
    async fn analyze(&self, content: &str) -> Result<ContentAnalysis> {
        let mut flags = self.flags.clone();
        if content.trim().is_empty() {
            flags.push("empty_content".into());
        }
        Ok(ContentAnalysis {
            confidence_score: self.confidence_score,
            flags,
        })
    }
}

/// Entitlements from a fixed grant list.
#[derive(Debug, Clone, Default)]
pub struct StaticEntitlements {
    allow_all: bool,
    grants: HashSet<(String, String)>,
}

impl StaticEntitlements {
    /// Grants every feature to every user.
    pub fn allow_all() -> Self {
        Self {
            allow_all: true,
            grants: HashSet::new(),
        }
    }

    /// Grants nothing.
    pub fn deny_all() -> Self {
        Self::default()
    }

    /// Adds one `(user, feature)` grant.
    pub fn grant(mut self, user_id: impl Into<String>, feature: impl Into<String>) -> Self {
        self.grants.insert((user_id.into(), feature.into()));
        self
    }
}

#[async_trait]
impl EntitlementSource for StaticEntitlements {
    async fn is_entitled(&self, user_id: &str, feature: &str) -> Result<bool> {
        Ok(self.allow_all
            || self
                .grants
                .contains(&(user_id.to_string(), feature.to_string())))
    }
}
