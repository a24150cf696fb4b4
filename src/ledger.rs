//! The ledger context object.
//!
//! [`MemoryLedger`] owns one Merkle tree, one integrity monitor, one
//! consensus simulator and one lock coordinator, and is handed to whatever
//! needs them.  Build several for independent test fixtures.
//!
//! Every mutation runs inside [`AtomicUpdateCoordinator::run_exclusive`]
//! keyed by record id.  The tree is shared by all records, so appends also
//! take a tree-wide lock; leaf order is therefore the order in which appends
//! complete.  Nothing is persisted by the ledger itself: a restart loses the
//! tree, the integrity map and all consensus results.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::collaborators::{
    ContentAnalysis, ContentAnalyzer, EntitlementSource, FixedAnalyzer, InMemoryStore,
    LedgerAnchor, RecordStore, StaticEntitlements, StoredRecord,
};
use crate::config::LedgerConfig;
use crate::consensus::{ConsensusPayload, ConsensusResult, ConsensusSimulator};
use crate::coordinator::{AtomicUpdateCoordinator, TransactionRecord};
use crate::error::{LedgerError, Result};
use crate::hash::{hash_value, leaf_digest, Digest};
use crate::integrity::{IntegrityCheck, IntegrityMonitor, IntegrityRecord};
use crate::merkle::{LeafInsert, MerkleTree, Proof};
use crate::record::MemoryRecord;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Consensus round that is retracted unless the record it approves is stored.
struct PendingRound<'a> {
    consensus: &'a Mutex<ConsensusSimulator>,
    digest: Digest,
    result: ConsensusResult,
    settled: bool,
}

impl<'a> PendingRound<'a> {
    fn open(
        consensus: &'a Mutex<ConsensusSimulator>,
        digest: &Digest,
        payload: &ConsensusPayload,
    ) -> Self {
        let result = lock(consensus).request_consensus(digest, payload);
        Self {
            consensus,
            digest: digest.clone(),
            result,
            settled: false,
        }
    }

    fn commit(mut self) {
        self.settled = true;
    }
}

impl Drop for PendingRound<'_> {
    fn drop(&mut self) {
        if !self.settled {
            lock(self.consensus).retract(&self.digest);
        }
    }
}

/// What [`MemoryLedger::submit`] hands back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmissionReceipt {
    /// Transaction that performed the submission.
    pub transaction_id: Uuid,
    /// Submitted record.
    pub record_id: String,
    /// Insertion index of the leaf.
    pub leaf_index: usize,
    /// Leaf digest (content plus insertion nonce).
    pub leaf_digest: Digest,
    /// Nonce-free content digest used for tamper checks.
    pub content_digest: Digest,
    /// Root right after the append.
    pub merkle_root: Digest,
    /// Consensus outcome for the leaf digest.
    pub consensus: ConsensusResult,
    /// Content analysis, when the user is entitled to it and it succeeded.
    pub analysis: Option<ContentAnalysis>,
    /// `false` if the leaf digest is a degraded identifier.
    pub cryptographically_sound: bool,
}

/// What [`MemoryLedger::verify`] hands back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationReport {
    /// Checked record.
    pub record_id: String,
    /// Content comparison against the registered digest.
    pub integrity: IntegrityCheck,
    /// Inclusion proof of the persisted leaf digest, if the leaf is in the tree.
    pub proof: Option<Proof>,
    /// Whether `proof` re-derives the current root.
    pub included: bool,
    /// Consensus recorded for the leaf digest.
    pub consensus: ConsensusResult,
    /// Content unchanged and leaf included.
    pub verified: bool,
}

/// Shared state and collaborators for the memory verification pipeline.
pub struct MemoryLedger {
    config: LedgerConfig,
    coordinator: AtomicUpdateCoordinator,
    tree: Mutex<MerkleTree>,
    monitor: Mutex<IntegrityMonitor>,
    consensus: Mutex<ConsensusSimulator>,
    store: Arc<dyn RecordStore>,
    analyzer: Arc<dyn ContentAnalyzer>,
    entitlements: Arc<dyn EntitlementSource>,
}

impl std::fmt::Debug for MemoryLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryLedger")
            .field("config", &self.config)
            .field("leaves", &lock(&self.tree).len())
            .finish_non_exhaustive()
    }
}

impl MemoryLedger {
    /// Wires a ledger to its collaborators.
    pub fn new(
        config: LedgerConfig,
        store: Arc<dyn RecordStore>,
        analyzer: Arc<dyn ContentAnalyzer>,
        entitlements: Arc<dyn EntitlementSource>,
    ) -> Result<Self> {
        config.validate()?;
        let mut consensus = ConsensusSimulator::new(config.build_voter());
        for node in &config.nodes {
            consensus.register_node(node.clone());
        }
        Ok(Self {
            config,
            coordinator: AtomicUpdateCoordinator::new(),
            tree: Mutex::new(MerkleTree::new()),
            monitor: Mutex::new(IntegrityMonitor::new()),
            consensus: Mutex::new(consensus),
            store,
            analyzer,
            entitlements,
        })
    }

    /// Ledger over an [`InMemoryStore`], a fixed analyzer score of `0.9`
    /// and allow-all entitlements.  The store is returned for inspection.
    pub fn in_memory(config: LedgerConfig) -> Result<(Self, Arc<InMemoryStore>)> {
        let store = Arc::new(InMemoryStore::new());
        let ledger = Self::new(
            config,
            store.clone(),
            Arc::new(FixedAnalyzer::new(0.9)),
            Arc::new(StaticEntitlements::allow_all()),
        )?;
        Ok((ledger, store))
    }

    /// Active configuration.
    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    /// Hashes, appends, votes on and persists `record`, then registers it
    /// for tamper checks.
    ///
    /// If the store rejects the record or times out, the consensus round is
    /// retracted and the integrity entry of the previously stored version is
    /// left untouched.  The leaf stays in the tree.
    pub async fn submit(&self, record: MemoryRecord) -> Result<SubmissionReceipt> {
        record.validate()?;
        let record_id = record.id.clone();
        self.coordinator
            .run_exclusive(&record_id, |transaction_id| async move {
                // Only the leaf digest enters the tree; the record itself stays
                // with the store.
                let (leaf, merkle_root) = {
                    let mut tree = lock(&self.tree);
                    let nonce = rand::random::<u64>();
                    let outcome = leaf_digest(&record, nonce, crate::unix_millis());
                    let index = tree.add_leaf_digest(outcome.digest.clone());
                    let root = tree.root().cloned().ok_or(LedgerError::EmptyTree)?;
                    let leaf = LeafInsert {
                        index,
                        digest: outcome.digest,
                        cryptographically_sound: outcome.cryptographically_sound,
                    };
                    (leaf, root)
                };
                let content = hash_value(&record);

                let analysis = self.analyze_if_entitled(&record).await;
                let payload = ConsensusPayload {
                    record_id: record.id.clone(),
                    confidence_score: analysis.as_ref().map(|a| a.confidence_score),
                    flags: analysis
                        .as_ref()
                        .map(|a| a.flags.clone())
                        .unwrap_or_default(),
                };
                let round = PendingRound::open(&self.consensus, &leaf.digest, &payload);
                let consensus = round.result.clone();

                let stored = StoredRecord {
                    record,
                    anchor: LedgerAnchor {
                        leaf_digest: leaf.digest.clone(),
                        content_digest: content.digest.clone(),
                        merkle_root: merkle_root.clone(),
                        consensus_achieved: consensus.achieved,
                        block_height: consensus.block_height,
                    },
                };
                // An error or a dropped future retracts the round, and the
                // monitor keeps whatever it held for the last stored version.
                let stored = self.persist(stored).await?;
                round.commit();
                let content_digest =
                    lock(&self.monitor).register_outcome(&stored.record.id, content);
                tracing::info!(
                    record_id = %stored.record.id,
                    %transaction_id,
                    leaf = %leaf.digest,
                    root = %merkle_root,
                    consensus = consensus.achieved,
                    "record submitted"
                );
                Ok(SubmissionReceipt {
                    transaction_id,
                    record_id: stored.record.id,
                    leaf_index: leaf.index,
                    leaf_digest: leaf.digest,
                    content_digest,
                    merkle_root,
                    consensus,
                    analysis,
                    cryptographically_sound: leaf.cryptographically_sound,
                })
            })
            .await
    }

    /// Fetches the current copy of `record_id` and checks it against the
    /// registered digest and the tree.
    pub async fn verify(&self, record_id: &str) -> Result<VerificationReport> {
        if lock(&self.monitor).status(record_id).is_none() {
            return Err(LedgerError::UnknownRecord {
                record_id: record_id.to_string(),
            });
        }
        self.coordinator
            .run_exclusive(record_id, |_| async move {
                let stored = self.fetch(record_id).await?.ok_or_else(|| {
                    LedgerError::Persistence(format!("record {record_id} missing from store"))
                })?;
                let integrity = lock(&self.monitor).verify(record_id, &stored.record)?;
                let proof = match lock(&self.tree).generate_proof(&stored.anchor.leaf_digest) {
                    Ok(proof) => Some(proof),
                    Err(LedgerError::NotFound { .. }) | Err(LedgerError::EmptyTree) => None,
                    Err(err) => return Err(err),
                };
                let included = proof.as_ref().is_some_and(Proof::verify);
                let consensus = lock(&self.consensus).get_consensus(&stored.anchor.leaf_digest);
                let verified = integrity.verified && included;
                tracing::info!(record_id, verified, included, "record verified");
                Ok(VerificationReport {
                    record_id: record_id.to_string(),
                    integrity,
                    proof,
                    included,
                    consensus,
                    verified,
                })
            })
            .await
    }

    /// Runs content analysis on the stored copy of `record_id` for its owner.
    ///
    /// Unlike the best-effort analysis inside [`submit`](Self::submit), a
    /// missing entitlement is an error here.
    pub async fn analyze(&self, record_id: &str) -> Result<ContentAnalysis> {
        let stored = self.fetch(record_id).await?.ok_or_else(|| LedgerError::UnknownRecord {
            record_id: record_id.to_string(),
        })?;
        let user_id = &stored.record.user_id;
        let feature = &self.config.advanced_feature;
        if !self.entitlements.is_entitled(user_id, feature).await? {
            return Err(LedgerError::NotEntitled {
                user_id: user_id.clone(),
                feature: feature.clone(),
            });
        }
        self.analyzer
            .analyze(&stored.record.analyzable_content())
            .await
    }

    /// Drops the integrity entry of a deleted record.
    pub async fn purge(&self, record_id: &str) -> Result<Option<IntegrityRecord>> {
        self.coordinator
            .run_exclusive(record_id, |_| async move {
                Ok(lock(&self.monitor).purge(record_id))
            })
            .await
    }

    /// Inclusion proof for a leaf digest.
    pub fn proof(&self, digest: &Digest) -> Result<Proof> {
        lock(&self.tree).generate_proof(digest)
    }

    /// Current tree root.
    pub fn root(&self) -> Option<Digest> {
        lock(&self.tree).root().cloned()
    }

    /// Number of leaves in the tree.
    pub fn leaf_count(&self) -> usize {
        lock(&self.tree).len()
    }

    /// Depth of the tree.
    pub fn tree_depth(&self) -> usize {
        lock(&self.tree).depth()
    }

    /// Integrity state of a record.
    pub fn integrity_status(&self, record_id: &str) -> Option<IntegrityRecord> {
        lock(&self.monitor).status(record_id).cloned()
    }

    /// Consensus recorded for a leaf digest.
    pub fn consensus_for(&self, digest: &Digest) -> ConsensusResult {
        lock(&self.consensus).get_consensus(digest)
    }

    /// Adds a consensus node.
    ///
    /// This is a setup call.  The node set is shared by every record and is
    /// not guarded by the per-record coordinator, so a node added while
    /// submissions are in flight may or may not take part in their rounds.
    /// Recorded results keep their original `total_nodes`.
    pub fn register_node(&self, node_id: impl Into<String>) {
        lock(&self.consensus).register_node(node_id);
    }

    /// Transaction journal, oldest first.
    pub fn transactions(&self) -> Vec<TransactionRecord> {
        self.coordinator.transactions()
    }

    /// Returns true while an operation holds the lock for `record_id`.
    pub fn is_locked(&self, record_id: &str) -> bool {
        self.coordinator.is_locked(record_id)
    }

    async fn analyze_if_entitled(&self, record: &MemoryRecord) -> Option<ContentAnalysis> {
        let feature = &self.config.advanced_feature;
        match self.entitlements.is_entitled(&record.user_id, feature).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(user_id = %record.user_id, feature = %feature, "analysis skipped, not entitled");
                return None;
            }
            Err(err) => {
                tracing::warn!(user_id = %record.user_id, error = %err, "entitlement check failed, analysis skipped");
                return None;
            }
        }
        match self.analyzer.analyze(&record.analyzable_content()).await {
            Ok(analysis) => Some(analysis),
            Err(err) => {
                tracing::warn!(record_id = %record.id, error = %err, "content analysis failed");
                None
            }
        }
    }

    async fn persist(&self, stored: StoredRecord) -> Result<StoredRecord> {
        let timeout = self.config.persistence_timeout();
        tokio::time::timeout(timeout, self.store.insert(stored))
            .await
            .map_err(|_| LedgerError::Timeout {
                operation: "store insert",
                timeout_ms: self.config.persistence_timeout_ms,
            })?
    }

    async fn fetch(&self, record_id: &str) -> Result<Option<StoredRecord>> {
        let timeout = self.config.persistence_timeout();
        tokio::time::timeout(timeout, self.store.fetch(record_id))
            .await
            .map_err(|_| LedgerError::Timeout {
                operation: "store fetch",
                timeout_ms: self.config.persistence_timeout_ms,
            })?
    }
}
