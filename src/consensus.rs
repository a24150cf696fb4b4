//! Simulated majority-vote consensus over record digests.
//!
//! Nothing here is Byzantine fault tolerant.  A fixed set of named nodes each
//! cast one vote through a [`Voter`]; a digest is approved when strictly more
//! than half of the registered nodes vote yes.  A voter that fails counts as
//! a "no" vote, and a digest is only ever voted on once.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::hash::Digest;
use crate::prng::SeededStream;

/// Determines whether a set of boolean votes meets a given threshold.
///
/// # Examples
///
/// ```
/// use memory_ledger::consensus::{consensus, quorum_threshold};
///
/// let votes = [true, false, true];
/// assert!(consensus(&votes, quorum_threshold(votes.len())));
/// assert!(!consensus(&[true, false, true, false], quorum_threshold(4)));
/// ```
pub fn consensus(votes: &[bool], threshold: usize) -> bool {
    let successes = votes.iter().filter(|&&v| v).count();
    successes >= threshold
}

/// Smallest strict majority of `total` nodes.
pub fn quorum_threshold(total: usize) -> usize {
    total / 2 + 1
}

/// Context attached to a consensus request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConsensusPayload {
    /// Record the digest belongs to.
    pub record_id: String,
    /// Content analyzer confidence in `[0, 1]`, when analysis ran.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence_score: Option<f64>,
    /// Analyzer flags.
    #[serde(default)]
    pub flags: Vec<String>,
}

/// Outcome of voting on one digest.  Immutable once stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusResult {
    /// Whether a strict majority voted yes.
    pub achieved: bool,
    /// Number of yes votes.
    pub votes: usize,
    /// Nodes registered when the vote ran.
    pub total_nodes: usize,
    /// Votes that errored and were counted as "no".
    pub faulted: usize,
    /// Block height assigned on approval; the height at the time otherwise.
    pub block_height: u64,
    /// Vote time in Unix milliseconds, zero if never voted.
    pub timestamp_ms: u64,
}

impl ConsensusResult {
    fn not_requested(total_nodes: usize) -> Self {
        Self {
            achieved: false,
            votes: 0,
            total_nodes,
            faulted: 0,
            block_height: 0,
            timestamp_ms: 0,
        }
    }
}

/// Failure raised by a voter.  Always counted as a negative vote.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("vote failed: {0}")]
pub struct VoteError(pub String);

/// Validity function consulted once per node per digest.
pub trait Voter: Send + Sync {
    /// Returns this node's vote on `digest`.
    fn vote(
        &self,
        node_id: &str,
        digest: &Digest,
        payload: &ConsensusPayload,
    ) -> Result<bool, VoteError>;
}

/// Votes yes for any well-formed digest tied to a named record.
#[derive(Debug, Clone, Copy, Default)]
pub struct DigestFormatVoter;

impl Voter for DigestFormatVoter {
    fn vote(
        &self,
        _node_id: &str,
        digest: &Digest,
        payload: &ConsensusPayload,
    ) -> Result<bool, VoteError> {
        Ok(Digest::is_well_formed(digest.as_str()) && !payload.record_id.is_empty())
    }
}

/// Votes on the analyzer's confidence score.
#[derive(Debug, Clone)]
pub struct ConfidenceVoter {
    /// Minimum score for a yes vote.
    pub min_confidence: f64,
    /// Any of these flags forces a no vote.
    pub blocking_flags: Vec<String>,
}

impl ConfidenceVoter {
    /// Creates a voter with no blocking flags.
    pub fn new(min_confidence: f64) -> Self {
        Self {
            min_confidence,
            blocking_flags: Vec::new(),
        }
    }
}

impl Voter for ConfidenceVoter {
    fn vote(
        &self,
        _node_id: &str,
        _digest: &Digest,
        payload: &ConsensusPayload,
    ) -> Result<bool, VoteError> {
        let score = payload
            .confidence_score
            .ok_or_else(|| VoteError("no confidence score in payload".into()))?;
        if !(0.0..=1.0).contains(&score) {
            return Err(VoteError(format!("confidence {score} outside [0, 1]")));
        }
        let blocked = payload
            .flags
            .iter()
            .any(|flag| self.blocking_flags.contains(flag));
        Ok(score >= self.min_confidence && !blocked)
    }
}

/// Pseudo-random voter that is reproducible for a given seed.
#[derive(Debug, Clone, Copy)]
pub struct SeededVoter {
    /// Stream seed.
    pub seed: u64,
    /// Probability of a yes vote.
    pub acceptance: f64,
}

impl Voter for SeededVoter {
    fn vote(
        &self,
        node_id: &str,
        digest: &Digest,
        _payload: &ConsensusPayload,
    ) -> Result<bool, VoteError> {
        let mut stream = SeededStream::for_vote(self.seed, node_id, digest.as_str());
        Ok(stream.next_unit() < self.acceptance)
    }
}

/// Adapts a closure into a [`Voter`].
pub struct FnVoter<F>(pub F);

impl<F> FnVoter<F>
where
    F: Fn(&str, &Digest, &ConsensusPayload) -> Result<bool, VoteError> + Send + Sync,
{
    /// Wraps `f`.
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> Voter for FnVoter<F>
where
    F: Fn(&str, &Digest, &ConsensusPayload) -> Result<bool, VoteError> + Send + Sync,
{
    fn vote(
        &self,
        node_id: &str,
        digest: &Digest,
        payload: &ConsensusPayload,
    ) -> Result<bool, VoteError> {
        (self.0)(node_id, digest, payload)
    }
}

/// Node registry plus memoized vote results.
pub struct ConsensusSimulator {
    nodes: BTreeSet<String>,
    voter: Box<dyn Voter>,
    results: HashMap<Digest, ConsensusResult>,
    block_height: u64,
}

impl fmt::Debug for ConsensusSimulator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsensusSimulator")
            .field("nodes", &self.nodes)
            .field("results", &self.results.len())
            .field("block_height", &self.block_height)
            .finish()
    }
}

impl ConsensusSimulator {
    /// Creates a simulator with no nodes.
    pub fn new(voter: Box<dyn Voter>) -> Self {
        Self {
            nodes: BTreeSet::new(),
            voter,
            results: HashMap::new(),
            block_height: 0,
        }
    }

    /// Adds a node.  Registering the same id twice has no effect.
    pub fn register_node(&mut self, node_id: impl Into<String>) {
        let node_id = node_id.into();
        if self.nodes.insert(node_id.clone()) {
            tracing::debug!(node_id = %node_id, "consensus node registered");
        }
    }

    /// Number of registered nodes.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Height of the last approved digest.
    pub fn block_height(&self) -> u64 {
        self.block_height
    }

    /// Votes on `digest`, or returns the stored result if it was voted on before.
    pub fn request_consensus(
        &mut self,
        digest: &Digest,
        payload: &ConsensusPayload,
    ) -> ConsensusResult {
        if let Some(existing) = self.results.get(digest) {
            tracing::debug!(%digest, "consensus already recorded");
            return existing.clone();
        }

        let mut ballots = Vec::with_capacity(self.nodes.len());
        let mut faulted = 0;
        for node_id in &self.nodes {
            let ballot = match self.voter.vote(node_id, digest, payload) {
                Ok(vote) => vote,
                Err(err) => {
                    tracing::warn!(node_id = %node_id, %digest, error = %err, "vote failed, counted as no");
                    faulted += 1;
                    false
                }
            };
            ballots.push(ballot);
        }

        let total_nodes = ballots.len();
        let votes = ballots.iter().filter(|&&v| v).count();
        let achieved = consensus(&ballots, quorum_threshold(total_nodes));
        if achieved {
            self.block_height += 1;
        }
        let result = ConsensusResult {
            achieved,
            votes,
            total_nodes,
            faulted,
            block_height: self.block_height,
            timestamp_ms: crate::unix_millis(),
        };
        tracing::info!(
            %digest,
            achieved,
            votes,
            total_nodes,
            block_height = self.block_height,
            "consensus round complete"
        );
        self.results.insert(digest.clone(), result.clone());
        result
    }

    /// Forgets the round for `digest`, used when the approved record never
    /// reached the store.
    ///
    /// The block height is given back only if this round produced the latest
    /// height.  When a later round was approved in the meantime the height
    /// stays and the retracted height is left as a gap.
    pub fn retract(&mut self, digest: &Digest) -> Option<ConsensusResult> {
        let result = self.results.remove(digest)?;
        if result.achieved && result.block_height == self.block_height {
            self.block_height -= 1;
        }
        tracing::debug!(%digest, block_height = self.block_height, "consensus round retracted");
        Some(result)
    }

    /// Stored result for `digest`, or a not-achieved placeholder.
    pub fn get_consensus(&self, digest: &Digest) -> ConsensusResult {
        self.results
            .get(digest)
            .cloned()
            .unwrap_or_else(|| ConsensusResult::not_requested(self.nodes.len()))
    }

    /// Stored result for `digest`, if voting has happened.
    pub fn result(&self, digest: &Digest) -> Option<&ConsensusResult> {
        self.results.get(digest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::hash_value;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn payload() -> ConsensusPayload {
        ConsensusPayload {
            record_id: "rec-1".into(),
            ..Default::default()
        }
    }

    fn simulator_with<V: Voter + 'static>(voter: V, nodes: usize) -> ConsensusSimulator {
        let mut sim = ConsensusSimulator::new(Box::new(voter));
        for i in 1..=nodes {
            sim.register_node(format!("node-{i}"));
        }
        sim
    }

    #[test]
    fn test_consensus_threshold() {
        assert!(consensus(&[true, true, false], 2));
        assert!(!consensus(&[true, false, false], 2));
        assert_eq!(quorum_threshold(3), 2);
        assert_eq!(quorum_threshold(4), 3);
        assert_eq!(quorum_threshold(0), 1);
    }

    #[test]
    fn two_of_three_achieves() {
        let voter = FnVoter::new(|node, _, _| Ok(node != "node-3"));
        let mut sim = simulator_with(voter, 3);
        let result = sim.request_consensus(&hash_value("x").digest, &payload());
        assert!(result.achieved);
        assert_eq!(result.votes, 2);
        assert_eq!(result.total_nodes, 3);
        assert_eq!(result.block_height, 1);
    }

    #[test]
    fn even_split_does_not_achieve() {
        let voter = FnVoter::new(|node, _, _| Ok(node == "node-1" || node == "node-2"));
        let mut sim = simulator_with(voter, 4);
        let result = sim.request_consensus(&hash_value("x").digest, &payload());
        assert!(!result.achieved);
        assert_eq!(result.votes, 2);
        assert_eq!(sim.block_height(), 0);
    }

    #[test]
    fn no_nodes_never_achieves() {
        let mut sim = ConsensusSimulator::new(Box::new(DigestFormatVoter));
        let result = sim.request_consensus(&hash_value("x").digest, &payload());
        assert!(!result.achieved);
        assert_eq!(result.total_nodes, 0);
    }

    #[test]
    fn results_are_memoized() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let voter = FnVoter::new(move |_, _, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(true)
        });
        let mut sim = simulator_with(voter, 3);
        let digest = hash_value("x").digest;
        let first = sim.request_consensus(&digest, &payload());
        let second = sim.request_consensus(&digest, &payload());
        assert_eq!(first, second);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(sim.block_height(), 1);

        let other = sim.request_consensus(&hash_value("y").digest, &payload());
        assert_eq!(other.block_height, 2);
    }

    #[test]
    fn failing_votes_count_as_no() {
        let voter = FnVoter::new(|node, _, _| {
            if node == "node-1" {
                Err(VoteError("offline".into()))
            } else {
                Ok(true)
            }
        });
        let mut sim = simulator_with(voter, 3);
        let result = sim.request_consensus(&hash_value("x").digest, &payload());
        assert!(result.achieved);
        assert_eq!(result.votes, 2);
        assert_eq!(result.faulted, 1);

        let always_fail = FnVoter::new(|_, _, _| Err(VoteError("down".into())));
        let mut sim = simulator_with(always_fail, 3);
        let result = sim.request_consensus(&hash_value("x").digest, &payload());
        assert!(!result.achieved);
        assert_eq!(result.faulted, 3);
    }

    #[test]
    fn retract_gives_back_the_latest_height() {
        let mut sim = simulator_with(DigestFormatVoter, 3);
        let first = hash_value("first").digest;
        let second = hash_value("second").digest;
        sim.request_consensus(&first, &payload());
        sim.request_consensus(&second, &payload());
        assert_eq!(sim.block_height(), 2);

        assert_eq!(sim.retract(&second).unwrap().block_height, 2);
        assert_eq!(sim.block_height(), 1);
        assert!(sim.result(&second).is_none());
        assert!(sim.retract(&second).is_none());

        let third = hash_value("third").digest;
        assert_eq!(sim.request_consensus(&third, &payload()).block_height, 2);
        // An older round leaves a gap instead of reusing a live height.
        sim.retract(&first);
        assert_eq!(sim.block_height(), 2);
    }

    #[test]
    fn late_nodes_only_join_new_rounds() {
        let mut sim = simulator_with(DigestFormatVoter, 3);
        let before = sim.request_consensus(&hash_value("x").digest, &payload());
        sim.register_node("node-4");
        assert_eq!(sim.get_consensus(&hash_value("x").digest), before);
        let after = sim.request_consensus(&hash_value("y").digest, &payload());
        assert_eq!(after.total_nodes, 4);
    }

    #[test]
    fn register_node_is_idempotent() {
        let mut sim = ConsensusSimulator::new(Box::new(DigestFormatVoter));
        sim.register_node("a");
        sim.register_node("a");
        assert_eq!(sim.node_count(), 1);
    }

    #[test]
    fn unknown_digest_reports_not_achieved() {
        let sim = simulator_with(DigestFormatVoter, 3);
        let digest = hash_value("never").digest;
        let result = sim.get_consensus(&digest);
        assert!(!result.achieved);
        assert_eq!(result.total_nodes, 3);
        assert!(sim.result(&digest).is_none());
    }

    #[test]
    fn confidence_voter_fails_closed_without_score() {
        let voter = ConfidenceVoter::new(0.5);
        let digest = hash_value("x").digest;
        assert!(voter.vote("n", &digest, &payload()).is_err());
        let mut scored = payload();
        scored.confidence_score = Some(0.7);
        assert_eq!(voter.vote("n", &digest, &scored), Ok(true));
        scored.confidence_score = Some(1.5);
        assert!(voter.vote("n", &digest, &scored).is_err());

        let blocking = ConfidenceVoter {
            min_confidence: 0.5,
            blocking_flags: vec!["synthetic_voice".into()],
        };
        let mut flagged = payload();
        flagged.confidence_score = Some(0.9);
        flagged.flags = vec!["synthetic_voice".into()];
        assert_eq!(blocking.vote("n", &digest, &flagged), Ok(false));
    }

    #[test]
    fn seeded_voter_is_reproducible() {
        let voter = SeededVoter {
            seed: 11,
            acceptance: 0.5,
        };
        let digest = hash_value("x").digest;
        let first: Vec<_> = (0..16)
            .map(|i| voter.vote(&format!("n{i}"), &digest, &payload()).unwrap())
            .collect();
        let second: Vec<_> = (0..16)
            .map(|i| voter.vote(&format!("n{i}"), &digest, &payload()).unwrap())
            .collect();
        assert_eq!(first, second);

        let always = SeededVoter {
            seed: 11,
            acceptance: 1.0,
        };
        let never = SeededVoter {
            seed: 11,
            acceptance: 0.0,
        };
        assert_eq!(always.vote("n", &digest, &payload()), Ok(true));
        assert_eq!(never.vote("n", &digest, &payload()), Ok(false));
    }
}
