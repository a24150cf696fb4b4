//! Append-only Merkle tree over record digests.
//!
//! Every append rebuilds the full node graph from the leaf list, so an insert
//! costs O(n) and `n` inserts cost O(n^2).  At each level a trailing node
//! without a sibling is paired with a copy of itself.  Roots depend on both
//! behaviours.  Neither is suitable for an adversarial ledger.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{LedgerError, Result};
use crate::hash::{hash_pair, leaf_digest, Digest};

/// Node of the tree.  The tree exclusively owns its node graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MerkleNode {
    /// Wraps exactly one leaf digest.
    Leaf {
        /// Leaf digest.
        digest: Digest,
        /// Insertion index of the leaf.
        index: usize,
    },
    /// Digest of the concatenation of its children's digests.
    Internal {
        /// Combined digest.
        digest: Digest,
        /// Left child.
        left: Box<MerkleNode>,
        /// Right child (a copy of `left` when the level had no partner).
        right: Box<MerkleNode>,
    },
}

impl MerkleNode {
    /// Digest carried by this node.
    pub fn digest(&self) -> &Digest {
        match self {
            Self::Leaf { digest, .. } | Self::Internal { digest, .. } => digest,
        }
    }

    fn height(&self) -> usize {
        match self {
            Self::Leaf { .. } => 0,
            Self::Internal { left, .. } => 1 + left.height(),
        }
    }
}

/// Leaf as stored in insertion order.
#[derive(Debug, Clone, PartialEq)]
pub struct MerkleLeaf {
    /// Leaf digest.
    pub digest: Digest,
    /// Originating payload, when the leaf was added from a value.
    pub payload: Option<Value>,
}

/// Which side of the running hash a sibling sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    /// Sibling is hashed before the running digest.
    Left,
    /// Sibling is hashed after the running digest.
    Right,
}

/// One sibling encountered while walking from a leaf to the root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofStep {
    /// Position of the sibling relative to the running digest.
    pub side: Side,
    /// Sibling digest.
    pub sibling: Digest,
}

/// Inclusion proof for a single leaf.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proof {
    /// Root the proof was generated against.
    pub root: Digest,
    /// Leaf digest being proven.
    pub leaf: Digest,
    /// Insertion index of the proven leaf.
    pub index: usize,
    /// Steps ordered from the leaf up to the root.
    pub steps: Vec<ProofStep>,
}

impl Proof {
    /// Checks the proof against the root it carries.
    pub fn verify(&self) -> bool {
        verify_proof(&self.leaf, &self.steps, &self.root)
    }

    /// Serialises the proof to pretty JSON.
    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|err| LedgerError::Proof(err.to_string()))
    }

    /// Parses a proof previously emitted by [`Proof::to_json_string`].
    pub fn from_json_str(input: &str) -> Result<Self> {
        serde_json::from_str(input).map_err(|err| LedgerError::Proof(err.to_string()))
    }
}

/// Result of appending a payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafInsert {
    /// Insertion index of the new leaf.
    pub index: usize,
    /// Leaf digest.
    pub digest: Digest,
    /// `false` when the payload could not be canonicalized.
    pub cryptographically_sound: bool,
}

/// Binary hash tree whose leaf order is insertion order.
#[derive(Debug, Clone, Default)]
pub struct MerkleTree {
    leaves: Vec<MerkleLeaf>,
    root: Option<MerkleNode>,
}

impl MerkleTree {
    /// Creates an empty tree.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a tree from pre-computed digests in order.
    pub fn from_digests<I>(digests: I) -> Self
    where
        I: IntoIterator<Item = Digest>,
    {
        let leaves: Vec<MerkleLeaf> = digests
            .into_iter()
            .map(|digest| MerkleLeaf {
                digest,
                payload: None,
            })
            .collect();
        let root = build(&leaves);
        Self { leaves, root }
    }

    /// Hashes `payload` with a fresh nonce and timestamp, appends the digest
    /// and rebuilds.
    pub fn add_leaf<T: Serialize + ?Sized>(&mut self, payload: &T) -> LeafInsert {
        let nonce = rand::random::<u64>();
        let outcome = leaf_digest(payload, nonce, crate::unix_millis());
        let index = self.push(MerkleLeaf {
            digest: outcome.digest.clone(),
            payload: serde_json::to_value(payload).ok(),
        });
        LeafInsert {
            index,
            digest: outcome.digest,
            cryptographically_sound: outcome.cryptographically_sound,
        }
    }

    /// Appends an already computed digest and rebuilds.  Returns the index.
    pub fn add_leaf_digest(&mut self, digest: Digest) -> usize {
        self.push(MerkleLeaf {
            digest,
            payload: None,
        })
    }

    fn push(&mut self, leaf: MerkleLeaf) -> usize {
        self.leaves.push(leaf);
        // The previous root stays readable until the new graph is complete.
        let root = build(&self.leaves);
        self.root = root;
        tracing::debug!(leaves = self.leaves.len(), "merkle tree rebuilt");
        self.leaves.len() - 1
    }

    /// Current root digest, `None` for an empty tree.
    pub fn root(&self) -> Option<&Digest> {
        self.root.as_ref().map(MerkleNode::digest)
    }

    /// Root node of the graph.
    pub fn root_node(&self) -> Option<&MerkleNode> {
        self.root.as_ref()
    }

    /// Number of internal levels above the leaves: `ceil(log2(n))`.
    pub fn depth(&self) -> usize {
        self.root.as_ref().map_or(0, MerkleNode::height)
    }

    /// Number of leaves.
    pub fn len(&self) -> usize {
        self.leaves.len()
    }

    /// Returns true when no leaf has been added.
    pub fn is_empty(&self) -> bool {
        self.leaves.is_empty()
    }

    /// Leaves in insertion order.
    pub fn leaves(&self) -> &[MerkleLeaf] {
        &self.leaves
    }

    /// Returns true if some leaf carries `digest`.
    pub fn contains(&self, digest: &Digest) -> bool {
        self.leaves.iter().any(|leaf| &leaf.digest == digest)
    }

    /// Produces an inclusion proof for the first leaf (lowest index) whose
    /// digest equals `target`.
    pub fn generate_proof(&self, target: &Digest) -> Result<Proof> {
        let root = self.root.as_ref().ok_or(LedgerError::EmptyTree)?;
        let mut steps = Vec::new();
        let index = find_path(root, target, &mut steps).ok_or_else(|| LedgerError::NotFound {
            digest: target.to_string(),
        })?;
        Ok(Proof {
            root: root.digest().clone(),
            leaf: target.clone(),
            index,
            steps,
        })
    }
}

fn build(leaves: &[MerkleLeaf]) -> Option<MerkleNode> {
    let mut level: Vec<MerkleNode> = leaves
        .iter()
        .enumerate()
        .map(|(index, leaf)| MerkleNode::Leaf {
            digest: leaf.digest.clone(),
            index,
        })
        .collect();
    while level.len() > 1 {
        let mut next = Vec::with_capacity((level.len() + 1) / 2);
        let mut nodes = level.into_iter();
        while let Some(left) = nodes.next() {
            let right = match nodes.next() {
                Some(right) => right,
                None => left.clone(),
            };
            next.push(MerkleNode::Internal {
                digest: hash_pair(left.digest(), right.digest()),
                left: Box::new(left),
                right: Box::new(right),
            });
        }
        level = next;
    }
    level.pop()
}

// Left subtree is searched first, so the lowest insertion index wins and a
// duplicated trailing node is never preferred over its original.
fn find_path(node: &MerkleNode, target: &Digest, steps: &mut Vec<ProofStep>) -> Option<usize> {
    match node {
        MerkleNode::Leaf { digest, index } => (digest == target).then_some(*index),
        MerkleNode::Internal { left, right, .. } => {
            if let Some(index) = find_path(left, target, steps) {
                steps.push(ProofStep {
                    side: Side::Right,
                    sibling: right.digest().clone(),
                });
                return Some(index);
            }
            if let Some(index) = find_path(right, target, steps) {
                steps.push(ProofStep {
                    side: Side::Left,
                    sibling: left.digest().clone(),
                });
                return Some(index);
            }
            None
        }
    }
}

/// Re-derives a root from `target` and `steps` and compares it with
/// `expected_root`.
pub fn verify_proof(target: &Digest, steps: &[ProofStep], expected_root: &Digest) -> bool {
    let mut running = target.clone();
    for step in steps {
        running = match step.side {
            Side::Left => hash_pair(&step.sibling, &running),
            Side::Right => hash_pair(&running, &step.sibling),
        };
    }
    &running == expected_root
}
