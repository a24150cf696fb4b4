use std::collections::BTreeMap;

use memory_ledger::{
    hash_value, verify_proof, ConsensusPayload, ConsensusSimulator, Digest, FnVoter,
    IntegrityMonitor, MerkleTree,
};
use proptest::prelude::*;

fn digests(values: &[u64]) -> Vec<Digest> {
    values.iter().map(|v| hash_value(v).digest).collect()
}

fn flip_hex(digest: &Digest, position: usize) -> Digest {
    let mut chars: Vec<char> = digest.as_str().chars().collect();
    let idx = position % chars.len();
    chars[idx] = if chars[idx] == 'a' { 'b' } else { 'a' };
    Digest::parse(&chars.into_iter().collect::<String>()).unwrap()
}

proptest! {
    #[test]
    fn hashing_is_deterministic(map in proptest::collection::btree_map(".{0,8}", any::<i64>(), 0..8)) {
        let first = hash_value(&map);
        let second = hash_value(&map.clone());
        prop_assert!(first.cryptographically_sound);
        prop_assert_eq!(first, second);
    }

    #[test]
    fn root_depends_only_on_leaf_order(values in proptest::collection::vec(any::<u64>(), 1..40)) {
        let a = MerkleTree::from_digests(digests(&values));
        let mut b = MerkleTree::new();
        for digest in digests(&values) {
            b.add_leaf_digest(digest);
        }
        prop_assert_eq!(a.root(), b.root());
        let expected_depth = (values.len() as f64).log2().ceil() as usize;
        prop_assert_eq!(a.depth(), expected_depth);
    }

    #[test]
    fn every_leaf_round_trips(values in proptest::collection::btree_set(any::<u64>(), 1..40)) {
        let values: Vec<u64> = values.into_iter().collect();
        let tree = MerkleTree::from_digests(digests(&values));
        let root = tree.root().unwrap().clone();
        for digest in digests(&values) {
            let proof = tree.generate_proof(&digest).unwrap();
            prop_assert!(verify_proof(&digest, &proof.steps, &root));
        }
    }

    #[test]
    fn single_character_mutations_are_rejected(
        values in proptest::collection::btree_set(any::<u64>(), 2..30),
        pick in any::<usize>(),
        position in 0usize..64,
    ) {
        let values: Vec<u64> = values.into_iter().collect();
        let all = digests(&values);
        let target = all[pick % all.len()].clone();
        let tree = MerkleTree::from_digests(all);
        let root = tree.root().unwrap().clone();
        let proof = tree.generate_proof(&target).unwrap();
        prop_assert!(!verify_proof(&flip_hex(&target, position), &proof.steps, &root));
        for i in 0..proof.steps.len() {
            let mut steps = proof.steps.clone();
            steps[i].sibling = flip_hex(&steps[i].sibling, position);
            prop_assert!(!verify_proof(&target, &steps, &root));
        }
    }

    #[test]
    fn integrity_detects_any_change(a in ".{0,32}", b in ".{0,32}") {
        let mut monitor = IntegrityMonitor::new();
        let mut original = BTreeMap::new();
        original.insert("transcript", a.clone());
        monitor.register("r", &original);
        prop_assert!(monitor.verify("r", &original).unwrap().verified);
        let mut changed = BTreeMap::new();
        changed.insert("transcript", b.clone());
        prop_assert_eq!(monitor.verify("r", &changed).unwrap().verified, a == b);
    }

    #[test]
    fn consensus_requires_strict_majority(total in 1usize..12, yes in 0usize..12) {
        let yes = yes.min(total);
        let voter = FnVoter::new(move |node: &str, _, _| {
            let idx: usize = node.trim_start_matches('n').parse().unwrap_or(usize::MAX);
            Ok(idx < yes)
        });
        let mut sim = ConsensusSimulator::new(Box::new(voter));
        for i in 0..total {
            sim.register_node(format!("n{i}"));
        }
        let payload = ConsensusPayload { record_id: "r".into(), ..Default::default() };
        let result = sim.request_consensus(&hash_value(&(total, yes)).digest, &payload);
        prop_assert_eq!(result.votes, yes);
        prop_assert_eq!(result.achieved, 2 * yes > total);
    }
}
