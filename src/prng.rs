//! Seeded pseudorandom stream used by simulated voters.
//!
//! Output is a domain-separated BLAKE2b-256 expansion of a 32-byte seed and
//! a block counter, so the same `(seed, node, digest)` triple always yields
//! the same vote on every platform and across restarts.

use blake2::digest::{consts::U32, Digest};

type Blake2b256 = blake2::Blake2b<U32>;

const STREAM_DOMAIN: &[u8] = b"MEMLEDGER_STREAM";
const VOTE_DOMAIN: &[u8] = b"MEMLEDGER_VOTE";

/// Deterministic byte stream derived from BLAKE2b-256.
#[derive(Debug, Clone)]
pub struct SeededStream {
    seed: [u8; 32],
    counter: u64,
    buffer: [u8; 32],
    offset: usize,
}

impl SeededStream {
    /// Creates a stream keyed to one node's vote on one digest.
    pub fn for_vote(seed: u64, node_id: &str, digest: &str) -> Self {
        let mut hasher = Blake2b256::new();
        hasher.update(VOTE_DOMAIN);
        hasher.update(seed.to_be_bytes());
        hasher.update((node_id.len() as u64).to_be_bytes());
        hasher.update(node_id.as_bytes());
        hasher.update((digest.len() as u64).to_be_bytes());
        hasher.update(digest.as_bytes());
        let mut base = [0u8; 32];
        base.copy_from_slice(&hasher.finalize());
        Self::from_seed_bytes(base)
    }

    fn from_seed_bytes(seed: [u8; 32]) -> Self {
        Self {
            seed,
            counter: 0,
            buffer: [0u8; 32],
            offset: 32,
        }
    }

    fn refill(&mut self) {
        let mut hasher = Blake2b256::new();
        hasher.update(STREAM_DOMAIN);
        hasher.update(self.seed);
        hasher.update(self.counter.to_be_bytes());
        self.buffer.copy_from_slice(&hasher.finalize());
        self.counter = self.counter.wrapping_add(1);
        self.offset = 0;
    }

    /// Returns the next 64-bit value.
    pub fn next_u64(&mut self) -> u64 {
        if self.offset >= self.buffer.len() {
            self.refill();
        }
        let mut chunk = [0u8; 8];
        chunk.copy_from_slice(&self.buffer[self.offset..self.offset + 8]);
        self.offset += 8;
        u64::from_be_bytes(chunk)
    }

    /// Returns a value uniformly distributed in `[0, 1)`.
    pub fn next_unit(&mut self) -> f64 {
        // 53 high bits fill an f64 mantissa exactly.
        (self.next_u64() >> 11) as f64 / (1u64 << 53) as f64
    }
}
