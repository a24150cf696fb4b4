//! Deterministic content hashing for structured records.
//!
//! Values are lowered to JSON, object keys are emitted in sorted order and the
//! resulting bytes are hashed with SHA-256.  A value that cannot be lowered
//! still receives an identifier, but the outcome is flagged as unsound so the
//! caller can tell a degraded digest from a real one.

use std::fmt;
use std::str::FromStr;

use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest as _, Sha256};

use crate::error::LedgerError;

/// Length in hex characters of every digest produced by this module.
pub const DIGEST_HEX_LEN: usize = 64;

/// Lower-case hex SHA-256 digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest(String);

impl Digest {
    /// Parses a digest, accepting either case but storing lower-case.
    pub fn parse(input: &str) -> Result<Self, LedgerError> {
        let trimmed = input.trim();
        if trimmed.len() != DIGEST_HEX_LEN {
            return Err(LedgerError::Proof(format!(
                "digest must be {DIGEST_HEX_LEN} hex chars, got {}",
                trimmed.len()
            )));
        }
        if !trimmed.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(LedgerError::Proof(format!("digest is not hex: {trimmed}")));
        }
        Ok(Self(trimmed.to_ascii_lowercase()))
    }

    fn from_raw(bytes: &[u8]) -> Self {
        Self(hex::encode(bytes))
    }

    /// Returns the hex form.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true if the string has the shape of a digest.
    pub fn is_well_formed(input: &str) -> bool {
        input.len() == DIGEST_HEX_LEN && input.bytes().all(|b| b.is_ascii_hexdigit())
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Digest {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for Digest {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Digest {
    type Error = LedgerError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Digest> for String {
    fn from(value: Digest) -> Self {
        value.0
    }
}

/// Digest together with a flag telling whether it is a real content hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashOutcome {
    /// The digest handed to the caller.
    pub digest: Digest,
    /// `false` when the value could not be canonicalized and a random
    /// identifier was substituted.
    pub cryptographically_sound: bool,
}

/// Serializes `value` into its canonical byte form.
///
/// Object keys are sorted lexicographically at every depth and no
/// insignificant whitespace is emitted.
pub fn canonical_bytes<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, serde_json::Error> {
    let value = serde_json::to_value(value)?;
    let mut out = Vec::new();
    write_canonical(&value, &mut out)?;
    Ok(out)
}

fn write_canonical(value: &Value, out: &mut Vec<u8>) -> Result<(), serde_json::Error> {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push(b'{');
            for (idx, key) in keys.into_iter().enumerate() {
                if idx > 0 {
                    out.push(b',');
                }
                serde_json::to_writer(&mut *out, key)?;
                out.push(b':');
                write_canonical(&map[key], out)?;
            }
            out.push(b'}');
        }
        Value::Array(items) => {
            out.push(b'[');
            for (idx, item) in items.iter().enumerate() {
                if idx > 0 {
                    out.push(b',');
                }
                write_canonical(item, out)?;
            }
            out.push(b']');
        }
        scalar => serde_json::to_writer(&mut *out, scalar)?,
    }
    Ok(())
}

/// Hashes raw bytes with SHA-256.
pub fn hash_bytes(bytes: &[u8]) -> Digest {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    Digest::from_raw(&hasher.finalize())
}

/// Hashes any serializable value, falling back to a random identifier when
/// the value cannot be canonicalized.
pub fn hash_value<T: Serialize + ?Sized>(value: &T) -> HashOutcome {
    match canonical_bytes(value) {
        Ok(bytes) => HashOutcome {
            digest: hash_bytes(&bytes),
            cryptographically_sound: true,
        },
        Err(err) => {
            tracing::warn!(error = %err, "canonicalization failed, using random identifier");
            HashOutcome {
                digest: fallback_digest(),
                cryptographically_sound: false,
            }
        }
    }
}

/// Digest of an internal Merkle node: SHA-256 over the concatenated hex of
/// both children.
pub fn hash_pair(left: &Digest, right: &Digest) -> Digest {
    let mut hasher = Sha256::new();
    hasher.update(left.as_str().as_bytes());
    hasher.update(right.as_str().as_bytes());
    Digest::from_raw(&hasher.finalize())
}

/// Digest of a payload at insertion time.  The nonce and timestamp make two
/// insertions of identical content produce distinct leaves.
pub fn leaf_digest<T: Serialize + ?Sized>(payload: &T, nonce: u64, timestamp_ms: u64) -> HashOutcome {
    match serde_json::to_value(payload) {
        Ok(payload) => hash_value(&json!({
            "payload": payload,
            "nonce": nonce,
            "timestamp_ms": timestamp_ms,
        })),
        Err(err) => {
            tracing::warn!(error = %err, "leaf payload not serializable, using random identifier");
            HashOutcome {
                digest: fallback_digest(),
                cryptographically_sound: false,
            }
        }
    }
}

fn fallback_digest() -> Digest {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    Digest::from_raw(&bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn hashing_is_deterministic() {
        let value = json!({"title": "walk", "tags": ["a", "b"]});
        assert_eq!(hash_value(&value), hash_value(&value));
        assert!(hash_value(&value).cryptographically_sound);
    }

    #[test]
    fn key_order_does_not_matter() {
        let a: Value = serde_json::from_str(r#"{"b":1,"a":{"y":2,"x":3}}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"a":{"x":3,"y":2},"b":1}"#).unwrap();
        assert_eq!(canonical_bytes(&a).unwrap(), canonical_bytes(&b).unwrap());
        assert_eq!(
            String::from_utf8(canonical_bytes(&a).unwrap()).unwrap(),
            r#"{"a":{"x":3,"y":2},"b":1}"#
        );
    }

    #[test]
    fn different_content_gives_different_digest() {
        assert_ne!(hash_value("a").digest, hash_value("b").digest);
    }

    #[test]
    fn known_vector() {
        // sha256("\"a\"")
        assert_eq!(
            hash_value("a").digest.as_str(),
            "ac8d8342bbb2362d13f0a559a3621bb407011368895164b628a54f7fc33fc43c"
        );
    }

    #[test]
    fn unserializable_value_is_flagged() {
        let mut map = BTreeMap::new();
        map.insert(vec![1u8, 2], 3u8);
        let outcome = hash_value(&map);
        assert!(!outcome.cryptographically_sound);
        assert!(Digest::is_well_formed(outcome.digest.as_str()));
    }

    #[test]
    fn leaf_nonce_changes_digest() {
        let first = leaf_digest("memo", 1, 10);
        let second = leaf_digest("memo", 2, 10);
        assert_ne!(first.digest, second.digest);
        assert_eq!(first, leaf_digest("memo", 1, 10));
    }

    #[test]
    fn digest_parse_validates_shape() {
        assert!(Digest::parse("abc").is_err());
        assert!(Digest::parse(&"z".repeat(64)).is_err());
        let upper = "A".repeat(64);
        assert_eq!(Digest::parse(&upper).unwrap().as_str(), "a".repeat(64));
    }
}
