//! Ledger configuration: defaults, JSON files and `MEMLEDGER_*` overrides.

use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::consensus::{ConfidenceVoter, DigestFormatVoter, SeededVoter, Voter};
use crate::error::{LedgerError, Result};

/// Which [`Voter`] the consensus simulator uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoterKind {
    /// [`DigestFormatVoter`].
    DigestFormat,
    /// [`ConfidenceVoter`] with `min_confidence`.
    Confidence,
    /// [`SeededVoter`] with `voter_seed` and `vote_acceptance`.
    Seeded,
}

impl VoterKind {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "digest_format" | "digest-format" => Some(Self::DigestFormat),
            "confidence" => Some(Self::Confidence),
            "seeded" => Some(Self::Seeded),
            _ => None,
        }
    }
}

fn parse_u64(name: &str, value: &str) -> Result<u64> {
    value
        .trim()
        .parse()
        .map_err(|err| LedgerError::Config(format!("{name}={value:?}: {err}")))
}

/// Runtime settings for a [`MemoryLedger`](crate::MemoryLedger).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Simulated consensus node ids.
    pub nodes: Vec<String>,
    /// Voting strategy.
    pub voter: VoterKind,
    /// Seed for the seeded voter.
    pub voter_seed: u64,
    /// Probability of a yes vote for the seeded voter.
    pub vote_acceptance: f64,
    /// Threshold for the confidence voter.
    pub min_confidence: f64,
    /// Deadline for each store call, in milliseconds.
    pub persistence_timeout_ms: u64,
    /// Entitlement that enables content analysis on submit.
    pub advanced_feature: String,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            nodes: vec!["node-1".into(), "node-2".into(), "node-3".into()],
            voter: VoterKind::DigestFormat,
            voter_seed: 0,
            vote_acceptance: 0.9,
            min_confidence: 0.5,
            persistence_timeout_ms: 5_000,
            advanced_feature: "advanced_verification".into(),
        }
    }
}

impl LedgerConfig {
    /// Loads a JSON config file.  Missing fields take their defaults.
    pub fn from_path(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .map_err(|err| LedgerError::Config(format!("{}: {err}", path.display())))?;
        let config: Self = serde_json::from_str(&contents)
            .map_err(|err| LedgerError::Config(format!("{}: {err}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Applies `MEMLEDGER_NODES`, `MEMLEDGER_VOTER`, `MEMLEDGER_VOTER_SEED`
    /// and `MEMLEDGER_PERSIST_TIMEOUT_MS` when set.
    pub fn apply_env_overrides(mut self) -> Result<Self> {
        if let Ok(nodes) = env::var("MEMLEDGER_NODES") {
            self.nodes = nodes
                .split(',')
                .map(str::trim)
                .filter(|node| !node.is_empty())
                .map(String::from)
                .collect();
        }
        if let Ok(voter) = env::var("MEMLEDGER_VOTER") {
            self.voter = VoterKind::parse(&voter)
                .ok_or_else(|| LedgerError::Config(format!("unknown voter {voter}")))?;
        }
        if let Ok(seed) = env::var("MEMLEDGER_VOTER_SEED") {
            self.voter_seed = parse_u64("MEMLEDGER_VOTER_SEED", &seed)?;
        }
        if let Ok(timeout) = env::var("MEMLEDGER_PERSIST_TIMEOUT_MS") {
            self.persistence_timeout_ms = parse_u64("MEMLEDGER_PERSIST_TIMEOUT_MS", &timeout)?;
        }
        self.validate()?;
        Ok(self)
    }

    /// Rejects settings the ledger cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.nodes.is_empty() {
            return Err(LedgerError::Config("at least one node is required".into()));
        }
        if self.persistence_timeout_ms == 0 {
            return Err(LedgerError::Config(
                "persistence_timeout_ms must be positive".into(),
            ));
        }
        for (name, value) in [
            ("vote_acceptance", self.vote_acceptance),
            ("min_confidence", self.min_confidence),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(LedgerError::Config(format!("{name} {value} outside [0, 1]")));
            }
        }
        Ok(())
    }

    /// Store call deadline.
    pub fn persistence_timeout(&self) -> Duration {
        Duration::from_millis(self.persistence_timeout_ms)
    }

    /// Builds the configured voter.
    pub fn build_voter(&self) -> Box<dyn Voter> {
        match self.voter {
            VoterKind::DigestFormat => Box::new(DigestFormatVoter),
            VoterKind::Confidence => Box::new(ConfidenceVoter::new(self.min_confidence)),
            VoterKind::Seeded => Box::new(SeededVoter {
                seed: self.voter_seed,
                acceptance: self.vote_acceptance,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    #[test]
    fn defaults_are_valid() {
        let config = LedgerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.nodes.len(), 3);
        assert_eq!(config.persistence_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn partial_file_uses_defaults() {
        let mut path = std::env::temp_dir();
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        path.push(format!("memledger_config_{nanos}.json"));
        fs::write(&path, r#"{"voter":"seeded","voter_seed":9,"nodes":["a","b"]}"#).unwrap();
        let config = LedgerConfig::from_path(&path).unwrap();
        fs::remove_file(&path).unwrap();
        assert_eq!(config.voter, VoterKind::Seeded);
        assert_eq!(config.voter_seed, 9);
        assert_eq!(config.nodes, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(config.persistence_timeout_ms, 5_000);
    }

    #[test]
    fn missing_file_is_config_error() {
        let err = LedgerConfig::from_path(Path::new("/nonexistent/memledger.json")).unwrap_err();
        assert!(matches!(err, LedgerError::Config(_)));
    }

    #[test]
    fn invalid_values_are_rejected() {
        let mut config = LedgerConfig::default();
        config.nodes.clear();
        assert!(config.validate().is_err());

        let mut config = LedgerConfig::default();
        config.vote_acceptance = 1.5;
        assert!(config.validate().is_err());

        let mut config = LedgerConfig::default();
        config.persistence_timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn numeric_overrides_must_parse() {
        assert_eq!(parse_u64("MEMLEDGER_VOTER_SEED", " 42 "), Ok(42));
        for bad in ["", "ten", "-1", "1.5"] {
            assert!(matches!(
                parse_u64("MEMLEDGER_PERSIST_TIMEOUT_MS", bad),
                Err(LedgerError::Config(_))
            ));
        }
    }

    #[test]
    fn voter_names_parse() {
        assert_eq!(VoterKind::parse("Seeded"), Some(VoterKind::Seeded));
        assert_eq!(VoterKind::parse("digest-format"), Some(VoterKind::DigestFormat));
        assert_eq!(VoterKind::parse("random"), None);
    }
}
