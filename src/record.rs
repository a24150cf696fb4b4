//! Tagged schema for memory records accepted by the ledger.

use serde::{Deserialize, Serialize};

use crate::error::{LedgerError, Result};

/// A recorded memory: the only record shape the ledger pipeline hashes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    /// Unique record identifier, usually a UUID string.
    pub id: String,
    /// Owner of the record.
    pub user_id: String,
    /// Short human title.
    pub title: String,
    /// Transcript of the recorded memo.
    pub transcript: String,
    /// Generated summary, when one exists.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    /// Generated action items.
    #[serde(default)]
    pub action_items: Vec<String>,
    /// Free-form tags.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Creation time in Unix milliseconds.
    pub created_at_ms: u64,
    /// Last edit time in Unix milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at_ms: Option<u64>,
}

impl MemoryRecord {
    /// Creates a record with the required fields and empty optional ones.
    pub fn new(
        id: impl Into<String>,
        user_id: impl Into<String>,
        title: impl Into<String>,
        transcript: impl Into<String>,
        created_at_ms: u64,
    ) -> Self {
        Self {
            id: id.into(),
            user_id: user_id.into(),
            title: title.into(),
            transcript: transcript.into(),
            summary: None,
            action_items: Vec::new(),
            tags: Vec::new(),
            created_at_ms,
            updated_at_ms: None,
        }
    }

    /// Checks the record before it is hashed.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(LedgerError::InvalidRecord("id must not be empty".into()));
        }
        if self.user_id.trim().is_empty() {
            return Err(LedgerError::InvalidRecord(format!(
                "record {} has no user_id",
                self.id
            )));
        }
        if self.title.trim().is_empty() {
            return Err(LedgerError::InvalidRecord(format!(
                "record {} has an empty title",
                self.id
            )));
        }
        if self.tags.iter().any(|tag| tag.trim().is_empty()) {
            return Err(LedgerError::InvalidRecord(format!(
                "record {} has an empty tag",
                self.id
            )));
        }
        if let Some(updated) = self.updated_at_ms {
            if updated < self.created_at_ms {
                return Err(LedgerError::InvalidRecord(format!(
                    "record {} updated_at_ms {updated} precedes created_at_ms {}",
                    self.id, self.created_at_ms
                )));
            }
        }
        Ok(())
    }

    /// Text handed to the content analyzer.
    pub fn analyzable_content(&self) -> String {
        match &self.summary {
            Some(summary) => format!("{}\n\n{}\n\n{}", self.title, self.transcript, summary),
            None => format!("{}\n\n{}", self.title, self.transcript),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> MemoryRecord {
        MemoryRecord::new("rec-1", "user-1", "Morning walk", "Saw a heron.", 1_000)
    }

    #[test]
    fn valid_record_passes() {
        assert!(sample().validate().is_ok());
    }

    #[test]
    fn empty_title_is_rejected() {
        let mut record = sample();
        record.title = "  ".into();
        assert!(matches!(
            record.validate(),
            Err(LedgerError::InvalidRecord(_))
        ));
    }

    #[test]
    fn blank_tag_is_rejected() {
        let mut record = sample();
        record.tags = vec!["nature".into(), "".into()];
        assert!(record.validate().is_err());
    }

    #[test]
    fn update_before_creation_is_rejected() {
        let mut record = sample();
        record.updated_at_ms = Some(999);
        assert!(record.validate().is_err());
        record.updated_at_ms = Some(1_000);
        assert!(record.validate().is_ok());
    }

    #[test]
    fn optional_fields_default_when_missing() {
        let json = r#"{"id":"r","user_id":"u","title":"t","transcript":"x","created_at_ms":5}"#;
        let record: MemoryRecord = serde_json::from_str(json).unwrap();
        assert!(record.tags.is_empty());
        assert!(record.summary.is_none());
        assert_eq!(record.created_at_ms, 5);
    }
}
