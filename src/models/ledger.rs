// src/models/ledger.rs

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// Outcome recorded for a processed key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerStatus {
    Success,
    /// Terminal; the document will not be looked at again
    Skipped,
    /// Eligible for retry while under the retry budget
    Failed,
}

impl LedgerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for LedgerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LedgerStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(Self::Success),
            "skipped" => Ok(Self::Skipped),
            "failed" => Ok(Self::Failed),
            other => Err(AppError::validation(format!("unknown ledger status '{other}'"))),
        }
    }
}

/// Row of the processed-documents ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessedEntry {
    pub key: String,
    pub status: LedgerStatus,
    pub retry_count: u32,
    pub last_error: Option<String>,
    /// Short outcome label ("PDF", "Small File", ...)
    pub file_type: String,
    /// RFC 3339 timestamp
    pub processed_at: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_parses_its_own_display() {
        for status in [LedgerStatus::Success, LedgerStatus::Skipped, LedgerStatus::Failed] {
            assert_eq!(status.to_string().parse::<LedgerStatus>().unwrap(), status);
        }
        assert!("done".parse::<LedgerStatus>().is_err());
    }
}
