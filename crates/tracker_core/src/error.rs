//! Error types for ingestion runs
//!
//! Errors are classified by how far they reach:
//! - Message: one email is skipped, the unit carries on
//! - Fetch: one archive unit is skipped, sibling units carry on
//! - Store / Run: the whole run stops

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("Invalid proposal reference: {0}")]
    InvalidProposal(String),

    #[error("Invalid mention type: {0}")]
    InvalidMentionType(String),

    #[error("Invalid vote value: {0}")]
    InvalidVote(String),

    #[error("Invalid archive unit: {0}")]
    InvalidArchiveUnit(String),
}

#[derive(Debug, Error)]
pub enum FetchError {
    // Retryable
    #[error("Network error: {0}")]
    Transient(String),

    #[error("Request timed out after {0} seconds")]
    Timeout(u64),

    // Non-retryable
    #[error("Unexpected HTTP status {status} from {url}")]
    Status { status: u16, url: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl FetchError {
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Transient(_) | FetchError::Timeout(_) => true,
            FetchError::Status { status, .. } => *status == 429 || *status >= 500,
            FetchError::Io(_) => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MessageError {
    #[error("missing {0} header")]
    MissingHeader(&'static str),

    #[error("malformed sender address: {0}")]
    MalformedAddress(String),

    #[error("unparsable date: {0}")]
    MalformedDate(String),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Mention store at {} is unreadable ({reason}); run `refresh` to rebuild it", path.display())]
    Corrupt { path: PathBuf, reason: String },

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Timestamp formatting error: {0}")]
    Format(#[from] time::error::Format),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Unknown project: {0}")]
    UnknownProject(String),

    #[error("Invalid setting {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error("No archive units could be processed ({skipped} skipped)")]
    NoUnitsProcessed { skipped: usize },

    #[error("No mention store found at {}; run `init` first", .0.display())]
    StoreMissing(PathBuf),
}
