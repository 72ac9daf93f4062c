use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use time::OffsetDateTime;

use crate::error::SchemaError;

/// A proposal identifier such as `KIP-500`.
///
/// The project prefix is stored upper-cased so `kip-500` and `KIP-500` compare
/// equal; the number is compared exactly.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema)]
pub struct ProposalRef {
    pub project: String, // e.g. "KIP", "FLIP"
    pub number: u32,
}

impl ProposalRef {
    pub fn new(project: &str, number: u32) -> Self {
        Self {
            project: project.trim().to_ascii_uppercase(),
            number,
        }
    }
}

impl fmt::Display for ProposalRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.project, self.number)
    }
}

impl FromStr for ProposalRef {
    type Err = SchemaError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let (project, number) = value
            .trim()
            .rsplit_once('-')
            .ok_or_else(|| SchemaError::InvalidProposal(value.to_string()))?;
        if project.is_empty() {
            return Err(SchemaError::InvalidProposal(value.to_string()));
        }
        let number = number
            .parse::<u32>()
            .map_err(|_| SchemaError::InvalidProposal(value.to_string()))?;
        Ok(Self::new(project, number))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum MentionType {
    Subject,
    Vote,
    Discuss,
    Body,
}

impl MentionType {
    pub const ALL: [MentionType; 4] = [
        MentionType::Subject,
        MentionType::Vote,
        MentionType::Discuss,
        MentionType::Body,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MentionType::Subject => "subject",
            MentionType::Vote => "vote",
            MentionType::Discuss => "discuss",
            MentionType::Body => "body",
        }
    }

    /// Subject-level mentions are the ones found in the subject line.
    pub fn is_subject_level(&self) -> bool {
        !matches!(self, MentionType::Body)
    }
}

impl fmt::Display for MentionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MentionType {
    type Err = SchemaError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "subject" => Ok(MentionType::Subject),
            "vote" => Ok(MentionType::Vote),
            "discuss" => Ok(MentionType::Discuss),
            "body" => Ok(MentionType::Body),
            _ => Err(SchemaError::InvalidMentionType(value.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema)]
pub enum VoteValue {
    #[serde(rename = "+1")]
    PlusOne,
    #[serde(rename = "0")]
    Zero,
    #[serde(rename = "-1")]
    MinusOne,
}

impl VoteValue {
    pub const ALL: [VoteValue; 3] = [VoteValue::PlusOne, VoteValue::Zero, VoteValue::MinusOne];

    pub fn as_str(&self) -> &'static str {
        match self {
            VoteValue::PlusOne => "+1",
            VoteValue::Zero => "0",
            VoteValue::MinusOne => "-1",
        }
    }
}

impl fmt::Display for VoteValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VoteValue {
    type Err = SchemaError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "+1" => Ok(VoteValue::PlusOne),
            "0" => Ok(VoteValue::Zero),
            "-1" => Ok(VoteValue::MinusOne),
            _ => Err(SchemaError::InvalidVote(value.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct VoteCast {
    pub value: VoteValue,
    pub is_binding: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Sender {
    pub name: String,
    pub email: String,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema)]
pub struct ArchiveUnit {
    pub list: String,   // e.g. "dev"
    pub domain: String, // e.g. "kafka.apache.org"
    pub year: i32,
    pub month: u8,
}

impl ArchiveUnit {
    pub fn new(list: &str, domain: &str, year: i32, month: u8) -> Self {
        Self {
            list: list.to_string(),
            domain: domain.to_string(),
            year,
            month,
        }
    }

    pub fn file_name(&self) -> String {
        format!(
            "{}_{}-{:04}-{:02}.mbox",
            self.list,
            self.domain.replace('.', "_"),
            self.year,
            self.month
        )
    }
}

impl fmt::Display for ArchiveUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}/{:04}-{:02}", self.list, self.domain, self.year, self.month)
    }
}

impl FromStr for ArchiveUnit {
    type Err = SchemaError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let invalid = || SchemaError::InvalidArchiveUnit(value.to_string());
        let (address, period) = value.rsplit_once('/').ok_or_else(invalid)?;
        let (list, domain) = address.split_once('@').ok_or_else(invalid)?;
        let (year, month) = period.split_once('-').ok_or_else(invalid)?;
        let year = year.parse::<i32>().map_err(|_| invalid())?;
        let month = month.parse::<u8>().map_err(|_| invalid())?;
        if list.is_empty() || domain.is_empty() || !(1..=12).contains(&month) {
            return Err(invalid());
        }
        Ok(Self::new(list, domain, year, month))
    }
}

/// Dedup identity of a mention: derived only from message content.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MentionKey {
    pub message_id: String,
    pub proposal: ProposalRef,
    pub mention_type: MentionType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct MentionRecord {
    pub proposal: ProposalRef,
    pub message_id: String,
    pub mention_type: MentionType,
    #[serde(with = "time::serde::rfc3339")]
    #[schemars(with = "String")]
    pub timestamp: OffsetDateTime, // always UTC
    pub sender: Sender,
    pub vote: Option<VoteCast>, // only on VOTE mentions that cast a vote
    pub archive_unit: ArchiveUnit,
}

impl MentionRecord {
    pub fn key(&self) -> MentionKey {
        MentionKey {
            message_id: self.message_id.clone(),
            proposal: self.proposal.clone(),
            mention_type: self.mention_type,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct CommitterIdentity {
    pub canonical_name: String,
    pub email_aliases: BTreeSet<String>, // lower-cased
    pub source_key_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct MentionRow {
    pub proposal_id: String,
    pub message_id: String,
    pub mention_type: String,
    pub timestamp: String,
    pub sender_name: String,
    pub sender_email: String,
    pub vote_value: Option<String>,
    pub is_binding: Option<bool>,
    pub archive_unit: String,
}

pub const MENTION_COLUMNS: [&str; 9] = [
    "proposal_id",
    "message_id",
    "mention_type",
    "timestamp",
    "sender_name",
    "sender_email",
    "vote_value",
    "is_binding",
    "archive_unit",
];

/// Per-project ingestion bookkeeping consumed by `status` and `update`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct IngestMetadata {
    pub project: String,
    #[serde(with = "time::serde::rfc3339::option")]
    #[schemars(with = "Option<String>")]
    pub last_success_at: Option<OffsetDateTime>,
    pub units_covered: BTreeSet<ArchiveUnit>,
    pub record_count: usize,
    pub counts_by_type: std::collections::BTreeMap<String, usize>,
}

impl IngestMetadata {
    pub fn new(project: &str) -> Self {
        Self {
            project: project.to_string(),
            ..Self::default()
        }
    }

    pub fn latest_unit(&self) -> Option<&ArchiveUnit> {
        self.units_covered
            .iter()
            .max_by_key(|unit| (unit.year, unit.month))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proposal_ref_is_case_insensitive_on_prefix() {
        let a: ProposalRef = "kip-500".parse().unwrap();
        let b = ProposalRef::new("KIP", 500);
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "KIP-500");
        assert_ne!(b, ProposalRef::new("KIP", 501));
    }

    #[test]
    fn proposal_ref_rejects_garbage() {
        assert!("KIP".parse::<ProposalRef>().is_err());
        assert!("-12".parse::<ProposalRef>().is_err());
        assert!("KIP-x".parse::<ProposalRef>().is_err());
    }

    #[test]
    fn archive_unit_display_parses_back() {
        let unit = ArchiveUnit::new("dev", "kafka.apache.org", 2026, 2);
        assert_eq!(unit.to_string(), "dev@kafka.apache.org/2026-02");
        assert_eq!(unit.to_string().parse::<ArchiveUnit>().unwrap(), unit);
        assert_eq!(unit.file_name(), "dev_kafka_apache_org-2026-02.mbox");
        assert!("dev@kafka.apache.org/2026-13".parse::<ArchiveUnit>().is_err());
    }

    #[test]
    fn latest_unit_orders_by_calendar() {
        let mut meta = IngestMetadata::new("kafka");
        meta.units_covered.insert(ArchiveUnit::new("dev", "kafka.apache.org", 2025, 12));
        meta.units_covered.insert(ArchiveUnit::new("dev", "kafka.apache.org", 2026, 1));
        meta.units_covered.insert(ArchiveUnit::new("dev", "kafka.apache.org", 2025, 3));
        let latest = meta.latest_unit().unwrap();
        assert_eq!((latest.year, latest.month), (2026, 1));
    }
}
