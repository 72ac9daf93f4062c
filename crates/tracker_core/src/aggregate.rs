use std::collections::BTreeMap;
use std::fmt;
use time::{Duration, OffsetDateTime};

use crate::schema::{MentionRecord, MentionType, ProposalRef, Sender, VoteValue};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ActivityStatus {
    Green,
    Yellow,
    Red,
    Black,
}

impl ActivityStatus {
    pub const ALL: [ActivityStatus; 4] = [
        ActivityStatus::Green,
        ActivityStatus::Yellow,
        ActivityStatus::Red,
        ActivityStatus::Black,
    ];

    /// Green up to 4 weeks, yellow up to 12 weeks, red up to a year.
    pub fn from_last_mention(last: Option<OffsetDateTime>, now: OffsetDateTime) -> Self {
        let Some(last) = last else {
            return ActivityStatus::Black;
        };
        let age = now - last;
        if age <= Duration::weeks(4) {
            ActivityStatus::Green
        } else if age <= Duration::weeks(12) {
            ActivityStatus::Yellow
        } else if age <= Duration::days(365) {
            ActivityStatus::Red
        } else {
            ActivityStatus::Black
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityStatus::Green => "green",
            ActivityStatus::Yellow => "yellow",
            ActivityStatus::Red => "red",
            ActivityStatus::Black => "black",
        }
    }
}

impl fmt::Display for ActivityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Voter {
    pub sender: Sender,
    pub cast_at: OffsetDateTime,
    pub is_binding: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VoteTally {
    pub by_value: BTreeMap<VoteValue, Vec<Voter>>,
}

impl VoteTally {
    pub fn voters(&self, value: VoteValue) -> &[Voter] {
        self.by_value.get(&value).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn binding(&self, value: VoteValue) -> usize {
        self.voters(value).iter().filter(|voter| voter.is_binding).count()
    }

    pub fn non_binding(&self, value: VoteValue) -> usize {
        self.voters(value).iter().filter(|voter| !voter.is_binding).count()
    }

    pub fn is_empty(&self) -> bool {
        self.by_value.values().all(Vec::is_empty)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProposalSummary {
    pub proposal: ProposalRef,
    pub latest_by_type: BTreeMap<MentionType, OffsetDateTime>,
    pub last_activity: OffsetDateTime,
    pub mention_count: usize,
    pub status: ActivityStatus,
    pub votes: VoteTally,
}

impl ProposalSummary {
    pub fn last_subject_mention(&self) -> Option<OffsetDateTime> {
        self.latest_by_type
            .iter()
            .filter(|(mention_type, _)| mention_type.is_subject_level())
            .map(|(_, at)| *at)
            .max()
    }
}

/// One summary per proposal, ordered by proposal id.
///
/// A voter who cast several votes counts once, with their most recent value.
/// Voters are keyed by lower-cased email.
pub fn summarize<'a>(
    records: impl IntoIterator<Item = &'a MentionRecord>,
    now: OffsetDateTime,
) -> Vec<ProposalSummary> {
    let mut grouped: BTreeMap<&ProposalRef, Vec<&MentionRecord>> = BTreeMap::new();
    for record in records {
        grouped.entry(&record.proposal).or_default().push(record);
    }

    grouped
        .into_iter()
        .filter_map(|(proposal, mentions)| {
            let last_activity = mentions.iter().map(|record| record.timestamp).max()?;

            let mut latest_by_type: BTreeMap<MentionType, OffsetDateTime> = BTreeMap::new();
            for record in &mentions {
                let entry = latest_by_type
                    .entry(record.mention_type)
                    .or_insert(record.timestamp);
                if record.timestamp > *entry {
                    *entry = record.timestamp;
                }
            }

            let mut latest_vote: BTreeMap<String, (&MentionRecord, VoteValue, bool)> = BTreeMap::new();
            for record in &mentions {
                let Some(vote) = record.vote else {
                    continue;
                };
                let voter = record.sender.email.trim().to_lowercase();
                let newer = latest_vote
                    .get(&voter)
                    .is_none_or(|(seen, _, _)| (record.timestamp, &record.message_id) > (seen.timestamp, &seen.message_id));
                if newer {
                    latest_vote.insert(voter, (record, vote.value, vote.is_binding));
                }
            }

            let mut votes = VoteTally::default();
            for (record, value, is_binding) in latest_vote.into_values() {
                votes.by_value.entry(value).or_default().push(Voter {
                    sender: record.sender.clone(),
                    cast_at: record.timestamp,
                    is_binding,
                });
            }
            for voters in votes.by_value.values_mut() {
                voters.sort_by(|a, b| b.cast_at.cmp(&a.cast_at).then_with(|| a.sender.email.cmp(&b.sender.email)));
            }

            let mut summary = ProposalSummary {
                proposal: proposal.clone(),
                latest_by_type,
                last_activity,
                mention_count: mentions.len(),
                status: ActivityStatus::Black,
                votes,
            };
            summary.status = ActivityStatus::from_last_mention(summary.last_subject_mention(), now);
            Some(summary)
        })
        .collect()
}

/// Human age such as "3 days", "2 weeks" or "1 year, 3 months and 2 weeks".
///
/// Months are counted as 30 days and years as 365.
pub fn format_age(then: OffsetDateTime, now: OffsetDateTime) -> String {
    let days = (now - then).whole_days().max(0);
    if days < 7 {
        return plural(days, "day");
    }

    let years = days / 365;
    let months = (days % 365) / 30;
    let weeks = (days % 365 % 30) / 7;

    let mut parts = Vec::new();
    if years > 0 {
        parts.push(plural(years, "year"));
    }
    if months > 0 {
        parts.push(plural(months, "month"));
    }
    if weeks > 0 || parts.is_empty() {
        parts.push(plural(weeks, "week"));
    }

    match parts.as_slice() {
        [only] => only.clone(),
        [first, second] => format!("{first} and {second}"),
        [first, second, third] => format!("{first}, {second} and {third}"),
        _ => parts.join(", "),
    }
}

fn plural(count: i64, unit: &str) -> String {
    if count == 1 {
        format!("{count} {unit}")
    } else {
        format!("{count} {unit}s")
    }
}
