use tracing::warn;

use crate::error::MessageError;
use crate::identity::IdentityResolver;
use crate::mailbox::{split_mbox, ParsedMessage};
use crate::mention::MentionExtractor;
use crate::schema::{ArchiveUnit, MentionRecord, MentionType};
use crate::vote::VoteParser;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedMessage {
    pub index: usize,
    pub message_id: String,
    pub reason: MessageError,
}

#[derive(Debug, Clone, Default)]
pub struct UnitOutcome {
    pub records: Vec<MentionRecord>,
    pub skipped: Vec<SkippedMessage>,
    pub messages: usize,
}

/// Everything a worker needs to turn archive bytes into records.
///
/// Holds only read-only state so one instance can be shared across threads
/// for a whole run.
pub struct Ingestor<'a> {
    pub extractor: &'a MentionExtractor,
    pub resolver: &'a IdentityResolver,
    pub votes: VoteParser,
}

impl Ingestor<'_> {
    /// Records for every mention in one archive unit.
    ///
    /// Depends only on `bytes`: messages without a usable sender or date are
    /// skipped and reported, the rest of the unit is kept.
    pub fn ingest_unit(&self, unit: &ArchiveUnit, bytes: &[u8]) -> UnitOutcome {
        let mut outcome = UnitOutcome::default();

        for raw in split_mbox(bytes) {
            outcome.messages += 1;
            let message = ParsedMessage::parse(&raw);

            let mentions = self.extractor.extract(&message.subject, &message.body);
            if mentions.is_empty() {
                continue;
            }

            let parsed = message
                .sender()
                .and_then(|sender| message.timestamp().map(|timestamp| (sender, timestamp)));
            let (sender, timestamp) = match parsed {
                Ok(parsed) => parsed,
                Err(reason) => {
                    warn!(
                        unit = %unit,
                        index = raw.index,
                        message_id = %message.message_id,
                        error = %reason,
                        "skipping malformed message"
                    );
                    outcome.skipped.push(SkippedMessage {
                        index: raw.index,
                        message_id: message.message_id.clone(),
                        reason,
                    });
                    continue;
                }
            };

            for (proposal, mention_type) in mentions {
                let vote = if mention_type == MentionType::Vote {
                    self.votes
                        .parse_for_vote(&message.body, &sender, &proposal, self.resolver)
                        .map(|result| result.cast())
                } else {
                    None
                };
                outcome.records.push(MentionRecord {
                    proposal,
                    message_id: message.message_id.clone(),
                    mention_type,
                    timestamp,
                    sender: sender.clone(),
                    vote,
                    archive_unit: unit.clone(),
                });
            }
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ProposalRef, VoteValue};
    use std::collections::BTreeSet;

    const ARCHIVE: &str = "\
From alice@apache.org Tue Feb  3 10:00:00 2026
From: Alice Johnson <alice@apache.org>
Date: Tue, 3 Feb 2026 10:00:00 +0000
Subject: [VOTE] KIP-500: Replace ZooKeeper
Message-ID: <vote-1@example.com>

+1

see KIP-501 for details

From carol@example.com Tue Feb  3 11:00:00 2026
From: Carol <carol@example.com>
Date: sometime last week
Subject: Re: [VOTE] KIP-500: Replace ZooKeeper
Message-ID: <vote-2@example.com>

+1 (binding)

From dan@example.com Tue Feb  3 12:00:00 2026
From: Dan Brown <dan@example.com>
Date: Tue, 3 Feb 2026 12:00:00 +0000
Subject: Re: [VOTE] KIP-500: Replace ZooKeeper
Message-ID: <vote-3@example.com>

-1 (non-binding)

From eve@example.com Tue Feb  3 13:00:00 2026
From: Eve <eve@example.com>
Date: Tue, 3 Feb 2026 13:00:00 +0000
Subject: Release 3.7.0 planning
Message-ID: <other@example.com>

Nothing to see here.
";

    fn resolver() -> IdentityResolver {
        IdentityResolver::new(
            vec![crate::schema::CommitterIdentity {
                canonical_name: "Alice Johnson".into(),
                email_aliases: BTreeSet::from(["alice@apache.org".to_string()]),
                source_key_id: None,
            }],
            0.70,
        )
    }

    #[test]
    fn malformed_date_skips_only_that_message() {
        let extractor = MentionExtractor::new("KIP").unwrap();
        let resolver = resolver();
        let ingestor = Ingestor {
            extractor: &extractor,
            resolver: &resolver,
            votes: VoteParser::default(),
        };
        let unit = ArchiveUnit::new("dev", "kafka.apache.org", 2026, 2);
        let outcome = ingestor.ingest_unit(&unit, ARCHIVE.as_bytes());

        assert_eq!(outcome.messages, 4);
        assert_eq!(outcome.skipped.len(), 1);
        assert_eq!(outcome.skipped[0].message_id, "vote-2@example.com");
        assert!(matches!(outcome.skipped[0].reason, MessageError::MalformedDate(_)));

        let summary: Vec<_> = outcome
            .records
            .iter()
            .map(|record| (record.message_id.as_str(), record.proposal.number, record.mention_type, record.vote))
            .collect();
        assert_eq!(summary.len(), 3);
        assert_eq!(summary[0].0, "vote-1@example.com");
        assert_eq!(summary[0].2, MentionType::Vote);
        let alice_vote = summary[0].3.unwrap();
        assert_eq!(alice_vote.value, VoteValue::PlusOne);
        assert!(alice_vote.is_binding);
        assert_eq!((summary[1].1, summary[1].2, summary[1].3), (501, MentionType::Body, None));
        let dan_vote = summary[2].3.unwrap();
        assert_eq!(dan_vote.value, VoteValue::MinusOne);
        assert!(!dan_vote.is_binding);
    }

    #[test]
    fn ingestion_is_a_function_of_the_bytes() {
        let extractor = MentionExtractor::new("KIP").unwrap();
        let resolver = resolver();
        let ingestor = Ingestor {
            extractor: &extractor,
            resolver: &resolver,
            votes: VoteParser::default(),
        };
        let unit = ArchiveUnit::new("dev", "kafka.apache.org", 2026, 2);
        let first = ingestor.ingest_unit(&unit, ARCHIVE.as_bytes());
        let second = ingestor.ingest_unit(&unit, ARCHIVE.as_bytes());
        assert_eq!(first.records, second.records);
        assert!(first.records.iter().all(|record| record.archive_unit == unit));
        assert_eq!(first.records[0].proposal, ProposalRef::new("KIP", 500));
    }

    #[test]
    fn empty_archive_has_no_records() {
        let extractor = MentionExtractor::new("KIP").unwrap();
        let resolver = IdentityResolver::empty();
        let ingestor = Ingestor {
            extractor: &extractor,
            resolver: &resolver,
            votes: VoteParser::default(),
        };
        let outcome = ingestor.ingest_unit(&ArchiveUnit::new("dev", "kafka.apache.org", 2026, 3), b"");
        assert_eq!(outcome.messages, 0);
        assert!(outcome.records.is_empty());
    }
}
