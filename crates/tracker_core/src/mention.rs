use anyhow::Result;
use regex::Regex;
use std::sync::LazyLock;

use crate::schema::{MentionType, ProposalRef};

static VOTE_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bvote\b").expect("valid vote token regex"));
static DISCUSS_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bdiscuss(?:ion)?\b").expect("valid discuss token regex"));

/// Finds `<PREFIX>-<digits>` references and classifies each proposal once.
#[derive(Debug, Clone)]
pub struct MentionExtractor {
    prefix: String,
    pattern: Regex,
}

impl MentionExtractor {
    pub fn new(prefix: &str) -> Result<Self> {
        let prefix = prefix.trim().to_ascii_uppercase();
        let pattern = Regex::new(&format!(r"(?i)\b{}-(\d+)", regex::escape(&prefix)))?;
        Ok(Self { prefix, pattern })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn references(&self, text: &str) -> Vec<ProposalRef> {
        let mut found: Vec<ProposalRef> = Vec::new();
        for caps in self.pattern.captures_iter(text) {
            let Ok(number) = caps[1].parse::<u32>() else {
                continue; // absurdly long digit runs
            };
            let reference = ProposalRef::new(&self.prefix, number);
            if !found.contains(&reference) {
                found.push(reference);
            }
        }
        found
    }

    /// Classifies every proposal mentioned in a message.
    ///
    /// Subject references take VOTE, then DISCUSS, then SUBJECT depending on
    /// the subject's thread tokens; references only in the body are BODY. Each
    /// proposal gets exactly one type.
    pub fn extract(&self, subject: &str, body: &str) -> Vec<(ProposalRef, MentionType)> {
        let subject_type = if VOTE_TOKEN.is_match(subject) {
            MentionType::Vote
        } else if DISCUSS_TOKEN.is_match(subject) {
            MentionType::Discuss
        } else {
            MentionType::Subject
        };

        let subject_refs = self.references(subject);
        let mut mentions: Vec<(ProposalRef, MentionType)> = subject_refs
            .iter()
            .cloned()
            .map(|reference| (reference, subject_type))
            .collect();

        for reference in self.references(body) {
            if !subject_refs.contains(&reference) {
                mentions.push((reference, MentionType::Body));
            }
        }
        mentions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kip(number: u32) -> ProposalRef {
        ProposalRef::new("KIP", number)
    }

    #[test]
    fn vote_subject_and_body_reference_coexist() {
        let extractor = MentionExtractor::new("KIP").unwrap();
        let mentions = extractor.extract(
            "[VOTE] KIP-500: Replace ZooKeeper with a Self-Managed Metadata Quorum",
            "+1 (binding)\n\nsee KIP-501 for details",
        );
        assert_eq!(
            mentions,
            vec![(kip(500), MentionType::Vote), (kip(501), MentionType::Body)]
        );
    }

    #[test]
    fn discuss_and_plain_subjects() {
        let extractor = MentionExtractor::new("KIP").unwrap();
        assert_eq!(
            extractor.extract("[DISCUSS] KIP-12: something", ""),
            vec![(kip(12), MentionType::Discuss)]
        );
        assert_eq!(
            extractor.extract("Re: KIP-12 follow-up", ""),
            vec![(kip(12), MentionType::Subject)]
        );
        assert_eq!(
            extractor.extract("Re: [vote] kip-12 follow-up", ""),
            vec![(kip(12), MentionType::Vote)]
        );
    }

    #[test]
    fn vote_wins_over_discuss() {
        let extractor = MentionExtractor::new("KIP").unwrap();
        assert_eq!(
            extractor.extract("[DISCUSS] [VOTE] KIP-7", ""),
            vec![(kip(7), MentionType::Vote)]
        );
    }

    #[test]
    fn same_id_in_subject_and_body_is_classified_once() {
        let extractor = MentionExtractor::new("KIP").unwrap();
        let mentions = extractor.extract("[VOTE] KIP-500", "Voting on KIP-500, see KIP-500 wiki");
        assert_eq!(mentions, vec![(kip(500), MentionType::Vote)]);
    }

    #[test]
    fn body_only_references_are_deduplicated() {
        let extractor = MentionExtractor::new("KIP").unwrap();
        let mentions = extractor.extract("Weekly digest", "KIP-1, kip-2 and KIP-1 again");
        assert_eq!(
            mentions,
            vec![(kip(1), MentionType::Body), (kip(2), MentionType::Body)]
        );
    }

    #[test]
    fn prefix_must_start_a_word() {
        let extractor = MentionExtractor::new("KIP").unwrap();
        assert!(extractor.extract("SKIP-3 is not a proposal", "").is_empty());
        let flip = MentionExtractor::new("flip").unwrap();
        assert_eq!(flip.prefix(), "FLIP");
        assert_eq!(
            flip.extract("[DISCUSS] FLIP-27: source interface", "unrelated KIP-1"),
            vec![(ProposalRef::new("FLIP", 27), MentionType::Discuss)]
        );
    }

    #[test]
    fn no_references_no_mentions() {
        let extractor = MentionExtractor::new("KIP").unwrap();
        assert!(extractor.extract("[VOTE] Release 3.7.0 RC1", "+1 (binding)").is_empty());
    }
}
