//! Vote extraction from VOTE-thread messages.
//!
//! A vote is `+1`, `0` or `-1`, optionally followed on the same line by a
//! parenthetical qualifier. Binding status comes from the qualifier when there
//! is one; only unmarked votes consult the committer roster.

use regex::Regex;
use std::sync::LazyLock;
use tracing::debug;

use crate::identity::{IdentityResolver, MatchMethod};
use crate::schema::{ProposalRef, Sender, VoteCast, VoteValue};

static VOTE_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[+-]1|0").expect("valid vote token regex"));
static REPLY_ATTRIBUTION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\s*on\s.+wrote:\s*$").expect("valid attribution regex"));

const BINDING_WORD: &str = "binding";
const MAX_QUALIFIER_EDITS: usize = 1;
const QUOTE_PREFIX_WIDTH: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Qualifier {
    Binding,
    NonBinding,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BindingBasis {
    Explicit,
    CommitterEmail,
    CommitterName { confidence: f64 },
    NotCommitter,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VoteResult {
    pub value: VoteValue,
    pub is_binding: bool,
    pub basis: BindingBasis,
}

impl VoteResult {
    pub fn cast(&self) -> VoteCast {
        VoteCast {
            value: self.value,
            is_binding: self.is_binding,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VoteToken {
    pub value: VoteValue,
    pub qualifier: Option<Qualifier>,
}

#[derive(Debug, Clone)]
pub struct VoteParser {
    scan_lines: usize,
}

impl Default for VoteParser {
    fn default() -> Self {
        Self { scan_lines: 50 }
    }
}

impl VoteParser {
    pub fn new(scan_lines: usize) -> Self {
        Self { scan_lines }
    }

    /// Extracts the vote cast by `sender`, if the body contains one.
    ///
    /// An explicit qualifier always decides binding status; the resolver is
    /// asked only about unmarked votes.
    pub fn parse_for_vote(
        &self,
        body: &str,
        sender: &Sender,
        proposal: &ProposalRef,
        resolver: &IdentityResolver,
    ) -> Option<VoteResult> {
        let token = self.find_token(body)?;

        let result = match token.qualifier {
            Some(Qualifier::Binding) => VoteResult {
                value: token.value,
                is_binding: true,
                basis: BindingBasis::Explicit,
            },
            Some(Qualifier::NonBinding) => VoteResult {
                value: token.value,
                is_binding: false,
                basis: BindingBasis::Explicit,
            },
            None => {
                let found = resolver.match_sender(&sender.name, &sender.email);
                let basis = match found.method {
                    MatchMethod::Email => BindingBasis::CommitterEmail,
                    MatchMethod::Name => BindingBasis::CommitterName {
                        confidence: found.confidence,
                    },
                    MatchMethod::None => BindingBasis::NotCommitter,
                };
                if let Some(identity) = found.identity {
                    debug!(
                        proposal = %proposal,
                        committer = %identity.canonical_name,
                        method = %found.method,
                        confidence = found.confidence,
                        "binding vote from committer"
                    );
                }
                VoteResult {
                    value: token.value,
                    is_binding: found.is_match,
                    basis,
                }
            }
        };
        Some(result)
    }

    /// First explicitly qualified token in the scanned region, else the first
    /// unqualified one.
    pub fn find_token(&self, body: &str) -> Option<VoteToken> {
        let mut first_unqualified: Option<VoteToken> = None;
        let mut scanned = 0;

        for line in body.lines() {
            if REPLY_ATTRIBUTION.is_match(line)
                || line.trim_start().starts_with("-----Original Message")
                || line.trim_end() == "--"
            {
                break;
            }
            if is_quoted(line) || line.trim().is_empty() {
                continue;
            }
            scanned += 1;
            if scanned > self.scan_lines {
                break;
            }
            for token in tokens_in_line(line) {
                if token.qualifier.is_some() {
                    return Some(token);
                }
                if first_unqualified.is_none() {
                    first_unqualified = Some(token);
                }
            }
        }
        first_unqualified
    }
}

fn is_quoted(line: &str) -> bool {
    line.chars().take(QUOTE_PREFIX_WIDTH).any(|c| c == '>')
}

fn tokens_in_line(line: &str) -> Vec<VoteToken> {
    let mut tokens = Vec::new();
    for found in VOTE_TOKEN.find_iter(line) {
        let before = &line[..found.start()];
        let after = &line[found.end()..];

        let prev = before.chars().next_back();
        let next = after.chars().next();
        if prev.is_some_and(|c| c.is_alphanumeric() || matches!(c, '.' | '+' | '-')) {
            continue;
        }
        if next.is_some_and(|c| {
            c.is_alphanumeric() || (c == '.' && after[1..].starts_with(|d: char| d.is_ascii_digit()))
        }) {
            continue;
        }
        // "+1 650 555 0100", "+1-650-555-0100"
        let rest = after.strip_prefix([' ', '\t', '-']).unwrap_or(after);
        if rest.starts_with(|c: char| c.is_ascii_digit()) {
            continue;
        }

        let value = match found.as_str() {
            "+1" => VoteValue::PlusOne,
            "-1" => VoteValue::MinusOne,
            _ => VoteValue::Zero,
        };

        let qualifier_text = qualifier_text(after);
        if value == VoteValue::Zero && !bare_zero_counts(line, after) {
            continue;
        }

        tokens.push(VoteToken {
            value,
            qualifier: qualifier_text.and_then(classify_qualifier),
        });
    }
    tokens
}

/// A lone `0` is a vote only as the whole line or directly qualified, so
/// prose like "I have 0 concerns" is ignored.
fn bare_zero_counts(line: &str, after: &str) -> bool {
    let trimmed = line.trim().trim_end_matches(['.', '!', ',']);
    trimmed == "0" || after.trim_start().starts_with('(')
}

fn qualifier_text(after: &str) -> Option<&str> {
    let open = after.find('(')?;
    let inner = &after[open + 1..];
    Some(match inner.find(')') {
        Some(close) => &inner[..close],
        None => inner,
    })
}

/// Recognises "binding" and its negations, tolerating small typos.
pub fn classify_qualifier(text: &str) -> Option<Qualifier> {
    let lowered = text.to_lowercase();
    let words: Vec<&str> = lowered
        .split(|c: char| !c.is_alphabetic())
        .filter(|word| !word.is_empty())
        .collect();

    let mut negated = false;
    for word in words {
        if word == "non" || word == "not" {
            negated = true;
            continue;
        }
        let (prefixed, stem) = match word.strip_prefix("non") {
            Some(rest) if !rest.is_empty() => (true, rest),
            _ => (false, word),
        };
        if is_binding_word(stem) {
            return Some(if negated || prefixed {
                Qualifier::NonBinding
            } else {
                Qualifier::Binding
            });
        }
        negated = false;
    }
    None
}

/// One typo away from "binding" and still starting with "bin", so words like
/// "pending" or "bidding" never pass for a qualifier.
fn is_binding_word(word: &str) -> bool {
    word.starts_with("bin") && strsim::damerau_levenshtein(word, BINDING_WORD) <= MAX_QUALIFIER_EDITS
}
