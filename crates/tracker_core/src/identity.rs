use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::Path;
use std::sync::LazyLock;
use time::{Duration, OffsetDateTime};
use tracing::{info, warn};

use crate::config::DEFAULT_NAME_MATCH_THRESHOLD;
use crate::fetch::RosterFetcher;
use crate::schema::CommitterIdentity;

static UID_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^uid\s+(.+?)\s*<([^>]+)>").expect("valid uid regex"));
static BRACKETED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[[^\]]*\]").expect("valid bracket regex"));
static PARENTHESISED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\([^)]*\)").expect("valid paren regex"));

/// Scores within this distance of the threshold count as meeting it.
const SCORE_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchMethod {
    Email,
    Name,
    None,
}

impl std::fmt::Display for MatchMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let value = match self {
            MatchMethod::Email => "email",
            MatchMethod::Name => "name",
            MatchMethod::None => "none",
        };
        write!(f, "{value}")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IdentityMatch<'a> {
    pub is_match: bool,
    pub confidence: f64,
    pub identity: Option<&'a CommitterIdentity>,
    pub method: MatchMethod,
}

impl IdentityMatch<'_> {
    fn none() -> Self {
        Self {
            is_match: false,
            confidence: 0.0,
            identity: None,
            method: MatchMethod::None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct IdentityResolver {
    committers: Vec<CommitterIdentity>,
    by_email: HashMap<String, usize>,
    threshold: f64,
}

impl IdentityResolver {
    pub fn new(committers: Vec<CommitterIdentity>, threshold: f64) -> Self {
        let mut by_email = HashMap::new();
        for (index, committer) in committers.iter().enumerate() {
            for email in &committer.email_aliases {
                by_email.entry(email.trim().to_lowercase()).or_insert(index);
            }
        }
        Self {
            committers,
            by_email,
            threshold,
        }
    }

    pub fn load(roster_document: &str, threshold: f64) -> Self {
        Self::new(parse_roster(roster_document), threshold)
    }

    pub fn empty() -> Self {
        Self::new(Vec::new(), DEFAULT_NAME_MATCH_THRESHOLD)
    }

    pub fn committers(&self) -> &[CommitterIdentity] {
        &self.committers
    }

    pub fn len(&self) -> usize {
        self.committers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.committers.is_empty()
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Exact alias match first, then the best fuzzy name match.
    pub fn match_sender(&self, display_name: &str, email: &str) -> IdentityMatch<'_> {
        let normalized_email = email.trim().to_lowercase();
        if !normalized_email.is_empty() {
            if let Some(index) = self.by_email.get(&normalized_email) {
                return IdentityMatch {
                    is_match: true,
                    confidence: 1.0,
                    identity: Some(&self.committers[*index]),
                    method: MatchMethod::Email,
                };
            }
        }

        let mut best: Option<(&CommitterIdentity, f64)> = None;
        for committer in &self.committers {
            let score = name_similarity(display_name, &committer.canonical_name);
            if best.map_or(true, |(_, best_score)| score > best_score) {
                best = Some((committer, score));
            }
        }

        match best {
            Some((committer, score)) if meets_threshold(score, self.threshold) => IdentityMatch {
                is_match: true,
                confidence: score,
                identity: Some(committer),
                method: MatchMethod::Name,
            },
            _ => IdentityMatch::none(),
        }
    }
}

pub fn name_similarity(left: &str, right: &str) -> f64 {
    let left = token_sort(left);
    let right = token_sort(right);
    if left.is_empty() || right.is_empty() {
        return 0.0;
    }
    strsim::normalized_levenshtein(&left, &right)
}

pub fn meets_threshold(score: f64, threshold: f64) -> bool {
    score + SCORE_EPSILON >= threshold
}

fn token_sort(name: &str) -> String {
    let cleaned: String = name
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();
    let mut tokens: Vec<&str> = cleaned.split_whitespace().collect();
    tokens.sort_unstable();
    tokens.join(" ")
}

/// Extracts committers from a `KEYS` roster.
///
/// Key blocks start at `pub` lines. Blocks without a usable `uid` are skipped;
/// several keys under one name fold into one identity.
pub fn parse_roster(document: &str) -> Vec<CommitterIdentity> {
    let mut by_name: BTreeMap<String, CommitterIdentity> = BTreeMap::new();

    for block in key_blocks(document) {
        let mut uids = block.iter().filter_map(|line| {
            let caps = UID_LINE.captures(line)?;
            let email = caps[2].trim().to_lowercase();
            email.contains('@').then(|| (caps[1].to_string(), email))
        });

        let Some((raw_name, first_email)) = uids.next() else {
            continue;
        };
        let name = clean_uid_name(&raw_name);
        if name.is_empty() {
            continue;
        }

        let mut emails: BTreeSet<String> = BTreeSet::from([first_email]);
        emails.extend(uids.map(|(_, email)| email));
        let key_id = key_id(&block);

        by_name
            .entry(name.clone())
            .and_modify(|existing| existing.email_aliases.extend(emails.iter().cloned()))
            .or_insert(CommitterIdentity {
                canonical_name: name,
                email_aliases: emails,
                source_key_id: key_id,
            });
    }

    by_name.into_values().collect()
}

fn key_blocks(document: &str) -> Vec<Vec<&str>> {
    let mut blocks: Vec<Vec<&str>> = Vec::new();
    for line in document.lines() {
        let line = line.trim_end();
        if is_pub_line(line) {
            blocks.push(vec![line]);
        } else if let Some(block) = blocks.last_mut() {
            block.push(line);
        }
    }
    blocks
}

fn is_pub_line(line: &str) -> bool {
    line.strip_prefix("pub")
        .is_some_and(|rest| rest.starts_with(char::is_whitespace))
}

fn clean_uid_name(raw: &str) -> String {
    let name = BRACKETED.replace_all(raw, "");
    let name = PARENTHESISED.replace_all(&name, "");
    name.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// `pub 4096R/99369B56 …` carries the id inline; newer listings put the
/// fingerprint on the following line.
fn key_id(block: &[&str]) -> Option<String> {
    let pub_line = block.first()?;
    if let Some(inline) = pub_line
        .split_whitespace()
        .nth(1)
        .and_then(|algo| algo.split_once('/'))
        .map(|(_, id)| id.to_string())
    {
        return Some(inline);
    }
    block
        .get(1)
        .map(|line| line.trim())
        .filter(|line| line.len() >= 16 && line.chars().all(|c| c.is_ascii_hexdigit()))
        .map(str::to_string)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RosterCache {
    #[serde(with = "time::serde::rfc3339")]
    pub captured_at: OffsetDateTime,
    pub source_url: String,
    pub committers: Vec<CommitterIdentity>,
}

impl RosterCache {
    pub fn read(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(path)?;
        let cache = serde_json::from_str(&raw)
            .with_context(|| format!("Unreadable roster cache {}", path.display()))?;
        Ok(Some(cache))
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn is_stale(&self, now: OffsetDateTime, ttl: Duration) -> bool {
        now - self.captured_at > ttl
    }
}

pub fn refresh_roster(
    fetcher: &dyn RosterFetcher,
    url: &str,
    cache_path: &Path,
    now: OffsetDateTime,
) -> Result<RosterCache> {
    info!(url, "downloading committer roster");
    let document = fetcher.fetch_roster(url)?;
    let committers = parse_roster(&document);
    if committers.is_empty() {
        warn!(url, "committer roster yielded no identities");
    }
    let cache = RosterCache {
        captured_at: now,
        source_url: url.to_string(),
        committers,
    };
    cache.write(cache_path)?;
    info!(count = cache.committers.len(), path = %cache_path.display(), "saved committer roster");
    Ok(cache)
}

/// Resolver for one ingestion run.
///
/// Uses the cache while it is younger than `ttl`, otherwise refetches. Never
/// fails: a failed refresh falls back to the stale cache, and with no cache at
/// all to a resolver that matches nobody.
pub fn load_resolver(
    fetcher: &dyn RosterFetcher,
    url: &str,
    cache_path: &Path,
    ttl: Duration,
    threshold: f64,
    now: OffsetDateTime,
) -> IdentityResolver {
    let cached = match RosterCache::read(cache_path) {
        Ok(cached) => cached,
        Err(err) => {
            warn!(error = %err, "ignoring unreadable roster cache");
            None
        }
    };

    if let Some(cache) = &cached {
        if !cache.is_stale(now, ttl) {
            info!(count = cache.committers.len(), "using cached committer roster");
            return IdentityResolver::new(cache.committers.clone(), threshold);
        }
    }

    match refresh_roster(fetcher, url, cache_path, now) {
        Ok(cache) => IdentityResolver::new(cache.committers, threshold),
        Err(err) => match cached {
            Some(cache) => {
                warn!(error = %err, "roster refresh failed; using stale cache");
                IdentityResolver::new(cache.committers, threshold)
            }
            None => {
                warn!(error = %err, "no committer roster available; unmarked votes are non-binding");
                IdentityResolver::new(Vec::new(), threshold)
            }
        },
    }
}
