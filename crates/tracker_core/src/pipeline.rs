use anyhow::Result;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::thread;
use time::{Date, Duration, OffsetDateTime};
use tracing::{info, warn};

use crate::config::ProjectConfig;
use crate::error::{FetchError, RunError};
use crate::fetch::{ArchiveFetcher, DirArchiveFetcher};
use crate::identity::IdentityResolver;
use crate::ingest::{Ingestor, UnitOutcome};
use crate::mention::MentionExtractor;
use crate::schema::{ArchiveUnit, IngestMetadata};
use crate::store::{self, MentionStore, MergeStats};
use crate::vote::VoteParser;

/// Longest history `init` will plan, about a century.
pub const MAX_INIT_DAYS: i64 = 36_500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Init { days: i64 },
    Update,
    Refresh,
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunMode::Init { days } => write!(f, "init ({days} days)"),
            RunMode::Update => f.write_str("update"),
            RunMode::Refresh => f.write_str("refresh"),
        }
    }
}

pub fn months_between(from: Date, to: Date) -> Vec<(i32, u8)> {
    let mut months = Vec::new();
    let (mut year, mut month) = (from.year(), u8::from(from.month()));
    let end = (to.year(), u8::from(to.month()));
    while (year, month) <= end {
        months.push((year, month));
        if month == 12 {
            year += 1;
            month = 1;
        } else {
            month += 1;
        }
    }
    months
}

/// Archive units a run should ingest, oldest first.
///
/// `update` restarts at the newest month already covered, so a month that was
/// still growing at the previous run is fetched again in full.
pub fn plan_units(
    mode: RunMode,
    project: &ProjectConfig,
    metadata: Option<&IngestMetadata>,
    today: Date,
    cached: &[ArchiveUnit],
) -> Vec<ArchiveUnit> {
    let unit = |(year, month): (i32, u8)| {
        ArchiveUnit::new(&project.mailing_list, &project.domain, year, month)
    };
    match mode {
        RunMode::Init { days } => {
            let start = today
                .checked_sub(Duration::days(days.clamp(0, MAX_INIT_DAYS)))
                .unwrap_or(Date::MIN);
            months_between(start, today).into_iter().map(unit).collect()
        }
        RunMode::Update => {
            let start = metadata
                .and_then(IngestMetadata::latest_unit)
                .and_then(|latest| Date::from_calendar_date(latest.year, latest.month.try_into().ok()?, 1).ok())
                .filter(|start| *start <= today)
                .unwrap_or(today);
            months_between(start, today).into_iter().map(unit).collect()
        }
        RunMode::Refresh => cached.to_vec(),
    }
}

#[derive(Debug)]
pub enum UnitResult {
    Ingested(UnitOutcome),
    Empty,
    Failed(FetchError),
}

/// Fetches and ingests `units` on up to `workers` scoped threads.
///
/// Workers hand results to the calling thread over a channel; results come
/// back in the order of `units` regardless of completion order.
pub fn ingest_units(
    units: &[ArchiveUnit],
    fetcher: &dyn ArchiveFetcher,
    ingestor: &Ingestor<'_>,
    workers: usize,
) -> Vec<(ArchiveUnit, UnitResult)> {
    let next = AtomicUsize::new(0);
    let (tx, rx) = mpsc::channel::<(usize, UnitResult)>();
    let mut slots: Vec<Option<UnitResult>> = units.iter().map(|_| None).collect();

    thread::scope(|scope| {
        for _ in 0..workers.clamp(1, units.len().max(1)) {
            let tx = tx.clone();
            let next = &next;
            scope.spawn(move || {
                loop {
                    let index = next.fetch_add(1, Ordering::SeqCst);
                    let Some(unit) = units.get(index) else {
                        break;
                    };
                    let result = match fetcher.fetch(unit) {
                        Ok(Some(bytes)) => UnitResult::Ingested(ingestor.ingest_unit(unit, &bytes)),
                        Ok(None) => UnitResult::Empty,
                        Err(err) => UnitResult::Failed(err),
                    };
                    if tx.send((index, result)).is_err() {
                        break;
                    }
                }
            });
        }
        drop(tx);

        for (index, result) in rx {
            slots[index] = Some(result);
        }
    });

    units
        .iter()
        .cloned()
        .zip(slots)
        .map(|(unit, slot)| {
            let result = slot.unwrap_or(UnitResult::Failed(FetchError::Transient(
                "worker exited before reporting".to_string(),
            )));
            (unit, result)
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitReport {
    pub unit: ArchiveUnit,
    pub messages: usize,
    pub records: usize,
    pub skipped_messages: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedUnit {
    pub unit: ArchiveUnit,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub mode: RunMode,
    pub processed: Vec<UnitReport>,
    pub skipped: Vec<SkippedUnit>,
    pub messages_skipped: usize,
    pub merge: MergeStats,
    pub total_records: usize,
}

pub struct Pipeline<'a> {
    pub project: &'a ProjectConfig,
    pub store_path: PathBuf,
    pub remote: &'a dyn ArchiveFetcher,
    pub local: &'a DirArchiveFetcher,
    pub resolver: &'a IdentityResolver,
    pub workers: usize,
    pub vote_scan_lines: usize,
}

impl Pipeline<'_> {
    /// Runs one ingestion and swaps the merged store in with one rename.
    ///
    /// Nothing is written unless at least one unit was processed. `init` and
    /// `update` fail on an unreadable store; `refresh` replaces it.
    pub fn run(&self, mode: RunMode, now: OffsetDateTime) -> Result<RunSummary> {
        info!(project = %self.project.key, mode = %mode, "starting ingestion run");

        let (base, metadata) = match mode {
            RunMode::Init { .. } => {
                if self.store_path.exists() {
                    let conn = store::open(&self.store_path)?;
                    store::load(&conn, &self.store_path)?;
                }
                (MentionStore::new(), IngestMetadata::new(&self.project.key))
            }
            RunMode::Update => {
                if !self.store_path.exists() {
                    return Err(RunError::StoreMissing(self.store_path.clone()).into());
                }
                let conn = store::open(&self.store_path)?;
                let existing = store::load(&conn, &self.store_path)?;
                let metadata = store::load_metadata(&conn, &self.project.key)?
                    .unwrap_or_else(|| IngestMetadata::new(&self.project.key));
                (existing, metadata)
            }
            RunMode::Refresh => (MentionStore::new(), IngestMetadata::new(&self.project.key)),
        };

        let cached = match mode {
            RunMode::Refresh => self
                .local
                .cached_units(&self.project.mailing_list, &self.project.domain)?,
            _ => Vec::new(),
        };
        let units = plan_units(mode, self.project, Some(&metadata), now.date(), &cached);
        info!(units = units.len(), "planned archive units");

        let extractor = MentionExtractor::new(&self.project.prefix)?;
        let ingestor = Ingestor {
            extractor: &extractor,
            resolver: self.resolver,
            votes: VoteParser::new(self.vote_scan_lines),
        };
        let fetcher: &dyn ArchiveFetcher = match mode {
            RunMode::Refresh => self.local,
            _ => self.remote,
        };
        let results = ingest_units(&units, fetcher, &ingestor, self.workers);

        let mut merged = base;
        let mut merge = MergeStats::default();
        let mut processed = Vec::new();
        let mut skipped = Vec::new();
        let mut messages_skipped = 0;

        for (unit, result) in results {
            match result {
                UnitResult::Ingested(outcome) => {
                    let report = UnitReport {
                        unit: unit.clone(),
                        messages: outcome.messages,
                        records: outcome.records.len(),
                        skipped_messages: outcome.skipped.len(),
                    };
                    info!(
                        unit = %unit,
                        messages = report.messages,
                        records = report.records,
                        skipped = report.skipped_messages,
                        "ingested archive unit"
                    );
                    messages_skipped += outcome.skipped.len();
                    let stats = merged.merge(outcome.records);
                    merge.added += stats.added;
                    merge.replaced += stats.replaced;
                    merge.unchanged += stats.unchanged;
                    processed.push(report);
                }
                UnitResult::Empty => {
                    info!(unit = %unit, "archive unit is empty");
                    processed.push(UnitReport {
                        unit,
                        messages: 0,
                        records: 0,
                        skipped_messages: 0,
                    });
                }
                UnitResult::Failed(err) => {
                    warn!(unit = %unit, error = %err, "skipping archive unit");
                    skipped.push(SkippedUnit {
                        unit,
                        reason: err.to_string(),
                    });
                }
            }
        }

        if processed.is_empty() {
            return Err(RunError::NoUnitsProcessed {
                skipped: skipped.len(),
            }
            .into());
        }

        let mut metadata = metadata;
        metadata.last_success_at = Some(now);
        metadata
            .units_covered
            .extend(processed.iter().map(|report| report.unit.clone()));
        metadata.record_count = merged.len();
        metadata.counts_by_type = merged.counts_by_type();

        store::replace(&self.store_path, &merged, &metadata)?;

        info!(
            project = %self.project.key,
            processed = processed.len(),
            skipped = skipped.len(),
            records = merged.len(),
            "ingestion run complete"
        );

        Ok(RunSummary {
            mode,
            processed,
            skipped,
            messages_skipped,
            merge,
            total_records: merged.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::date;

    fn kafka() -> ProjectConfig {
        ProjectConfig {
            key: "kafka".into(),
            prefix: "KIP".into(),
            mailing_list: "dev".into(),
            domain: "kafka.apache.org".into(),
            keys_url: "https://downloads.apache.org/kafka/KEYS".into(),
        }
    }

    fn unit(year: i32, month: u8) -> ArchiveUnit {
        ArchiveUnit::new("dev", "kafka.apache.org", year, month)
    }

    #[test]
    fn months_cross_year_boundary() {
        assert_eq!(
            months_between(date!(2025 - 11 - 20), date!(2026 - 02 - 01)),
            vec![(2025, 11), (2025, 12), (2026, 1), (2026, 2)]
        );
        assert_eq!(months_between(date!(2026 - 02 - 10), date!(2026 - 02 - 11)), vec![(2026, 2)]);
        assert!(months_between(date!(2026 - 03 - 01), date!(2026 - 02 - 01)).is_empty());
    }

    #[test]
    fn init_covers_every_month_touching_the_window() {
        let units = plan_units(RunMode::Init { days: 60 }, &kafka(), None, date!(2026 - 02 - 15), &[]);
        assert_eq!(units, vec![unit(2025, 12), unit(2026, 1), unit(2026, 2)]);
    }

    #[test]
    fn init_window_is_clamped() {
        let units = plan_units(RunMode::Init { days: i64::MAX }, &kafka(), None, date!(2026 - 02 - 15), &[]);
        assert_eq!(units.first().map(|unit| unit.year), Some(1926));
        assert_eq!(units.last(), Some(&unit(2026, 2)));

        let units = plan_units(RunMode::Init { days: -5 }, &kafka(), None, date!(2026 - 02 - 15), &[]);
        assert_eq!(units, vec![unit(2026, 2)]);
    }

    #[test]
    fn update_without_history_is_the_current_month() {
        let units = plan_units(RunMode::Update, &kafka(), None, date!(2026 - 02 - 15), &[]);
        assert_eq!(units, vec![unit(2026, 2)]);
    }

    #[test]
    fn update_restarts_at_latest_covered_month() {
        let mut metadata = IngestMetadata::new("kafka");
        metadata.units_covered.insert(unit(2025, 12));
        metadata.units_covered.insert(unit(2026, 1));
        let units = plan_units(RunMode::Update, &kafka(), Some(&metadata), date!(2026 - 02 - 15), &[]);
        assert_eq!(units, vec![unit(2026, 1), unit(2026, 2)]);

        metadata.units_covered.insert(unit(2026, 2));
        let units = plan_units(RunMode::Update, &kafka(), Some(&metadata), date!(2026 - 02 - 20), &[]);
        assert_eq!(units, vec![unit(2026, 2)]);
    }

    #[test]
    fn refresh_uses_cached_units() {
        let cached = vec![unit(2024, 5), unit(2026, 1)];
        let units = plan_units(RunMode::Refresh, &kafka(), None, date!(2026 - 02 - 15), &cached);
        assert_eq!(units, cached);
    }
}
