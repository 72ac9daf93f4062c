use anyhow::Result;
use clap::{Parser, Subcommand};
use schemars::schema_for;
use std::fs;
use std::path::{Path, PathBuf};
use time::{Duration, OffsetDateTime};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tracker_core::config::{ProjectConfig, Settings};
use tracker_core::fetch::{
    CachingFetcher, DirArchiveFetcher, HttpArchiveFetcher, HttpRosterFetcher, RetryPolicy,
};
use tracker_core::identity::{load_resolver, refresh_roster, RosterCache};
use tracker_core::pipeline::{Pipeline, RunMode, RunSummary, MAX_INIT_DAYS};
use tracker_core::store;

#[derive(Parser)]
#[command(name = "tracker")]
#[command(about = "Improvement-proposal mention and vote tracker", long_about = None)]
struct Cli {
    /// Directory holding tracker.toml and projects.yaml
    #[arg(long, global = true, default_value = "config")]
    config_dir: PathBuf,

    /// Project key from projects.yaml
    #[arg(long, global = true, default_value = "kafka")]
    project: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest recent history into a fresh mention store
    Init {
        /// Days of history (default: ingest.default_days)
        #[arg(long, value_parser = clap::value_parser!(i64).range(0..=MAX_INIT_DAYS))]
        days: Option<i64>,
    },
    /// Re-fetch the current month and merge it into the store
    Update,
    /// Rebuild the store from locally cached archives
    Refresh,
    /// Committer roster maintenance
    Keys {
        #[command(subcommand)]
        command: KeysCommands,
    },
    /// Show ingestion metadata for the project
    Status,
    /// Write the mention table as JSON rows
    Export {
        #[arg(long)]
        out: PathBuf,
    },
    /// Render per-proposal notes and the status index
    Report {
        #[arg(long, default_value = "vault")]
        out_dir: PathBuf,
    },
    /// Export canonical JSON Schemas to the ./schemas directory
    Schema {
        #[command(subcommand)]
        command: SchemaCommands,
    },
}

#[derive(Subcommand)]
enum KeysCommands {
    /// Download the roster now, ignoring the cache age
    Refresh,
    /// Show the cached roster
    Info,
}

#[derive(Subcommand)]
enum SchemaCommands {
    /// Export JSON Schema files for canonical types
    Export {
        /// Output directory (default: ./schemas)
        #[arg(long, default_value = "schemas")]
        out_dir: PathBuf,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    if let Commands::Schema { command } = &cli.command {
        return match command {
            SchemaCommands::Export { out_dir } => schema_export(out_dir),
        };
    }

    let settings = Settings::load_from_dir(&cli.config_dir)?;
    let project = settings.project(&cli.project)?;

    match cli.command {
        Commands::Init { days } => {
            let days = days.unwrap_or(settings.config.ingest.default_days);
            ingest(&settings, project, RunMode::Init { days })
        }
        Commands::Update => ingest(&settings, project, RunMode::Update),
        Commands::Refresh => ingest(&settings, project, RunMode::Refresh),
        Commands::Keys { command } => match command {
            KeysCommands::Refresh => keys_refresh(&settings, project),
            KeysCommands::Info => keys_info(&settings, project),
        },
        Commands::Status => status(&settings, project),
        Commands::Export { out } => export(&settings, project, &out),
        Commands::Report { out_dir } => render_report(&settings, project, &out_dir),
        Commands::Schema { .. } => Ok(()),
    }
}

fn retry_policy(settings: &Settings) -> RetryPolicy {
    RetryPolicy {
        max_attempts: settings.config.general.fetch_attempts,
        base_backoff_ms: settings.config.general.retry_backoff_ms,
    }
}

fn ingest(settings: &Settings, project: &ProjectConfig, mode: RunMode) -> Result<()> {
    let general = &settings.config.general;
    let identity = &settings.config.identity;
    let now = OffsetDateTime::now_utc();

    let roster = HttpRosterFetcher::new(general.http_timeout_secs, retry_policy(settings))?;
    let resolver = load_resolver(
        &roster,
        &project.keys_url,
        &settings.roster_path(project),
        Duration::days(identity.roster_ttl_days),
        identity.name_match_threshold,
        now,
    );

    let archives_dir = settings.archives_dir(project);
    let remote = CachingFetcher::new(
        HttpArchiveFetcher::new(general.http_timeout_secs, retry_policy(settings))?,
        &archives_dir,
    );
    let local = DirArchiveFetcher::new(&archives_dir);

    let pipeline = Pipeline {
        project,
        store_path: settings.store_path(project),
        remote: &remote,
        local: &local,
        resolver: &resolver,
        workers: general.workers,
        vote_scan_lines: settings.config.ingest.vote_scan_lines,
    };
    let summary = pipeline.run(mode, now)?;
    print_summary(&summary);
    Ok(())
}

fn print_summary(summary: &RunSummary) {
    println!("Run: {}", summary.mode);
    println!("Units processed: {}", summary.processed.len());
    for unit in &summary.processed {
        println!(
            "  {}: {} messages, {} records, {} skipped",
            unit.unit, unit.messages, unit.records, unit.skipped_messages
        );
    }
    println!("Units skipped: {}", summary.skipped.len());
    for unit in &summary.skipped {
        println!("  {}: {}", unit.unit, unit.reason);
    }
    println!("Messages skipped: {}", summary.messages_skipped);
    println!(
        "Records merged: {} new, {} replaced, {} unchanged",
        summary.merge.added, summary.merge.replaced, summary.merge.unchanged
    );
    println!("Total records: {}", summary.total_records);
}

fn keys_refresh(settings: &Settings, project: &ProjectConfig) -> Result<()> {
    let roster = HttpRosterFetcher::new(settings.config.general.http_timeout_secs, retry_policy(settings))?;
    let cache = refresh_roster(
        &roster,
        &project.keys_url,
        &settings.roster_path(project),
        OffsetDateTime::now_utc(),
    )?;
    println!("Saved {} committers from {}", cache.committers.len(), cache.source_url);
    Ok(())
}

fn keys_info(settings: &Settings, project: &ProjectConfig) -> Result<()> {
    let path = settings.roster_path(project);
    let Some(cache) = RosterCache::read(&path)? else {
        println!("No roster cached at {}; run `keys refresh`", path.display());
        return Ok(());
    };
    let ttl = Duration::days(settings.config.identity.roster_ttl_days);
    let now = OffsetDateTime::now_utc();
    let aliases: usize = cache.committers.iter().map(|c| c.email_aliases.len()).sum();
    println!("Source: {}", cache.source_url);
    println!("Captured: {}", cache.captured_at);
    println!("Stale: {}", if cache.is_stale(now, ttl) { "yes" } else { "no" });
    println!("Committers: {}", cache.committers.len());
    println!("Email aliases: {aliases}");
    Ok(())
}

fn status(settings: &Settings, project: &ProjectConfig) -> Result<()> {
    let path = settings.store_path(project);
    if !path.exists() {
        println!("No mention store for {}; run `init`", project.key);
        return Ok(());
    }
    let conn = store::open(&path)?;
    let Some(metadata) = store::load_metadata(&conn, &project.key)? else {
        println!("No successful ingestion recorded for {}", project.key);
        return Ok(());
    };

    println!("Project: {} ({})", project.key, project.prefix);
    match metadata.last_success_at {
        Some(at) => println!("Last success: {at}"),
        None => println!("Last success: never"),
    }
    let first = metadata.units_covered.iter().min_by_key(|unit| (unit.year, unit.month));
    match (first, metadata.latest_unit()) {
        (Some(first), Some(last)) => println!(
            "Units covered: {} ({} .. {})",
            metadata.units_covered.len(),
            first,
            last
        ),
        _ => println!("Units covered: 0"),
    }
    println!("Records: {}", metadata.record_count);
    for (mention_type, count) in &metadata.counts_by_type {
        println!("  {mention_type}: {count}");
    }
    Ok(())
}

fn export(settings: &Settings, project: &ProjectConfig, out: &Path) -> Result<()> {
    let path = settings.store_path(project);
    let conn = store::open(&path)?;
    let mentions = store::load(&conn, &path)?;
    let rows = mentions.rows()?;
    if let Some(parent) = out.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(out, serde_json::to_string_pretty(&rows)?)?;
    println!("Exported {} rows to {}", rows.len(), out.display());
    Ok(())
}

fn render_report(settings: &Settings, project: &ProjectConfig, out_dir: &Path) -> Result<()> {
    let conn = store::open(&settings.store_path(project))?;
    let written = report::build_report(&conn, out_dir, OffsetDateTime::now_utc())?;
    println!("Wrote {written} proposal notes to {}", out_dir.display());
    Ok(())
}

fn schema_export(out_dir: &Path) -> Result<()> {
    fs::create_dir_all(out_dir)?;

    let record_schema = schema_for!(tracker_core::schema::MentionRecord);
    let record_json = serde_json::to_string_pretty(&record_schema)?;
    fs::write(out_dir.join("MentionRecord.schema.json"), record_json)?;

    let row_schema = schema_for!(tracker_core::schema::MentionRow);
    let row_json = serde_json::to_string_pretty(&row_schema)?;
    fs::write(out_dir.join("MentionRow.schema.json"), row_json)?;

    let committer_schema = schema_for!(tracker_core::schema::CommitterIdentity);
    let committer_json = serde_json::to_string_pretty(&committer_schema)?;
    fs::write(out_dir.join("CommitterIdentity.schema.json"), committer_json)?;

    let metadata_schema = schema_for!(tracker_core::schema::IngestMetadata);
    let metadata_json = serde_json::to_string_pretty(&metadata_schema)?;
    fs::write(out_dir.join("IngestMetadata.schema.json"), metadata_json)?;

    println!("Exported schemas to {}", out_dir.display());
    Ok(())
}
