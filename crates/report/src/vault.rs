use anyhow::{anyhow, Result};
use rusqlite::Connection;
use std::fs;
use std::path::{Path, PathBuf};
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;
use time::OffsetDateTime;

use tracker_core::aggregate::{format_age, summarize, ActivityStatus, ProposalSummary};
use tracker_core::schema::{MentionType, VoteValue};
use tracker_core::store::{from_row, query_rows};

const DAY_FORMAT: &[BorrowedFormatItem<'static>] = format_description!("[year]-[month]-[day]");
const GENERATED_NOTICE: &str = "This index is generated. Do not edit manually.";

pub struct VaultPaths {
    pub root: PathBuf,
    pub index_dir: PathBuf,
    pub proposals_dir: PathBuf,
}

impl VaultPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            index_dir: root.join("00_Index"),
            proposals_dir: root.join("Proposals"),
            root,
        }
    }

    pub fn ensure(&self) -> Result<()> {
        fs::create_dir_all(&self.index_dir)?;
        fs::create_dir_all(&self.proposals_dir)?;
        Ok(())
    }
}

/// Writes one note per proposal plus the status-grouped index.
///
/// Returns the number of proposal notes written.
pub fn build_report(conn: &Connection, root: &Path, now: OffsetDateTime) -> Result<usize> {
    let paths = VaultPaths::new(root);
    paths.ensure()?;

    let records = query_rows(conn)?
        .into_iter()
        .map(|row| from_row(row).map_err(|reason| anyhow!("Unreadable mention row: {reason}")))
        .collect::<Result<Vec<_>>>()?;
    let summaries = summarize(&records, now);

    // 1) Proposal notes
    for summary in &summaries {
        write_proposal_note(&paths, summary, now)?;
    }

    // 2) MOC grouped by activity status
    let mut index_lines: Vec<String> = Vec::new();
    index_lines.push("# MOC - Proposals".to_string());
    index_lines.push(String::new());
    index_lines.push(GENERATED_NOTICE.to_string());
    index_lines.push(String::new());

    for status in ActivityStatus::ALL {
        index_lines.push(format!("## {}", title_case(status.as_str())));
        index_lines.push(String::new());
        let mut group: Vec<&ProposalSummary> = summaries.iter().filter(|s| s.status == status).collect();
        group.sort_by(|a, b| b.last_activity.cmp(&a.last_activity).then_with(|| a.proposal.cmp(&b.proposal)));
        if group.is_empty() {
            index_lines.push("_No proposals._".to_string());
        }
        for summary in group {
            let id = summary.proposal.to_string();
            index_lines.push(format!(
                "- [[Proposals/{id}|{id}]] (last activity {} ago)",
                format_age(summary.last_activity, now)
            ));
        }
        index_lines.push(String::new());
    }

    let moc_path = paths.index_dir.join("MOC - Proposals.md");
    fs::write(moc_path, index_lines.join("\n"))?;

    Ok(summaries.len())
}

fn write_proposal_note(paths: &VaultPaths, summary: &ProposalSummary, now: OffsetDateTime) -> Result<()> {
    let id = summary.proposal.to_string();
    let note_path = paths.proposals_dir.join(format!("{id}.md"));

    let mut md = String::new();
    md.push_str("---\n");
    md.push_str(&format!("id: {id}\n"));
    md.push_str(&format!("status: {}\n", summary.status));
    md.push_str(&format!("last_activity: {}\n", summary.last_activity.format(DAY_FORMAT)?));
    md.push_str(&format!("mentions: {}\n", summary.mention_count));
    md.push_str("---\n\n");

    md.push_str(&format!("# {id}\n\n"));

    md.push_str("## Activity\n");
    md.push_str(&format!("- Status: `{}`\n", summary.status));
    md.push_str(&format!(
        "- Last activity: `{}` ({} ago)\n",
        summary.last_activity.format(DAY_FORMAT)?,
        format_age(summary.last_activity, now)
    ));
    for mention_type in MentionType::ALL {
        if let Some(at) = summary.latest_by_type.get(&mention_type) {
            md.push_str(&format!("- Last {mention_type} mention: `{}`\n", at.format(DAY_FORMAT)?));
        }
    }
    md.push('\n');

    md.push_str("## Votes\n");
    if summary.votes.is_empty() {
        md.push_str("_No votes cast._\n");
    } else {
        md.push_str("| Vote | Binding | Non-binding |\n");
        md.push_str("|------|---------|-------------|\n");
        for value in VoteValue::ALL {
            md.push_str(&format!(
                "| {value} | {} | {} |\n",
                summary.votes.binding(value),
                summary.votes.non_binding(value)
            ));
        }
        for value in VoteValue::ALL {
            let voters = summary.votes.voters(value);
            if voters.is_empty() {
                continue;
            }
            md.push_str(&format!("\n### {value}\n"));
            for voter in voters {
                let name = if voter.sender.name.is_empty() {
                    &voter.sender.email
                } else {
                    &voter.sender.name
                };
                let kind = if voter.is_binding { "binding" } else { "non-binding" };
                md.push_str(&format!("- {name} ({kind}, {})\n", voter.cast_at.format(DAY_FORMAT)?));
            }
        }
    }

    fs::write(note_path, md)?;
    Ok(())
}

fn title_case(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
