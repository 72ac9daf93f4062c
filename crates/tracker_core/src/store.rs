use rusqlite::{params, Connection, OptionalExtension};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::error::StoreError;
use crate::schema::{
    ArchiveUnit, IngestMetadata, MentionKey, MentionRecord, MentionRow, MentionType, ProposalRef,
    Sender, VoteCast,
};

pub const STORE_FILE: &str = "mentions.db";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    pub added: usize,
    pub replaced: usize,
    pub unchanged: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MentionStore {
    records: BTreeMap<MentionKey, MentionRecord>,
}

impl MentionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_records(records: impl IntoIterator<Item = MentionRecord>) -> Self {
        let mut store = Self::new();
        store.merge(records);
        store
    }

    /// Folds `incoming` into the store.
    ///
    /// On a key collision the incoming record replaces the existing one only
    /// when its timestamp or vote differs, so merging the same records twice
    /// leaves the store unchanged.
    pub fn merge(&mut self, incoming: impl IntoIterator<Item = MentionRecord>) -> MergeStats {
        let mut stats = MergeStats::default();
        for record in incoming {
            let key = record.key();
            match self.records.get(&key) {
                None => {
                    self.records.insert(key, record);
                    stats.added += 1;
                }
                Some(existing)
                    if existing.timestamp != record.timestamp || existing.vote != record.vote =>
                {
                    self.records.insert(key, record);
                    stats.replaced += 1;
                }
                Some(_) => stats.unchanged += 1,
            }
        }
        stats
    }

    pub fn records(&self) -> impl Iterator<Item = &MentionRecord> {
        self.records.values()
    }

    pub fn get(&self, key: &MentionKey) -> Option<&MentionRecord> {
        self.records.get(key)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn counts_by_type(&self) -> BTreeMap<String, usize> {
        let mut counts: BTreeMap<String, usize> = MentionType::ALL
            .iter()
            .map(|mention_type| (mention_type.to_string(), 0))
            .collect();
        for record in self.records.values() {
            *counts.entry(record.mention_type.to_string()).or_default() += 1;
        }
        counts
    }

    pub fn rows(&self) -> Result<Vec<MentionRow>, StoreError> {
        self.records.values().map(to_row).collect()
    }
}

pub fn to_row(record: &MentionRecord) -> Result<MentionRow, StoreError> {
    Ok(MentionRow {
        proposal_id: record.proposal.to_string(),
        message_id: record.message_id.clone(),
        mention_type: record.mention_type.to_string(),
        timestamp: record.timestamp.format(&Rfc3339)?,
        sender_name: record.sender.name.clone(),
        sender_email: record.sender.email.clone(),
        vote_value: record.vote.map(|vote| vote.value.to_string()),
        is_binding: record.vote.map(|vote| vote.is_binding),
        archive_unit: record.archive_unit.to_string(),
    })
}

pub fn from_row(row: MentionRow) -> Result<MentionRecord, String> {
    let vote = match (row.vote_value.as_deref(), row.is_binding) {
        (Some(value), Some(is_binding)) => Some(VoteCast {
            value: value.parse().map_err(|err| format!("{err}"))?,
            is_binding,
        }),
        (None, None) => None,
        _ => return Err(format!("half-set vote on message {}", row.message_id)),
    };
    Ok(MentionRecord {
        proposal: row.proposal_id.parse::<ProposalRef>().map_err(|err| err.to_string())?,
        mention_type: row.mention_type.parse::<MentionType>().map_err(|err| err.to_string())?,
        timestamp: OffsetDateTime::parse(&row.timestamp, &Rfc3339).map_err(|err| err.to_string())?,
        sender: Sender {
            name: row.sender_name,
            email: row.sender_email,
        },
        vote,
        archive_unit: row.archive_unit.parse::<ArchiveUnit>().map_err(|err| err.to_string())?,
        message_id: row.message_id,
    })
}

pub fn open(path: &Path) -> Result<Connection, StoreError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let corrupt = |err: rusqlite::Error| StoreError::Corrupt {
        path: path.to_path_buf(),
        reason: err.to_string(),
    };
    let conn = Connection::open(path).map_err(corrupt)?;
    conn.pragma_update(None, "journal_mode", "WAL").map_err(corrupt)?;
    conn.pragma_update(None, "synchronous", "NORMAL").map_err(corrupt)?;
    init(&conn).map_err(corrupt)?;
    Ok(conn)
}

fn discard(path: &Path) -> Result<(), StoreError> {
    remove_files(path, &["", "-wal", "-shm"])
}

fn remove_files(path: &Path, suffixes: &[&str]) -> Result<(), StoreError> {
    for suffix in suffixes {
        let mut file = path.as_os_str().to_owned();
        file.push(suffix);
        match fs::remove_file(&file) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

pub fn staging_path(path: &Path) -> PathBuf {
    let mut staged = path.as_os_str().to_owned();
    staged.push(".new");
    PathBuf::from(staged)
}

/// Writes `store` to a sibling file and renames it over `path`.
///
/// Until the rename the database at `path` is untouched, whatever state it is
/// in, so a failed or interrupted write leaves it loadable.
pub fn replace(path: &Path, store: &MentionStore, metadata: &IngestMetadata) -> Result<(), StoreError> {
    let staged = staging_path(path);
    discard(&staged)?;

    let written = open(&staged).and_then(|mut conn| {
        save(&mut conn, store, metadata)?;
        conn.execute_batch("PRAGMA journal_mode=DELETE;")?;
        Ok(())
    });
    if let Err(err) = written {
        let _ = discard(&staged);
        return Err(err);
    }

    remove_files(path, &["-wal", "-shm"])?;
    fs::rename(&staged, path)?;
    Ok(())
}

fn init(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS mentions (
          proposal_id TEXT NOT NULL,
          message_id TEXT NOT NULL,
          mention_type TEXT NOT NULL,
          timestamp TEXT NOT NULL,
          sender_name TEXT NOT NULL,
          sender_email TEXT NOT NULL,
          vote_value TEXT,
          is_binding INTEGER,
          archive_unit TEXT NOT NULL,
          PRIMARY KEY (message_id, proposal_id, mention_type)
        );

        CREATE INDEX IF NOT EXISTS idx_mentions_proposal ON mentions(proposal_id);

        CREATE TABLE IF NOT EXISTS ingest_metadata (
          project TEXT PRIMARY KEY,
          last_success_at TEXT,
          units_json TEXT NOT NULL,
          counts_json TEXT NOT NULL
        );
        "#,
    )
}

pub fn load(conn: &Connection, path: &Path) -> Result<MentionStore, StoreError> {
    let corrupt = |reason: String| StoreError::Corrupt {
        path: path.to_path_buf(),
        reason,
    };

    let rows = query_rows(conn).map_err(|err| corrupt(err.to_string()))?;
    let mut store = MentionStore::new();
    for row in rows {
        let record = from_row(row).map_err(&corrupt)?;
        store.records.insert(record.key(), record);
    }
    Ok(store)
}

pub fn query_rows(conn: &Connection) -> rusqlite::Result<Vec<MentionRow>> {
    let mut stmt = conn.prepare(
        r#"
        SELECT proposal_id, message_id, mention_type, timestamp,
               sender_name, sender_email, vote_value, is_binding, archive_unit
        FROM mentions
        ORDER BY message_id, proposal_id, mention_type
        "#,
    )?;
    let rows = stmt.query_map([], |row| {
        Ok(MentionRow {
            proposal_id: row.get(0)?,
            message_id: row.get(1)?,
            mention_type: row.get(2)?,
            timestamp: row.get(3)?,
            sender_name: row.get(4)?,
            sender_email: row.get(5)?,
            vote_value: row.get(6)?,
            is_binding: row.get(7)?,
            archive_unit: row.get(8)?,
        })
    })?;
    rows.collect()
}

pub fn save(
    conn: &mut Connection,
    store: &MentionStore,
    metadata: &IngestMetadata,
) -> Result<(), StoreError> {
    let rows = store.rows()?;
    let tx = conn.transaction()?;
    tx.execute("DELETE FROM mentions", [])?;
    {
        let mut insert = tx.prepare(
            r#"
            INSERT INTO mentions (
              proposal_id, message_id, mention_type, timestamp,
              sender_name, sender_email, vote_value, is_binding, archive_unit
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
        )?;
        for row in &rows {
            insert.execute(params![
                row.proposal_id,
                row.message_id,
                row.mention_type,
                row.timestamp,
                row.sender_name,
                row.sender_email,
                row.vote_value,
                row.is_binding,
                row.archive_unit
            ])?;
        }
    }
    upsert_metadata(&tx, metadata)?;
    tx.commit()?;
    Ok(())
}

fn upsert_metadata(conn: &Connection, metadata: &IngestMetadata) -> Result<(), StoreError> {
    let last_success_at = metadata
        .last_success_at
        .map(|at| at.format(&Rfc3339))
        .transpose()?;
    let units: Vec<String> = metadata.units_covered.iter().map(ToString::to_string).collect();
    let units_json = serde_json::to_string(&units)?;
    let counts_json = serde_json::to_string(&metadata.counts_by_type)?;

    conn.execute(
        r#"
        INSERT INTO ingest_metadata (project, last_success_at, units_json, counts_json)
        VALUES (?1, ?2, ?3, ?4)
        ON CONFLICT(project) DO UPDATE SET
          last_success_at=excluded.last_success_at,
          units_json=excluded.units_json,
          counts_json=excluded.counts_json
        "#,
        params![metadata.project, last_success_at, units_json, counts_json],
    )?;
    Ok(())
}

pub fn load_metadata(conn: &Connection, project: &str) -> Result<Option<IngestMetadata>, StoreError> {
    let found = conn
        .query_row(
            "SELECT last_success_at, units_json, counts_json FROM ingest_metadata WHERE project = ?1",
            params![project],
            |row| {
                Ok((
                    row.get::<_, Option<String>>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            },
        )
        .optional()?;

    let Some((last_success_at, units_json, counts_json)) = found else {
        return Ok(None);
    };

    let units: Vec<String> = serde_json::from_str(&units_json)?;
    let units_covered = units
        .iter()
        .map(|unit| unit.parse::<ArchiveUnit>())
        .collect::<Result<BTreeSet<_>, _>>()
        .map_err(|err| StoreError::Corrupt {
            path: conn.path().unwrap_or_default().into(),
            reason: err.to_string(),
        })?;
    let counts_by_type: BTreeMap<String, usize> = serde_json::from_str(&counts_json)?;
    let last_success_at = last_success_at
        .map(|at| OffsetDateTime::parse(&at, &Rfc3339))
        .transpose()
        .map_err(|err| StoreError::Corrupt {
            path: conn.path().unwrap_or_default().into(),
            reason: err.to_string(),
        })?;

    Ok(Some(IngestMetadata {
        project: project.to_string(),
        last_success_at,
        units_covered,
        record_count: counts_by_type.values().sum(),
        counts_by_type,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::VoteValue;
    use time::macros::datetime;

    fn record(message_id: &str, number: u32, mention_type: MentionType) -> MentionRecord {
        MentionRecord {
            proposal: ProposalRef::new("KIP", number),
            message_id: message_id.to_string(),
            mention_type,
            timestamp: datetime!(2026-02-03 10:00 UTC),
            sender: Sender {
                name: "Alice Johnson".into(),
                email: "alice@apache.org".into(),
            },
            vote: None,
            archive_unit: ArchiveUnit::new("dev", "kafka.apache.org", 2026, 2),
        }
    }

    #[test]
    fn merge_is_idempotent() {
        let batch = vec![
            record("m1", 500, MentionType::Vote),
            record("m1", 501, MentionType::Body),
            record("m2", 500, MentionType::Vote),
        ];
        let mut store = MentionStore::new();
        let first = store.merge(batch.clone());
        let snapshot = store.clone();
        let second = store.merge(batch);

        assert_eq!(first.added, 3);
        assert_eq!(second, MergeStats { added: 0, replaced: 0, unchanged: 3 });
        assert_eq!(store, snapshot);
    }

    #[test]
    fn collision_replaces_only_on_changed_timestamp_or_vote() {
        let mut store = MentionStore::from_records([record("m1", 500, MentionType::Vote)]);

        let mut renamed = record("m1", 500, MentionType::Vote);
        renamed.sender.name = "A. Johnson".into();
        assert_eq!(store.merge([renamed]).unchanged, 1);

        let mut voted = record("m1", 500, MentionType::Vote);
        voted.vote = Some(VoteCast { value: VoteValue::PlusOne, is_binding: true });
        assert_eq!(store.merge([voted.clone()]).replaced, 1);
        assert_eq!(store.get(&voted.key()), Some(&voted));
        assert_eq!(store.records().next().map(|r| r.sender.name.as_str()), Some("Alice Johnson"));
    }

    #[test]
    fn same_message_keeps_distinct_mention_types() {
        let store = MentionStore::from_records([
            record("m1", 500, MentionType::Vote),
            record("m1", 500, MentionType::Body),
        ]);
        assert_eq!(store.len(), 2);
        assert_eq!(store.counts_by_type()["vote"], 1);
        assert_eq!(store.counts_by_type()["discuss"], 0);
    }

    #[test]
    fn save_then_load_restores_records_and_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(STORE_FILE);
        let mut voted = record("m1", 500, MentionType::Vote);
        voted.vote = Some(VoteCast { value: VoteValue::MinusOne, is_binding: false });
        let store = MentionStore::from_records([voted, record("m2", 7, MentionType::Subject)]);

        let mut metadata = IngestMetadata::new("kafka");
        metadata.last_success_at = Some(datetime!(2026-02-04 00:00 UTC));
        metadata.units_covered.insert(ArchiveUnit::new("dev", "kafka.apache.org", 2026, 2));
        metadata.counts_by_type = store.counts_by_type();
        metadata.record_count = store.len();

        let mut conn = open(&path).unwrap();
        save(&mut conn, &store, &metadata).unwrap();
        drop(conn);

        let conn = open(&path).unwrap();
        assert_eq!(load(&conn, &path).unwrap(), store);
        assert_eq!(load_metadata(&conn, "kafka").unwrap(), Some(metadata));
        assert_eq!(load_metadata(&conn, "flink").unwrap(), None);
    }

    #[test]
    fn save_replaces_previous_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(STORE_FILE);
        let mut conn = open(&path).unwrap();
        let metadata = IngestMetadata::new("kafka");

        save(&mut conn, &MentionStore::from_records([record("old", 1, MentionType::Body)]), &metadata).unwrap();
        save(&mut conn, &MentionStore::from_records([record("new", 2, MentionType::Body)]), &metadata).unwrap();

        let loaded = load(&conn, &path).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded.records().next().unwrap().message_id, "new");
    }

    #[test]
    fn unreadable_file_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(STORE_FILE);
        fs::write(&path, "not a sqlite database\n".repeat(1024)).unwrap();
        assert!(matches!(open(&path), Err(StoreError::Corrupt { .. })));

        discard(&path).unwrap();
        assert!(open(&path).unwrap().is_autocommit());
    }

    #[test]
    fn replace_swaps_in_the_new_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(STORE_FILE);
        let metadata = IngestMetadata::new("kafka");
        let mut conn = open(&path).unwrap();
        save(&mut conn, &MentionStore::from_records([record("old", 1, MentionType::Body)]), &metadata).unwrap();
        drop(conn);

        let fresh = MentionStore::from_records([record("new", 2, MentionType::Body)]);
        replace(&path, &fresh, &metadata).unwrap();

        assert!(!staging_path(&path).exists());
        let conn = open(&path).unwrap();
        assert_eq!(load(&conn, &path).unwrap(), fresh);
    }

    #[test]
    fn failed_replace_keeps_the_old_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(STORE_FILE);
        let metadata = IngestMetadata::new("kafka");
        let old = MentionStore::from_records([record("old", 1, MentionType::Body)]);
        let mut conn = open(&path).unwrap();
        save(&mut conn, &old, &metadata).unwrap();
        drop(conn);

        // a directory squatting on the staging file blocks the write
        fs::create_dir_all(staging_path(&path).join("busy")).unwrap();
        let fresh = MentionStore::from_records([record("new", 2, MentionType::Body)]);
        assert!(replace(&path, &fresh, &metadata).is_err());

        let conn = open(&path).unwrap();
        assert_eq!(load(&conn, &path).unwrap(), old);
    }

    #[test]
    fn undecodable_row_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(STORE_FILE);
        let conn = open(&path).unwrap();
        conn.execute(
            "INSERT INTO mentions VALUES ('KIP-1', 'm1', 'shouting', '2026-02-03T10:00:00Z', 'a', 'a@x', NULL, NULL, 'dev@kafka.apache.org/2026-02')",
            [],
        )
        .unwrap();
        assert!(matches!(load(&conn, &path), Err(StoreError::Corrupt { .. })));
    }
}
