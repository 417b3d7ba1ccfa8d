use std::path::Path;

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use topic_log_core::{needs_new_record, ChannelId, StoreTimestamp, TopicRecord};

const LATEST_SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS topics (
  channel_id TEXT NOT NULL,
  text TEXT NOT NULL,
  first_seen TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
  unset TIMESTAMP
);

CREATE INDEX IF NOT EXISTS idx_topics_first_seen ON topics(first_seen);
CREATE INDEX IF NOT EXISTS idx_topics_channel_id ON topics(channel_id);
";

const SELECT_RECORD_SQL: &str = "SELECT rowid, channel_id, text, first_seen, unset FROM topics";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

/// Result of applying one observation atomically.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ChangeOutcome {
    /// The observed text matches the latest record; nothing was written.
    Unchanged { current: TopicRecord },
    /// A new open record was appended, closing the previous open record if there was one.
    Opened { record: TopicRecord, closed: Option<TopicRecord> },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoreStats {
    pub channels: i64,
    pub records: i64,
    pub open_records: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OpenRecordViolation {
    pub channel_id: ChannelId,
    pub open_records: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub open_record_violations: Vec<OpenRecordViolation>,
    pub schema_status: SchemaStatus,
}

impl SqliteStore {
    /// Open a SQLite-backed topic store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
        })
    }

    /// Create the topic schema if it does not exist yet. Safe to call on every open.
    ///
    /// # Errors
    /// Returns an error when schema creation fails or the database reports an unknown version.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        if current_schema_version(&self.conn)? == 0 {
            let tx = self.conn.transaction().context("failed to start schema transaction")?;
            tx.execute_batch(MIGRATION_001_SQL).context("failed to create topics schema")?;
            record_schema_version(&tx, 1)?;
            tx.commit().context("failed to commit schema transaction")?;
        }

        let version = current_schema_version(&self.conn)?;
        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    /// Insert a new open record for the channel with `first_seen = now`.
    ///
    /// Prior state is not inspected; callers that need the open-record invariant use
    /// [`SqliteStore::record_change`].
    ///
    /// # Errors
    /// Returns an error when the insert fails.
    pub fn append(&mut self, channel_id: &ChannelId, text: &str) -> Result<TopicRecord> {
        append_record(&self.conn, channel_id, text)
    }

    /// Close the most recent open record for the channel.
    ///
    /// Returns the closed record, or `None` when the channel has no open record.
    ///
    /// # Errors
    /// Returns an error when the update fails.
    pub fn close_latest_open(&mut self, channel_id: &ChannelId) -> Result<Option<TopicRecord>> {
        let tx = self.conn.transaction().context("failed to start close transaction")?;
        let closed = close_latest_open_record(&tx, channel_id)?;
        tx.commit().context("failed to commit close transaction")?;
        Ok(closed)
    }

    /// Apply one observed topic atomically.
    ///
    /// Reads the latest record, and when the text differs (or the channel has no history)
    /// closes the open record and appends a new one, all inside one `IMMEDIATE` transaction so
    /// no reader ever sees zero or two open records.
    ///
    /// # Errors
    /// Returns an error when any read or write in the transaction fails.
    pub fn record_change(&mut self, channel_id: &ChannelId, text: &str) -> Result<ChangeOutcome> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start observation transaction")?;

        let outcome = match latest_record(&tx, channel_id)? {
            Some(current) if !needs_new_record(Some(&current), text) => {
                ChangeOutcome::Unchanged { current }
            }
            _ => {
                let closed = close_latest_open_record(&tx, channel_id)?;
                let record = append_record(&tx, channel_id, text)?;
                ChangeOutcome::Opened { record, closed }
            }
        };

        tx.commit().context("failed to commit observation transaction")?;
        Ok(outcome)
    }

    /// Load every record for the channel, most recent first.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn history(&self, channel_id: &ChannelId) -> Result<Vec<TopicRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "{SELECT_RECORD_SQL} WHERE channel_id = ?1 ORDER BY first_seen DESC, rowid DESC"
        ))?;
        let rows = stmt.query_map(params![channel_id.as_str()], decode_record)?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row.context("failed to decode topic record")?);
        }
        Ok(records)
    }

    /// Load the most recent record for the channel.
    ///
    /// # Errors
    /// Returns an error when the lookup fails.
    pub fn latest(&self, channel_id: &ChannelId) -> Result<Option<TopicRecord>> {
        latest_record(&self.conn, channel_id)
    }

    /// Count tracked channels, records, and open records.
    ///
    /// # Errors
    /// Returns an error when the aggregate query fails.
    pub fn stats(&self) -> Result<StoreStats> {
        self.conn
            .query_row(
                "SELECT
                    COUNT(DISTINCT channel_id),
                    COUNT(*),
                    COALESCE(SUM(CASE WHEN unset IS NULL THEN 1 ELSE 0 END), 0)
                 FROM topics",
                [],
                |row| {
                    Ok(StoreStats {
                        channels: row.get(0)?,
                        records: row.get(1)?,
                        open_records: row.get(2)?,
                    })
                },
            )
            .context("failed to read store stats")
    }

    /// Run SQLite quick-check and scan for channels holding more than one open record.
    ///
    /// # Errors
    /// Returns an error when the checks cannot be executed.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run sqlite quick_check")?;

        let mut stmt = self.conn.prepare(
            "SELECT channel_id, COUNT(*)
             FROM topics
             WHERE unset IS NULL
             GROUP BY channel_id
             HAVING COUNT(*) > 1
             ORDER BY channel_id ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(OpenRecordViolation {
                channel_id: ChannelId::new(row.get::<_, String>(0)?),
                open_records: row.get(1)?,
            })
        })?;

        let mut open_record_violations = Vec::new();
        for row in rows {
            open_record_violations.push(row?);
        }

        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            open_record_violations,
            schema_status: self.schema_status()?,
        })
    }
}

fn decode_record(row: &Row<'_>) -> rusqlite::Result<TopicRecord> {
    Ok(TopicRecord {
        seq: row.get(0)?,
        channel_id: ChannelId::new(row.get::<_, String>(1)?),
        text: row.get(2)?,
        first_seen: StoreTimestamp::new(row.get::<_, String>(3)?),
        unset: row.get::<_, Option<String>>(4)?.map(StoreTimestamp::new),
    })
}

fn record_by_rowid(conn: &Connection, rowid: i64) -> Result<TopicRecord> {
    conn.query_row(&format!("{SELECT_RECORD_SQL} WHERE rowid = ?1"), params![rowid], decode_record)
        .with_context(|| format!("failed to reload topic record {rowid}"))
}

fn latest_record(conn: &Connection, channel_id: &ChannelId) -> Result<Option<TopicRecord>> {
    conn.query_row(
        &format!(
            "{SELECT_RECORD_SQL} WHERE channel_id = ?1 ORDER BY first_seen DESC, rowid DESC LIMIT 1"
        ),
        params![channel_id.as_str()],
        decode_record,
    )
    .optional()
    .with_context(|| format!("failed to load latest topic for channel {channel_id}"))
}

fn append_record(conn: &Connection, channel_id: &ChannelId, text: &str) -> Result<TopicRecord> {
    conn.execute(
        "INSERT INTO topics(channel_id, text) VALUES (?1, ?2)",
        params![channel_id.as_str(), text],
    )
    .with_context(|| format!("failed to insert topic for channel {channel_id}"))?;
    record_by_rowid(conn, conn.last_insert_rowid())
}

fn close_latest_open_record(
    conn: &Connection,
    channel_id: &ChannelId,
) -> Result<Option<TopicRecord>> {
    let open_rowid = conn
        .query_row(
            "SELECT rowid FROM topics
             WHERE channel_id = ?1 AND unset IS NULL
             ORDER BY first_seen DESC, rowid DESC
             LIMIT 1",
            params![channel_id.as_str()],
            |row| row.get::<_, i64>(0),
        )
        .optional()
        .with_context(|| format!("failed to find open topic for channel {channel_id}"))?;

    let Some(rowid) = open_rowid else {
        return Ok(None);
    };

    conn.execute(
        "UPDATE topics SET unset = CURRENT_TIMESTAMP WHERE rowid = ?1 AND unset IS NULL",
        params![rowid],
    )
    .with_context(|| format!("failed to close open topic for channel {channel_id}"))?;

    record_by_rowid(conn, rowid).map(Some)
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}
