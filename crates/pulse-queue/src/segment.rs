//! One bucket's queue file.

use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, params};

use pulse_core::{BucketId, Event};

use crate::{EntryId, QueueEntry, QueueError};

/// Bump whenever the on-disk layout changes.
pub(crate) const FORMAT_VERSION: &str = "1";

/// File name suffix of segment files.
pub(crate) const SEGMENT_SUFFIX: &str = ".v1.queue.db";

/// A single bucket's entries, stored in its own SQLite database.
///
/// Every append is its own committed statement with `synchronous = FULL`, so a
/// crash leaves either the whole row or nothing.
pub(crate) struct Segment {
    conn: Connection,
    bucket: BucketId,
    location: String,
    len: usize,
    over_cap: bool,
}

impl Segment {
    /// Opens (or creates) the segment at `path`.
    ///
    /// With `bucket` set, a new segment is stamped with that bucket ID and an
    /// existing one must carry the same ID. Without it (recovery scan) the ID is
    /// read back from the file.
    pub(crate) fn open(path: &Path, bucket: Option<&BucketId>) -> Result<Self, QueueError> {
        let conn = Connection::open(path)?;
        Self::init(conn, bucket, path.display().to_string())
    }

    pub(crate) fn open_in_memory(bucket: &BucketId) -> Result<Self, QueueError> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn, Some(bucket), ":memory:".to_string())
    }

    fn init(
        conn: Connection,
        bucket: Option<&BucketId>,
        location: String,
    ) -> Result<Self, QueueError> {
        conn.execute_batch(
            "
            PRAGMA synchronous = FULL;

            CREATE TABLE IF NOT EXISTS meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            -- seq: strictly increasing, never reused, defines delivery order
            -- payload: the event as JSON
            CREATE TABLE IF NOT EXISTS entries (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                enqueued_at TEXT NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                payload TEXT NOT NULL
            );
            ",
        )?;

        conn.execute(
            "INSERT OR IGNORE INTO meta (key, value) VALUES ('format_version', ?)",
            [FORMAT_VERSION],
        )?;
        let version = read_meta(&conn, "format_version")?;
        if version.as_deref() != Some(FORMAT_VERSION) {
            return Err(QueueError::Corrupt {
                location,
                message: format!("unsupported format version {version:?}"),
            });
        }

        if let Some(bucket) = bucket {
            conn.execute(
                "INSERT OR IGNORE INTO meta (key, value) VALUES ('bucket_id', ?)",
                [bucket.as_str()],
            )?;
        }
        let stored = read_meta(&conn, "bucket_id")?.ok_or_else(|| QueueError::Corrupt {
            location: location.clone(),
            message: "missing bucket ID".to_string(),
        })?;
        let stored = BucketId::new(stored).map_err(|err| QueueError::Corrupt {
            location: location.clone(),
            message: err.to_string(),
        })?;
        if let Some(bucket) = bucket.filter(|bucket| **bucket != stored) {
            return Err(QueueError::Corrupt {
                location,
                message: format!("segment belongs to bucket {stored}, not {bucket}"),
            });
        }

        let len: i64 = conn.query_row("SELECT COUNT(*) FROM entries", [], |row| row.get(0))?;
        Ok(Self {
            conn,
            bucket: stored,
            location,
            len: usize::try_from(len).unwrap_or_default(),
            over_cap: false,
        })
    }

    pub(crate) const fn bucket(&self) -> &BucketId {
        &self.bucket
    }

    pub(crate) const fn len(&self) -> usize {
        self.len
    }

    /// Appends an event; returns its sequence number once it is on disk.
    pub(crate) fn append(&mut self, event: &Event, now: DateTime<Utc>) -> Result<i64, QueueError> {
        event.validate().map_err(|source| QueueError::Invalid {
            bucket: self.bucket.clone(),
            source,
        })?;
        let payload = serde_json::to_string(event).map_err(|source| QueueError::Encode {
            bucket: self.bucket.clone(),
            source,
        })?;
        self.conn.execute(
            "INSERT INTO entries (enqueued_at, attempts, payload) VALUES (?, 0, ?)",
            params![format_timestamp(now), payload],
        )?;
        self.len += 1;
        Ok(self.conn.last_insert_rowid())
    }

    /// Returns up to `max` of the oldest entries, oldest first.
    pub(crate) fn peek(&self, max: usize) -> Result<Vec<QueueEntry>, QueueError> {
        let limit = i64::try_from(max).unwrap_or(i64::MAX);
        let mut stmt = self.conn.prepare(
            "
            SELECT seq, enqueued_at, attempts, payload
            FROM entries
            ORDER BY seq ASC
            LIMIT ?
            ",
        )?;
        let rows = stmt.query_map([limit], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, u32>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (seq, enqueued_at, attempts, payload) = row?;
            let event: Event = serde_json::from_str(&payload).map_err(|err| QueueError::Corrupt {
                location: self.location.clone(),
                message: format!("entry {seq}: {err}"),
            })?;
            let enqueued_at = DateTime::parse_from_rfc3339(&enqueued_at)
                .map_err(|err| QueueError::Corrupt {
                    location: self.location.clone(),
                    message: format!("entry {seq}: invalid enqueue time {enqueued_at}: {err}"),
                })?
                .with_timezone(&Utc);
            entries.push(QueueEntry {
                id: EntryId {
                    bucket: self.bucket.clone(),
                    seq,
                },
                event,
                attempts,
                enqueued_at,
            });
        }
        Ok(entries)
    }

    /// Deletes the given entries in one transaction; returns how many existed.
    pub(crate) fn remove(&mut self, seqs: &[i64]) -> Result<usize, QueueError> {
        if seqs.is_empty() {
            return Ok(0);
        }
        let tx = self.conn.transaction()?;
        let mut removed = 0;
        {
            let mut stmt = tx.prepare("DELETE FROM entries WHERE seq = ?")?;
            for seq in seqs {
                removed += stmt.execute([seq])?;
            }
        }
        tx.commit()?;
        self.len = self.len.saturating_sub(removed);
        Ok(removed)
    }

    /// Records a failed delivery attempt; the entry keeps its position.
    pub(crate) fn bump_attempts(&mut self, seq: i64) -> Result<bool, QueueError> {
        let updated = self
            .conn
            .execute("UPDATE entries SET attempts = attempts + 1 WHERE seq = ?", [seq])?;
        Ok(updated > 0)
    }

    /// Tracks whether the soft cap is exceeded; returns `true` on crossing it.
    pub(crate) const fn crossed_cap(&mut self, cap: usize) -> bool {
        let over = self.len > cap;
        let crossed = over && !self.over_cap;
        self.over_cap = over;
        crossed
    }
}

fn read_meta(conn: &Connection, key: &str) -> Result<Option<String>, QueueError> {
    let value = conn
        .query_row("SELECT value FROM meta WHERE key = ?", [key], |row| row.get(0))
        .optional()?;
    Ok(value)
}

fn format_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Builds the segment file name for a bucket.
///
/// Anything outside `[A-Za-z0-9_-]` is percent-encoded so arbitrary bucket IDs
/// map to distinct, portable file names.
pub(crate) fn file_name(bucket: &BucketId) -> String {
    let mut name = String::with_capacity(bucket.as_str().len() + SEGMENT_SUFFIX.len());
    for byte in bucket.as_str().bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            name.push(char::from(byte));
        } else {
            name.push_str(&format!("%{byte:02X}"));
        }
    }
    name.push_str(SEGMENT_SUFFIX);
    name
}

/// Returns `true` if the path looks like a segment file.
pub(crate) fn is_segment(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.ends_with(SEGMENT_SUFFIX) && name.len() > SEGMENT_SUFFIX.len())
}

pub(crate) fn segment_path(dir: &Path, bucket: &BucketId) -> PathBuf {
    dir.join(file_name(bucket))
}
