//! Durable queue of events waiting for delivery.
//!
//! Events are persisted here before any network I/O happens and removed only
//! once the event store acknowledges them (or they are rejected for good).
//!
//! # Layout
//!
//! The queue is a directory with one SQLite database ("segment") per bucket,
//! named `<bucket>.v1.queue.db` with unsafe characters percent-encoded. The
//! bucket ID and a format version live in each segment's `meta` table.
//!
//! # Guarantees
//!
//! - [`DurableQueue::enqueue`] returns only after the entry is committed with
//!   `synchronous = FULL`; an interrupted write leaves no partial entry.
//! - Entries of a bucket are returned in enqueue order. Order across buckets is
//!   unspecified.
//! - Failures are scoped to one segment: a corrupt or unwritable segment does
//!   not affect other buckets.
//!
//! # Thread Safety
//!
//! [`DurableQueue`] is `Sync`. Each segment has its own mutex, so enqueues for
//! one bucket never wait on another bucket's disk I/O, and the dispatcher can
//! drain a bucket while callers keep enqueueing to it.

mod segment;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use thiserror::Error;

use pulse_core::{BucketId, Event, ValidationError};

use segment::Segment;

/// Queue errors.
#[derive(Debug, Error)]
pub enum QueueError {
    /// An error from the underlying database.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// The queue directory could not be created or read.
    #[error("queue directory {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// A segment holds data this version cannot read.
    #[error("corrupt queue segment {location}: {message}")]
    Corrupt { location: String, message: String },
    /// An event would be stored in a form that cannot be read back.
    #[error("invalid event for bucket {bucket}: {source}")]
    Invalid {
        bucket: BucketId,
        #[source]
        source: ValidationError,
    },
    /// An event could not be serialized.
    #[error("failed to encode event for bucket {bucket}: {source}")]
    Encode {
        bucket: BucketId,
        #[source]
        source: serde_json::Error,
    },
}

/// Identifies one queued entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntryId {
    pub bucket: BucketId,
    /// Position within the bucket; strictly increasing, never reused.
    pub seq: i64,
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.bucket, self.seq)
    }
}

/// An event waiting for delivery, with its delivery metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueEntry {
    pub id: EntryId,
    pub event: Event,
    /// Failed delivery attempts so far.
    pub attempts: u32,
    pub enqueued_at: DateTime<Utc>,
}

enum Storage {
    Dir(PathBuf),
    Memory,
}

type SegmentHandle = Arc<Mutex<Segment>>;

/// Crash-safe FIFO of undelivered events, partitioned by bucket.
pub struct DurableQueue {
    storage: Storage,
    segments: Mutex<BTreeMap<BucketId, SegmentHandle>>,
    soft_cap: Option<usize>,
}

impl fmt::Debug for DurableQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let location = match &self.storage {
            Storage::Dir(dir) => dir.display().to_string(),
            Storage::Memory => ":memory:".to_string(),
        };
        f.debug_struct("DurableQueue")
            .field("location", &location)
            .field("soft_cap", &self.soft_cap)
            .finish_non_exhaustive()
    }
}

impl DurableQueue {
    /// Opens the queue in `dir`, creating the directory if necessary.
    ///
    /// Existing segments are recovered so their unacknowledged entries are
    /// available before anything new is enqueued. A segment that cannot be
    /// opened is logged and left untouched on disk.
    pub fn open(dir: &Path) -> Result<Self, QueueError> {
        std::fs::create_dir_all(dir).map_err(|source| QueueError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let read_dir = std::fs::read_dir(dir).map_err(|source| QueueError::Io {
            path: dir.to_path_buf(),
            source,
        })?;

        let mut paths = Vec::new();
        for entry in read_dir {
            let entry = entry.map_err(|source| QueueError::Io {
                path: dir.to_path_buf(),
                source,
            })?;
            let path = entry.path();
            if segment::is_segment(&path) {
                paths.push(path);
            }
        }
        paths.sort();

        let mut segments = BTreeMap::new();
        for path in paths {
            match Segment::open(&path, None) {
                Ok(segment) => {
                    if segment.len() > 0 {
                        tracing::info!(
                            bucket = %segment.bucket(),
                            pending = segment.len(),
                            "recovered queued events"
                        );
                    }
                    segments.insert(segment.bucket().clone(), Arc::new(Mutex::new(segment)));
                }
                Err(err) => {
                    tracing::error!(path = %path.display(), error = %err, "skipping unreadable queue segment");
                }
            }
        }

        Ok(Self {
            storage: Storage::Dir(dir.to_path_buf()),
            segments: Mutex::new(segments),
            soft_cap: None,
        })
    }

    /// Opens a queue that lives only in memory.
    ///
    /// Useful for testing. Nothing survives the process.
    pub fn open_in_memory() -> Self {
        Self {
            storage: Storage::Memory,
            segments: Mutex::new(BTreeMap::new()),
            soft_cap: None,
        }
    }

    /// Sets the per-bucket size above which a warning is logged.
    ///
    /// The cap never causes entries to be dropped.
    #[must_use]
    pub fn with_soft_cap(mut self, soft_cap: Option<usize>) -> Self {
        self.soft_cap = soft_cap;
        self
    }

    /// The directory backing this queue, if any.
    pub fn dir(&self) -> Option<&Path> {
        match &self.storage {
            Storage::Dir(dir) => Some(dir),
            Storage::Memory => None,
        }
    }

    /// Persists an event at the back of the bucket's queue.
    pub fn enqueue(&self, bucket: &BucketId, event: &Event) -> Result<EntryId, QueueError> {
        let handle = self.segment(bucket)?;
        let mut segment = lock(&handle);
        let seq = segment.append(event, Utc::now())?;
        if let Some(cap) = self.soft_cap {
            if segment.crossed_cap(cap) {
                tracing::warn!(
                    bucket = %bucket,
                    pending = segment.len(),
                    soft_cap = cap,
                    "queue exceeds soft cap; events are kept but the event store may be unreachable"
                );
            }
        }
        tracing::trace!(bucket = %bucket, seq, "event queued");
        Ok(EntryId {
            bucket: bucket.clone(),
            seq,
        })
    }

    /// Returns up to `max_n` of the bucket's oldest entries without removing them.
    pub fn peek_batch(&self, bucket: &BucketId, max_n: usize) -> Result<Vec<QueueEntry>, QueueError> {
        let Some(handle) = self.existing(bucket) else {
            return Ok(Vec::new());
        };
        let segment = lock(&handle);
        segment.peek(max_n)
    }

    /// Removes a delivered entry. Returns `false` if it was already gone.
    pub fn ack(&self, id: &EntryId) -> Result<bool, QueueError> {
        Ok(self.ack_many(std::slice::from_ref(id))? > 0)
    }

    /// Removes delivered entries; each bucket is updated in one transaction.
    pub fn ack_many(&self, ids: &[EntryId]) -> Result<usize, QueueError> {
        let mut by_bucket: HashMap<&BucketId, Vec<i64>> = HashMap::new();
        for id in ids {
            by_bucket.entry(&id.bucket).or_default().push(id.seq);
        }

        let mut removed = 0;
        for (bucket, seqs) in by_bucket {
            if let Some(handle) = self.existing(bucket) {
                removed += lock(&handle).remove(&seqs)?;
            }
        }
        Ok(removed)
    }

    /// Records a failed attempt. The entry stays at the front of its bucket.
    pub fn requeue(&self, id: &EntryId) -> Result<bool, QueueError> {
        let Some(handle) = self.existing(&id.bucket) else {
            return Ok(false);
        };
        let mut segment = lock(&handle);
        segment.bump_attempts(id.seq)
    }

    /// Number of entries queued for a bucket.
    pub fn len(&self, bucket: &BucketId) -> usize {
        self.existing(bucket).map_or(0, |handle| lock(&handle).len())
    }

    /// Number of entries queued across all buckets.
    pub fn total_len(&self) -> usize {
        self.handles().iter().map(|handle| lock(handle).len()).sum()
    }

    /// Returns `true` if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.total_len() == 0
    }

    /// Buckets that have a segment, sorted.
    pub fn buckets(&self) -> Vec<BucketId> {
        lock(&self.segments).keys().cloned().collect()
    }

    /// Buckets with at least one queued entry, with their depth, sorted.
    pub fn pending(&self) -> Vec<(BucketId, usize)> {
        let segments: Vec<(BucketId, SegmentHandle)> = lock(&self.segments)
            .iter()
            .map(|(bucket, handle)| (bucket.clone(), Arc::clone(handle)))
            .collect();
        segments
            .into_iter()
            .filter_map(|(bucket, handle)| {
                let len = lock(&handle).len();
                (len > 0).then_some((bucket, len))
            })
            .collect()
    }

    fn handles(&self) -> Vec<SegmentHandle> {
        lock(&self.segments).values().cloned().collect()
    }

    fn existing(&self, bucket: &BucketId) -> Option<SegmentHandle> {
        lock(&self.segments).get(bucket).cloned()
    }

    fn segment(&self, bucket: &BucketId) -> Result<SegmentHandle, QueueError> {
        let mut segments = lock(&self.segments);
        if let Some(handle) = segments.get(bucket) {
            return Ok(Arc::clone(handle));
        }
        let segment = match &self.storage {
            Storage::Dir(dir) => Segment::open(&segment::segment_path(dir, bucket), Some(bucket))?,
            Storage::Memory => Segment::open_in_memory(bucket)?,
        };
        tracing::debug!(bucket = %bucket, "opened queue segment");
        let handle = Arc::new(Mutex::new(segment));
        segments.insert(bucket.clone(), Arc::clone(&handle));
        Ok(handle)
    }
}

/// Locks a mutex, recovering from poisoning.
///
/// Segment state is only mutated after SQLite reports success, so a panic
/// elsewhere cannot leave it inconsistent.
fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
