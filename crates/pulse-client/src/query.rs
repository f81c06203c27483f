//! Server-side queries.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;

use pulse_core::BucketId;

use crate::ClientError;

/// A half-open time window `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub const fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// The `start/end` form the query endpoint expects.
    pub fn timeperiod(&self) -> String {
        format!(
            "{}/{}",
            self.start.to_rfc3339_opts(SecondsFormat::AutoSi, true),
            self.end.to_rfc3339_opts(SecondsFormat::AutoSi, true)
        )
    }
}

/// A query over one or more buckets.
///
/// The bucket events are bound to `events` before the transform runs:
/// `events = query_bucket("a");` for one bucket, or
/// `events = concat(query_bucket("a"), query_bucket("b"));` for several. The
/// transform statements then refer to `events` and must assign `RETURN`. With
/// no transform, the bucket events are returned as-is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuerySpec {
    pub bucket_ids: Vec<BucketId>,
    pub range: TimeRange,
    pub transform: Vec<String>,
    /// Name under which the server may cache results.
    pub name: Option<String>,
    pub cache: bool,
}

impl QuerySpec {
    pub fn new(bucket_ids: Vec<BucketId>, range: TimeRange, transform: Vec<String>) -> Self {
        Self {
            bucket_ids,
            range,
            transform,
            name: None,
            cache: false,
        }
    }

    /// Names the query and opts into server-side caching.
    #[must_use]
    pub fn cached_as(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self.cache = true;
        self
    }

    /// Rejects queries the server would refuse, before any network I/O.
    pub fn validate(&self) -> Result<(), ClientError> {
        if self.bucket_ids.is_empty() && self.transform.iter().all(|s| s.trim().is_empty()) {
            return Err(ClientError::MalformedQuery("query is empty".to_string()));
        }
        if self.range.end <= self.range.start {
            return Err(ClientError::MalformedQuery(format!(
                "time range end {} is not after start {}",
                self.range.end, self.range.start
            )));
        }
        if self.cache && self.name.as_deref().is_none_or(str::is_empty) {
            return Err(ClientError::MalformedQuery(
                "caching requires a query name".to_string(),
            ));
        }
        Ok(())
    }

    /// The full statement list: bucket prelude followed by the transform.
    pub fn statements(&self) -> Vec<String> {
        let mut statements = Vec::with_capacity(self.transform.len() + 2);
        let sources: Vec<String> = self
            .bucket_ids
            .iter()
            .map(|id| format!("query_bucket({})", quote(id.as_str())))
            .collect();
        match sources.as_slice() {
            [] => {}
            [single] => statements.push(format!("events = {single};")),
            many => statements.push(format!("events = concat({});", many.join(", "))),
        }

        let transform: Vec<&String> = self
            .transform
            .iter()
            .filter(|s| !s.trim().is_empty())
            .collect();
        if transform.is_empty() {
            statements.push("RETURN = events;".to_string());
        } else {
            statements.extend(transform.into_iter().cloned());
        }
        statements
    }

    /// The request body for `POST /api/0/query/`.
    pub(crate) fn body(&self) -> QueryBody {
        QueryBody {
            query: self.statements(),
            timeperiods: vec![self.range.timeperiod()],
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct QueryBody {
    query: Vec<String>,
    timeperiods: Vec<String>,
}

fn quote(value: &str) -> String {
    let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
    format!("\"{escaped}\"")
}
