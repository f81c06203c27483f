//! Query command.

use std::io::Write;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use pulse_client::{Client, QuerySpec, TimeRange};

use super::util;

/// What to query, as given on the command line.
#[derive(Debug)]
pub struct QueryArgs<'a> {
    pub buckets: &'a [String],
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub statements: &'a [String],
    pub name: Option<&'a str>,
    pub cache: bool,
}

pub async fn run<W: Write>(writer: &mut W, client: &Client, args: &QueryArgs<'_>) -> Result<()> {
    let spec = build(args)?;
    let result = client.query(&spec).await.context("query failed")?;
    serde_json::to_writer_pretty(&mut *writer, &result)?;
    writeln!(writer)?;
    Ok(())
}

fn build(args: &QueryArgs<'_>) -> Result<QuerySpec> {
    let bucket_ids = args
        .buckets
        .iter()
        .map(|id| util::bucket(id))
        .collect::<Result<Vec<_>>>()?;
    let mut spec = QuerySpec::new(
        bucket_ids,
        TimeRange::new(args.start, args.end),
        args.statements.to_vec(),
    );
    if let Some(name) = args.name {
        spec.name = Some(name.to_string());
        spec.cache = args.cache;
    }
    spec.validate()?;
    Ok(spec)
}
