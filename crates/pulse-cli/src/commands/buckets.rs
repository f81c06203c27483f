//! Bucket commands. These talk to the server directly and are never queued.

use std::io::Write;

use anyhow::{Context, Result};
use pulse_client::{Client, Transport};
use serde_json::{Map, Value};

use super::util;

pub async fn list<W: Write>(writer: &mut W, client: &Client) -> Result<()> {
    let buckets = client.buckets().await.context("failed to list buckets")?;
    render(writer, &buckets)
}

pub async fn create<W: Write>(writer: &mut W, client: &Client, id: &str, event_type: &str) -> Result<()> {
    let bucket = util::bucket(id)?;
    let spec = client.bucket_spec(&bucket, event_type);
    client
        .transport()
        .create_bucket(&spec)
        .await
        .with_context(|| format!("failed to create bucket {bucket}"))?;
    writeln!(writer, "Bucket {bucket} ready ({event_type}).")?;
    Ok(())
}

fn render<W: Write>(writer: &mut W, buckets: &Map<String, Value>) -> Result<()> {
    if buckets.is_empty() {
        writeln!(writer, "No buckets.")?;
        return Ok(());
    }

    let width = buckets.keys().map(String::len).max().unwrap_or(0);
    for (id, meta) in buckets {
        let field = |name: &str| meta.get(name).and_then(Value::as_str).unwrap_or("-");
        writeln!(
            writer,
            "{id:<width$}  {:<16} {:<20} {}",
            field("type"),
            field("client"),
            field("hostname")
        )?;
    }
    Ok(())
}
