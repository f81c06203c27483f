//! `heartbeat` and `insert`: queue an event and try to deliver it.
//!
//! Both commands run a short-lived client. The event is on disk before any
//! network I/O; if the server cannot be reached within the shutdown grace
//! period it stays queued for a later run (see `pulse flush`).

use std::io::Write;

use anyhow::{Context, Result};
use pulse_client::{Client, ClientConfig};
use pulse_core::BucketId;
use pulse_core::event::from_seconds;

use super::util;
use crate::EventArgs;

pub async fn heartbeat<W: Write>(
    writer: &mut W,
    config: &ClientConfig,
    args: &EventArgs,
    pulsetime: Option<f64>,
) -> Result<()> {
    let bucket = util::bucket(&args.bucket)?;
    let event = util::event(args)?;
    let pulsetime = pulsetime
        .map(from_seconds)
        .transpose()
        .context("invalid --pulsetime")?;

    let client = open(config, &bucket, args)?;
    client
        .heartbeat(&bucket, event, pulsetime)
        .context("failed to record heartbeat")?;
    finish(writer, &client, &bucket, "heartbeat").await
}

pub async fn insert<W: Write>(writer: &mut W, config: &ClientConfig, args: &EventArgs) -> Result<()> {
    let bucket = util::bucket(&args.bucket)?;
    let event = util::event(args)?;

    let client = open(config, &bucket, args)?;
    client
        .insert_event(&bucket, event)
        .context("failed to queue event")?;
    finish(writer, &client, &bucket, "event").await
}

fn open(config: &ClientConfig, bucket: &BucketId, args: &EventArgs) -> Result<Client> {
    let client = Client::open(config.clone()).context("failed to open client")?;
    if let Some(event_type) = &args.event_type {
        client.create_bucket(bucket, event_type);
    }
    client.connect();
    Ok(client)
}

async fn finish<W: Write>(writer: &mut W, client: &Client, bucket: &BucketId, what: &str) -> Result<()> {
    client.shutdown(None).await?;
    let pending = client.queue().len(bucket);
    if pending == 0 {
        writeln!(writer, "Delivered {what} to {bucket}.")?;
    } else {
        writeln!(
            writer,
            "Queued {what} for {bucket}; {pending} event(s) awaiting delivery."
        )?;
    }
    Ok(())
}
