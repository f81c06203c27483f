//! Flush command: deliver whatever is queued, within a time limit.

use std::io::Write;
use std::time::Duration;

use anyhow::Result;
use pulse_client::{Client, Transport};

pub async fn run<W: Write, T: Transport>(writer: &mut W, client: &Client<T>, grace: Duration) -> Result<()> {
    let queued = client.queue().total_len();
    if queued == 0 {
        writeln!(writer, "Nothing to deliver.")?;
        return Ok(());
    }

    client.connect();
    let drained = tokio::time::timeout(grace, async {
        while client.queue().total_len() > 0 {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .is_ok();
    if !drained {
        tracing::debug!(
            grace_ms = u64::try_from(grace.as_millis()).unwrap_or(u64::MAX),
            "flush grace period elapsed"
        );
    }
    client.shutdown(Some(Duration::ZERO)).await?;

    let stats = client.stats();
    let remaining = client.queue().total_len();
    writeln!(
        writer,
        "Delivered {}, dropped {}, {remaining} still queued.",
        stats.delivered, stats.dropped
    )?;
    Ok(())
}
