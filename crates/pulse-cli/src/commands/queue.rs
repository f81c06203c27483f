//! Queue command: what is waiting for delivery. Local only.

use std::io::Write;

use anyhow::{Context, Result};
use pulse_client::ClientConfig;
use pulse_queue::DurableQueue;

pub fn run<W: Write>(writer: &mut W, config: &ClientConfig) -> Result<()> {
    let dir = config.resolved_queue_dir();
    writeln!(writer, "Queue: {}", dir.display())?;
    if !dir.exists() {
        writeln!(writer, "No queued events.")?;
        return Ok(());
    }

    let queue = DurableQueue::open(&dir)
        .with_context(|| format!("failed to open queue {}", dir.display()))?;
    let pending = queue.pending();
    if pending.is_empty() {
        writeln!(writer, "No queued events.")?;
        return Ok(());
    }

    let mut total = 0;
    for (bucket, count) in &pending {
        total += count;
        let head = queue.peek_batch(bucket, 1)?;
        match head.first() {
            Some(entry) if entry.attempts > 0 => writeln!(
                writer,
                "- {bucket}: {count} pending (oldest tried {} times)",
                entry.attempts
            )?,
            _ => writeln!(writer, "- {bucket}: {count} pending")?,
        }
    }
    writeln!(writer, "Total: {total}")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::{TimeZone, Utc};
    use insta::assert_snapshot;
    use pulse_core::{BucketId, Event, EventData};

    fn render(config: &ClientConfig) -> String {
        let mut output = Vec::new();
        run(&mut output, config).unwrap();
        let output = String::from_utf8(output).unwrap();
        output.replace(&config.resolved_queue_dir().display().to_string(), "[TEMP]")
    }

    #[test]
    fn lists_pending_entries_per_bucket() {
        let temp = tempfile::tempdir().unwrap();
        let config = ClientConfig {
            queue_dir: Some(temp.path().to_path_buf()),
            ..ClientConfig::default()
        };

        {
            let queue = DurableQueue::open(temp.path()).unwrap();
            let window = BucketId::new("window").unwrap();
            let afk = BucketId::new("afk").unwrap();
            let event = Event::heartbeat(Utc.timestamp_opt(1_700_000_000, 0).unwrap(), EventData::new());
            let first = queue.enqueue(&window, &event).unwrap();
            queue.enqueue(&window, &event).unwrap();
            queue.enqueue(&afk, &event).unwrap();
            queue.requeue(&first).unwrap();
            queue.requeue(&first).unwrap();
        }

        assert_snapshot!(render(&config), @r"
        Queue: [TEMP]
        - afk: 1 pending
        - window: 2 pending (oldest tried 2 times)
        Total: 3
        ");
    }

    #[test]
    fn reports_missing_queue() {
        let temp = tempfile::tempdir().unwrap();
        let config = ClientConfig {
            queue_dir: Some(temp.path().join("never-created")),
            ..ClientConfig::default()
        };

        assert_snapshot!(render(&config), @r"
        Queue: [TEMP]
        No queued events.
        ");
    }
}
