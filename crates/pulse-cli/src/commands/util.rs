//! Helpers shared by the event commands.

use anyhow::{Context, Result, bail};
use chrono::Utc;
use pulse_core::event::from_seconds;
use pulse_core::{BucketId, Event, EventData, Value};

use crate::EventArgs;

pub fn bucket(id: &str) -> Result<BucketId> {
    BucketId::new(id).with_context(|| format!("invalid bucket id {id:?}"))
}

/// Parses `key=value` pairs. Values are read as JSON when they parse as JSON
/// (`3`, `true`, `["a"]`), otherwise taken as a plain string.
pub fn parse_data(pairs: &[String]) -> Result<EventData> {
    let mut data = EventData::new();
    for pair in pairs {
        let Some((key, raw)) = pair.split_once('=') else {
            bail!("expected KEY=VALUE, got {pair:?}");
        };
        let key = key.trim();
        if key.is_empty() {
            bail!("empty key in {pair:?}");
        }
        let value = serde_json::from_str::<serde_json::Value>(raw)
            .map_or_else(|_| Value::from(raw), Value::from);
        data.insert(key.to_string(), value);
    }
    Ok(data)
}

pub fn event(args: &EventArgs) -> Result<Event> {
    let duration = from_seconds(args.duration).context("invalid --duration")?;
    let timestamp = args.timestamp.unwrap_or_else(Utc::now);
    Ok(Event::new(timestamp, duration, parse_data(&args.data)?)?)
}
