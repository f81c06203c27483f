//! Command-line argument definitions.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};

/// Heartbeat client for ActivityWatch-compatible event stores.
///
/// Events are queued on disk first and delivered in the background, so
/// nothing is lost while the server is unreachable.
#[derive(Debug, Parser)]
#[command(name = "pulse", version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to config file.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available subcommands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Record a heartbeat; merged with the bucket's previous one when possible.
    Heartbeat {
        #[command(flatten)]
        event: EventArgs,

        /// Merge window in seconds (default from config).
        #[arg(long)]
        pulsetime: Option<f64>,
    },

    /// Queue a complete event without merging.
    Insert {
        #[command(flatten)]
        event: EventArgs,
    },

    /// Create a bucket on the server.
    CreateBucket {
        #[arg(long)]
        bucket: String,

        /// Event type stored in the bucket (e.g. currentwindow, afkstatus).
        #[arg(long = "type")]
        event_type: String,
    },

    /// List the buckets on the server.
    Buckets,

    /// Run a query on the server and print the JSON result.
    Query {
        /// Bucket to read; repeat for several.
        #[arg(long)]
        bucket: Vec<String>,

        /// Start of the time range (RFC 3339).
        #[arg(long, value_parser = parse_time)]
        start: DateTime<Utc>,

        /// End of the time range (RFC 3339).
        #[arg(long, value_parser = parse_time)]
        end: DateTime<Utc>,

        /// Query statement operating on `events`; repeat for several.
        #[arg(long)]
        statement: Vec<String>,

        /// Name under which the server may cache the result.
        #[arg(long)]
        name: Option<String>,

        /// Allow the server to cache the result (requires --name).
        #[arg(long, requires = "name")]
        cache: bool,
    },

    /// Show events waiting for delivery.
    Queue,

    /// Deliver queued events, waiting at most the grace period.
    Flush {
        /// Milliseconds to wait for the queue to drain.
        #[arg(long, default_value_t = 10_000)]
        grace_ms: u64,
    },
}

/// The event shared by `heartbeat` and `insert`.
#[derive(Debug, Args)]
pub struct EventArgs {
    #[arg(long)]
    pub bucket: String,

    /// Payload entry as key=value; values are parsed as JSON, falling back to
    /// a plain string. Repeat for several.
    #[arg(long = "data", value_name = "KEY=VALUE")]
    pub data: Vec<String>,

    /// Event start (RFC 3339, default now).
    #[arg(long, value_parser = parse_time)]
    pub timestamp: Option<DateTime<Utc>>,

    /// Event duration in seconds.
    #[arg(long, default_value_t = 0.0)]
    pub duration: f64,

    /// Create the bucket with this event type before delivering.
    #[arg(long = "type")]
    pub event_type: Option<String>,
}

fn parse_time(value: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(value)
        .map(|time| time.with_timezone(&Utc))
        .map_err(|err| format!("expected an RFC 3339 timestamp: {err}"))
}
