//! Heartbeat client for an ActivityWatch-compatible event store.
//!
//! Heartbeats are merged locally, persisted to a durable on-disk queue and
//! delivered by a background dispatcher that survives outages and restarts:
//! - [`Client::heartbeat`] and [`Client::insert_event`] never touch the network
//! - [`Client::query`] is a direct, non-queued request
//! - the dispatcher retries with exponential backoff until the server accepts
//!   or permanently rejects each event

mod client;
pub mod config;
pub mod dispatch;
pub mod query;
pub mod transport;

use thiserror::Error;

use pulse_core::ValidationError;
use pulse_queue::QueueError;

pub use client::Client;
pub use config::ClientConfig;
pub use dispatch::{DispatchStats, DispatcherState};
pub use query::{QuerySpec, TimeRange};
pub use transport::{BucketSpec, DeliveryError, HttpTransport, Transport};

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The local durable queue failed; the event was not accepted.
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
    /// The caller supplied an invalid event or parameter.
    #[error("invalid input: {0}")]
    Validation(#[from] ValidationError),
    /// The query was rejected before being sent.
    #[error("malformed query: {0}")]
    MalformedQuery(String),
    /// The configured server URL is unusable.
    #[error("invalid server URL: {0}")]
    InvalidUrl(String),
    /// Failed to build HTTP client.
    #[error("failed to build HTTP client: {0}")]
    ClientBuild(#[source] reqwest::Error),
    /// HTTP request failed.
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    /// The server answered with an error status.
    #[error("server error {status}: {message}")]
    Api { status: u16, message: String },
    /// Failed to parse response.
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error(transparent)]
    Delivery(#[from] DeliveryError),
}
