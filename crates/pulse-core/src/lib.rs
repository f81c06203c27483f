//! Core domain logic for the pulse client.
//!
//! This crate contains the fundamental types and logic for:
//! - Events: the activity spans exchanged with the event store
//! - Payload values with explicit structural equality
//! - Heartbeat merging: coalescing repeated heartbeats into one event
//! - Retry backoff for delivery

mod backoff;
pub mod event;
pub mod merge;
pub mod types;
pub mod value;

pub use backoff::{Backoff, BackoffConfig};
pub use event::Event;
pub use merge::{HeartbeatMerger, Merge, MergeAction, MergeState};
pub use types::{BucketId, ValidationError};
pub use value::{EventData, Value};
