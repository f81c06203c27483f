//! Heartbeat merging.
//!
//! Sensors report the current activity every few seconds. Consecutive
//! heartbeats with the same payload are coalesced into one event whose span
//! grows as long as each new heartbeat starts within `pulsetime` of the end of
//! the pending event. The pending event (the "candidate") is only handed off
//! for delivery once it can no longer grow.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::TimeDelta;

use crate::event::{Event, check_duration, seconds};
use crate::types::{BucketId, ValidationError};

/// What a heartbeat did to the bucket's candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeAction {
    /// The heartbeat extended the existing candidate.
    Extend,
    /// The heartbeat became the new candidate.
    NewPending,
}

/// Result of merging one heartbeat.
#[derive(Debug, Clone, PartialEq)]
pub struct Merge {
    pub action: MergeAction,
    /// The previous candidate, finalized because the heartbeat could not extend
    /// it. Must be queued for delivery before any later event of the bucket.
    pub flushed: Option<Event>,
}

/// Merge state for a single bucket.
#[derive(Debug, Default)]
pub struct MergeState {
    candidate: Option<Event>,
    last_update: Option<Instant>,
}

impl MergeState {
    /// Merges a heartbeat into this bucket's candidate.
    pub fn merge(&mut self, heartbeat: Event, pulsetime: TimeDelta) -> Result<Merge, ValidationError> {
        self.merge_at(heartbeat, pulsetime, Instant::now())
    }

    /// Merges a heartbeat, recording `now` as the last update instant.
    pub fn merge_at(
        &mut self,
        heartbeat: Event,
        pulsetime: TimeDelta,
        now: Instant,
    ) -> Result<Merge, ValidationError> {
        if pulsetime < TimeDelta::zero() {
            return Err(ValidationError::NegativePulsetime {
                seconds: seconds(pulsetime),
            });
        }
        self.last_update = Some(now);

        let Some(candidate) = self.candidate.as_mut() else {
            self.candidate = Some(heartbeat);
            return Ok(Merge {
                action: MergeAction::NewPending,
                flushed: None,
            });
        };

        if can_extend(candidate, &heartbeat, pulsetime) {
            let end = candidate.end().max(heartbeat.end());
            candidate.duration = end - candidate.timestamp;
            return Ok(Merge {
                action: MergeAction::Extend,
                flushed: None,
            });
        }

        if heartbeat.timestamp < candidate.timestamp {
            tracing::warn!(
                candidate = %candidate.timestamp,
                heartbeat = %heartbeat.timestamp,
                "heartbeat is older than the pending event"
            );
        }

        let flushed = self.candidate.replace(heartbeat);
        Ok(Merge {
            action: MergeAction::NewPending,
            flushed,
        })
    }

    /// Finalizes the candidate regardless of pulsetime.
    pub fn flush(&mut self) -> Option<Event> {
        self.last_update = None;
        self.candidate.take()
    }

    /// Finalizes the candidate if it has not been touched for `idle`.
    pub fn flush_if_idle(&mut self, now: Instant, idle: Duration) -> Option<Event> {
        let last = self.last_update?;
        if now.saturating_duration_since(last) < idle {
            return None;
        }
        self.flush()
    }

    /// Restores a previously flushed candidate, discarding the current one.
    ///
    /// Used to undo a merge whose flushed event could not be handed off, so
    /// the rejected heartbeat leaves no trace.
    pub fn reinstate(&mut self, event: Event) {
        self.candidate = Some(event);
    }

    /// The pending, not yet queued event.
    pub fn candidate(&self) -> Option<&Event> {
        self.candidate.as_ref()
    }
}

fn can_extend(candidate: &Event, heartbeat: &Event, pulsetime: TimeDelta) -> bool {
    // A window reaching past the representable range has no upper bound.
    let within_window = candidate
        .end()
        .checked_add_signed(pulsetime)
        .is_none_or(|limit| heartbeat.timestamp <= limit);
    let span = candidate.end().max(heartbeat.end()) - candidate.timestamp;
    candidate.data == heartbeat.data
        && heartbeat.timestamp >= candidate.timestamp
        && within_window
        && check_duration(span).is_ok()
}

/// Per-bucket merge states.
///
/// Each bucket's state sits behind its own mutex so heartbeats for different
/// buckets never contend. Callers that must keep a flushed event ordered with
/// respect to later events (e.g. by queueing it) should hold the bucket handle
/// from [`HeartbeatMerger::state`] across both steps.
#[derive(Debug, Default)]
pub struct HeartbeatMerger {
    states: Mutex<HashMap<BucketId, Arc<Mutex<MergeState>>>>,
}

impl HeartbeatMerger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the merge state handle for a bucket, creating it if needed.
    pub fn state(&self, bucket: &BucketId) -> Arc<Mutex<MergeState>> {
        let mut states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(states.entry(bucket.clone()).or_default())
    }

    /// Merges a heartbeat into the bucket's candidate.
    pub fn merge(
        &self,
        bucket: &BucketId,
        heartbeat: Event,
        pulsetime: TimeDelta,
    ) -> Result<Merge, ValidationError> {
        let state = self.state(bucket);
        let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
        state.merge(heartbeat, pulsetime)
    }

    /// Finalizes the bucket's candidate.
    pub fn flush(&self, bucket: &BucketId) -> Option<Event> {
        let state = self.state(bucket);
        let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
        state.flush()
    }

    /// Buckets that have merge state, sorted.
    pub fn buckets(&self) -> Vec<BucketId> {
        let states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        let mut buckets: Vec<BucketId> = states.keys().cloned().collect();
        buckets.sort();
        buckets
    }
}
