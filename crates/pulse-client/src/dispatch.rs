//! Background delivery of queued events.
//!
//! The dispatcher drains the durable queue bucket by bucket and hands batches
//! to the [`Transport`]. Entries leave the queue only when the server accepted
//! them or rejected them for good; every other failure leaves them in place and
//! backs off before the next attempt.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{Notify, watch};
use tokio_util::sync::CancellationToken;

use pulse_core::{Backoff, BackoffConfig, BucketId, Event};
use pulse_queue::{DurableQueue, EntryId, QueueEntry, QueueError};

use crate::transport::{BucketSpec, DeliveryError, Transport};

/// Where the dispatcher is in its delivery cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherState {
    /// Nothing to send; waiting for a wake-up or the poll interval.
    Idle,
    /// A delivery round is in progress.
    Sending,
    /// The last round failed; waiting out the backoff delay.
    Failed,
}

/// Dispatcher tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchConfig {
    /// Maximum events per request.
    pub batch_size: usize,
    /// How often an idle dispatcher re-checks the queue without a wake-up.
    pub poll_interval: Duration,
    pub backoff: BackoffConfig,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            poll_interval: Duration::from_secs(5),
            backoff: BackoffConfig::default(),
        }
    }
}

/// Delivery counters.
#[derive(Debug, Default)]
pub struct DispatchCounters {
    delivered: AtomicU64,
    dropped: AtomicU64,
    failed_attempts: AtomicU64,
}

impl DispatchCounters {
    pub fn snapshot(&self) -> DispatchStats {
        DispatchStats {
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            failed_attempts: self.failed_attempts.load(Ordering::Relaxed),
        }
    }

    fn add(counter: &AtomicU64, n: usize) {
        counter.fetch_add(u64::try_from(n).unwrap_or(u64::MAX), Ordering::Relaxed);
    }
}

/// Snapshot of [`DispatchCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    /// Events acknowledged by the server.
    pub delivered: u64,
    /// Events rejected permanently and discarded.
    pub dropped: u64,
    /// Delivery rounds that failed and were retried.
    pub failed_attempts: u64,
}

/// Buckets that must exist on the server before their events are sent.
#[derive(Debug, Default)]
pub struct BucketRegistry {
    buckets: Mutex<BTreeMap<BucketId, Registration>>,
}

#[derive(Debug)]
struct Registration {
    spec: BucketSpec,
    confirmed: bool,
}

impl BucketRegistry {
    /// Registers a bucket; it will be created on the next delivery round.
    pub fn register(&self, spec: BucketSpec) {
        let mut buckets = self.buckets.lock().unwrap_or_else(PoisonError::into_inner);
        let unchanged = buckets.get(&spec.id).is_some_and(|r| r.spec == spec);
        if !unchanged {
            buckets.insert(
                spec.id.clone(),
                Registration {
                    spec,
                    confirmed: false,
                },
            );
        }
    }

    fn unconfirmed(&self) -> Vec<BucketSpec> {
        let buckets = self.buckets.lock().unwrap_or_else(PoisonError::into_inner);
        buckets
            .values()
            .filter(|r| !r.confirmed)
            .map(|r| r.spec.clone())
            .collect()
    }

    fn confirm(&self, spec: &BucketSpec) {
        let mut buckets = self.buckets.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(registration) = buckets.get_mut(&spec.id) {
            if registration.spec == *spec {
                registration.confirmed = true;
            }
        }
    }
}

#[derive(Debug, Error)]
enum RoundError {
    #[error(transparent)]
    Delivery(#[from] DeliveryError),
    #[error("local queue failure: {0}")]
    Queue(#[from] QueueError),
}

/// Resources the dispatcher shares with the client.
#[derive(Debug)]
pub struct DispatchContext<T> {
    pub transport: Arc<T>,
    pub queue: Arc<DurableQueue>,
    pub registry: Arc<BucketRegistry>,
    /// Signalled after every enqueue.
    pub wake: Arc<Notify>,
    pub counters: Arc<DispatchCounters>,
}

impl<T> Clone for DispatchContext<T> {
    fn clone(&self) -> Self {
        Self {
            transport: Arc::clone(&self.transport),
            queue: Arc::clone(&self.queue),
            registry: Arc::clone(&self.registry),
            wake: Arc::clone(&self.wake),
            counters: Arc::clone(&self.counters),
        }
    }
}

/// Drains the durable queue into the event store.
pub struct Dispatcher<T> {
    ctx: DispatchContext<T>,
    config: DispatchConfig,
    backoff: Backoff,
    state: watch::Sender<DispatcherState>,
}

impl<T: Transport> Dispatcher<T> {
    pub fn new(ctx: DispatchContext<T>, config: DispatchConfig) -> Self {
        let (state, _) = watch::channel(DispatcherState::Idle);
        Self {
            ctx,
            backoff: Backoff::new(config.backoff),
            config,
            state,
        }
    }

    /// Observes state transitions.
    pub fn subscribe(&self) -> watch::Receiver<DispatcherState> {
        self.state.subscribe()
    }

    /// Runs until `cancel` fires, or until `drain` fires and the queue is empty
    /// (or the next delivery fails). Never returns an error: failures are
    /// logged and retried.
    pub async fn run(mut self, cancel: CancellationToken, drain: CancellationToken) {
        tracing::debug!(pending = self.ctx.queue.total_len(), "dispatcher started");
        loop {
            if cancel.is_cancelled() {
                break;
            }
            self.state.send_replace(DispatcherState::Sending);
            match self.dispatch_round().await {
                Ok(0) => {
                    self.state.send_replace(DispatcherState::Idle);
                    if drain.is_cancelled() {
                        break;
                    }
                    tokio::select! {
                        () = cancel.cancelled() => break,
                        () = drain.cancelled() => {}
                        () = self.ctx.wake.notified() => {}
                        () = tokio::time::sleep(self.config.poll_interval) => {}
                    }
                }
                Ok(_) => {
                    if self.backoff.attempt() > 0 {
                        tracing::info!("connection to event store restored");
                    }
                    self.backoff.reset();
                }
                Err(err) => {
                    self.ctx.counters.failed_attempts.fetch_add(1, Ordering::Relaxed);
                    self.state.send_replace(DispatcherState::Failed);
                    let delay = self.backoff.next_delay();
                    tracing::warn!(
                        error = %err,
                        pending = self.ctx.queue.total_len(),
                        attempt = self.backoff.attempt(),
                        retry_in_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "delivery failed, events stay queued"
                    );
                    if drain.is_cancelled() {
                        break;
                    }
                    tokio::select! {
                        () = cancel.cancelled() => break,
                        () = drain.cancelled() => break,
                        () = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
        self.state.send_replace(DispatcherState::Idle);
        tracing::debug!(pending = self.ctx.queue.total_len(), "dispatcher stopped");
    }

    /// One pass over every bucket with queued entries.
    ///
    /// Returns how many entries left the queue (delivered or dropped). A
    /// failing bucket does not stop the others; the round reports the first
    /// failure once every bucket has been tried.
    async fn dispatch_round(&self) -> Result<usize, RoundError> {
        self.ensure_buckets().await?;
        let mut handled = 0;
        let mut first_failure = None;
        for (bucket, _) in self.ctx.queue.pending() {
            match self.deliver_bucket(&bucket).await {
                Ok(n) => handled += n,
                Err(err) => {
                    if let RoundError::Queue(queue_err) = &err {
                        tracing::error!(bucket = %bucket, error = %queue_err, "cannot read queued events");
                    }
                    first_failure.get_or_insert(err);
                }
            }
        }
        first_failure.map_or(Ok(handled), Err)
    }

    async fn ensure_buckets(&self) -> Result<(), DeliveryError> {
        let unconfirmed = self.ctx.registry.unconfirmed();
        if unconfirmed.is_empty() {
            return Ok(());
        }
        let existing = self.ctx.transport.bucket_ids().await?;
        for spec in unconfirmed {
            if !existing.contains(&spec.id) {
                match self.ctx.transport.create_bucket(&spec).await {
                    Ok(()) => tracing::info!(bucket = %spec.id, "created bucket"),
                    Err(DeliveryError::Permanent(reason)) => {
                        tracing::error!(bucket = %spec.id, %reason, "server refused to create bucket");
                    }
                    Err(err) => return Err(err),
                }
            }
            self.ctx.registry.confirm(&spec);
        }
        Ok(())
    }

    async fn deliver_bucket(&self, bucket: &BucketId) -> Result<usize, RoundError> {
        let batch = self.ctx.queue.peek_batch(bucket, self.config.batch_size.max(1))?;
        if batch.is_empty() {
            return Ok(0);
        }
        let events: Vec<Event> = batch.iter().map(|entry| entry.event.clone()).collect();

        match self.ctx.transport.send_events(bucket, &events).await {
            Ok(()) => {
                self.acknowledge(&batch)?;
                Ok(batch.len())
            }
            Err(DeliveryError::Permanent(_)) if batch.len() > 1 => {
                tracing::debug!(bucket = %bucket, size = batch.len(), "batch rejected, isolating entries");
                self.deliver_one_by_one(bucket, &batch).await
            }
            Err(DeliveryError::Permanent(reason)) => {
                self.discard(&batch[0], &reason)?;
                Ok(1)
            }
            Err(err) => {
                self.requeue(&batch);
                Err(err.into())
            }
        }
    }

    /// Re-sends a rejected batch entry by entry so only the offending entries are dropped.
    async fn deliver_one_by_one(
        &self,
        bucket: &BucketId,
        batch: &[QueueEntry],
    ) -> Result<usize, RoundError> {
        let mut handled = 0;
        for (index, entry) in batch.iter().enumerate() {
            match self
                .ctx
                .transport
                .send_events(bucket, std::slice::from_ref(&entry.event))
                .await
            {
                Ok(()) => self.acknowledge(std::slice::from_ref(entry))?,
                Err(DeliveryError::Permanent(reason)) => self.discard(entry, &reason)?,
                Err(err) => {
                    self.requeue(&batch[index..]);
                    return Err(err.into());
                }
            }
            handled += 1;
        }
        Ok(handled)
    }

    fn acknowledge(&self, entries: &[QueueEntry]) -> Result<(), QueueError> {
        let ids: Vec<EntryId> = entries.iter().map(|entry| entry.id.clone()).collect();
        self.ctx.queue.ack_many(&ids)?;
        DispatchCounters::add(&self.ctx.counters.delivered, entries.len());
        tracing::debug!(
            bucket = %entries[0].id.bucket,
            count = entries.len(),
            "delivered events"
        );
        Ok(())
    }

    fn discard(&self, entry: &QueueEntry, reason: &str) -> Result<(), QueueError> {
        self.ctx.queue.ack(&entry.id)?;
        DispatchCounters::add(&self.ctx.counters.dropped, 1);
        tracing::error!(
            entry = %entry.id,
            attempts = entry.attempts,
            timestamp = %entry.event.timestamp,
            %reason,
            "event rejected by server and dropped"
        );
        Ok(())
    }

    fn requeue(&self, entries: &[QueueEntry]) {
        for entry in entries {
            if let Err(err) = self.ctx.queue.requeue(&entry.id) {
                tracing::error!(entry = %entry.id, error = %err, "failed to record delivery attempt");
            }
        }
    }
}
