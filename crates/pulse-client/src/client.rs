//! The client facade: merging, queueing and background delivery.
//!
//! [`Client`] owns the merge state and the durable queue. Recording calls
//! return as soon as the event is on disk; delivery happens on a task started
//! by [`Client::connect`].

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use pulse_core::{BucketId, Event, HeartbeatMerger, MergeAction};
use pulse_queue::{DurableQueue, EntryId, QueueError};

use crate::ClientError;
use crate::config::ClientConfig;
use crate::dispatch::{
    BucketRegistry, DispatchContext, DispatchCounters, DispatchStats, Dispatcher,
    DispatcherState,
};
use crate::query::QuerySpec;
use crate::transport::{BucketSpec, HttpTransport, Transport};

/// Merge state plus the queue it feeds; shared with the idle-flush ticker.
struct Pipeline {
    merger: HeartbeatMerger,
    queue: Arc<DurableQueue>,
    wake: Arc<Notify>,
}

impl Pipeline {
    /// Merges a heartbeat and queues whatever it finalized.
    ///
    /// The bucket's merge lock is held across the merge and the enqueue, so a
    /// flushed event always reaches the queue before any later event of the
    /// same bucket. If the enqueue fails the merge is undone.
    fn heartbeat(
        &self,
        bucket: &BucketId,
        heartbeat: Event,
        pulsetime: TimeDelta,
    ) -> Result<MergeAction, ClientError> {
        let handle = self.merger.state(bucket);
        let mut state = handle.lock().unwrap_or_else(PoisonError::into_inner);
        let merge = state.merge(heartbeat, pulsetime)?;
        if let Some(flushed) = merge.flushed {
            if let Err(err) = self.queue.enqueue(bucket, &flushed) {
                state.reinstate(flushed);
                return Err(err.into());
            }
            self.wake.notify_one();
        }
        Ok(merge.action)
    }

    /// Queues the bucket's candidate, then runs `enqueue` under the same lock.
    fn after_flush<R>(
        &self,
        bucket: &BucketId,
        enqueue: impl FnOnce(&DurableQueue) -> Result<R, QueueError>,
    ) -> Result<R, ClientError> {
        let handle = self.merger.state(bucket);
        let mut state = handle.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(candidate) = state.flush() {
            if let Err(err) = self.queue.enqueue(bucket, &candidate) {
                state.reinstate(candidate);
                return Err(err.into());
            }
        }
        let result = enqueue(&self.queue);
        self.wake.notify_one();
        result.map_err(ClientError::from)
    }

    fn flush_bucket(&self, bucket: &BucketId) -> Result<bool, ClientError> {
        let handle = self.merger.state(bucket);
        let mut state = handle.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(candidate) = state.flush() else {
            return Ok(false);
        };
        if let Err(err) = self.queue.enqueue(bucket, &candidate) {
            state.reinstate(candidate);
            return Err(err.into());
        }
        self.wake.notify_one();
        Ok(true)
    }

    /// Queues every candidate untouched for `idle`. Returns how many were queued.
    ///
    /// A bucket whose queue fails keeps its candidate and does not stop the
    /// others; the first failure is returned after every bucket was tried.
    fn flush_idle(&self, now: Instant, idle: Duration) -> Result<usize, ClientError> {
        let mut flushed = 0;
        let mut first_failure = None;
        for bucket in self.merger.buckets() {
            let handle = self.merger.state(&bucket);
            let mut state = handle.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(candidate) = state.flush_if_idle(now, idle) {
                match self.queue.enqueue(&bucket, &candidate) {
                    Ok(_) => {
                        tracing::debug!(bucket = %bucket, "queued idle heartbeat");
                        flushed += 1;
                    }
                    Err(err) => {
                        state.reinstate(candidate);
                        tracing::error!(bucket = %bucket, error = %err, "failed to queue idle heartbeat");
                        first_failure.get_or_insert(err);
                    }
                }
            }
        }
        if flushed > 0 {
            self.wake.notify_one();
        }
        first_failure.map_or(Ok(flushed), |err| Err(err.into()))
    }

    /// Queues every candidate, with the same per-bucket isolation as
    /// [`Pipeline::flush_idle`].
    fn flush_all(&self) -> Result<usize, ClientError> {
        let mut flushed = 0;
        let mut first_failure = None;
        for bucket in self.merger.buckets() {
            match self.flush_bucket(&bucket) {
                Ok(queued) => flushed += usize::from(queued),
                Err(err) => {
                    tracing::error!(bucket = %bucket, error = %err, "failed to queue pending heartbeat");
                    first_failure.get_or_insert(err);
                }
            }
        }
        first_failure.map_or(Ok(flushed), Err)
    }
}

struct Running {
    cancel: CancellationToken,
    drain: CancellationToken,
    dispatcher: JoinHandle<()>,
    ticker: Option<JoinHandle<()>>,
    state: watch::Receiver<DispatcherState>,
}

/// Client for an event store.
///
/// Heartbeats and inserts are merged and written to the durable queue on the
/// caller's thread; nothing on that path waits for the network. After
/// [`Client::connect`], a background task delivers the queue.
///
/// # Example
///
/// ```no_run
/// use chrono::Utc;
/// use pulse_client::{Client, ClientConfig};
/// use pulse_core::{BucketId, Event, EventData};
///
/// # async fn run() -> Result<(), pulse_client::ClientError> {
/// let client = Client::open(ClientConfig::default())?;
/// let bucket = BucketId::new("aw-watcher-window_host").expect("valid id");
/// client.create_bucket(&bucket, "currentwindow");
/// client.connect();
///
/// let heartbeat = Event::heartbeat(Utc::now(), EventData::new()).with("app", "Firefox");
/// client.heartbeat(&bucket, heartbeat, None)?;
///
/// client.shutdown(None).await?;
/// # Ok(())
/// # }
/// ```
pub struct Client<T = HttpTransport> {
    config: ClientConfig,
    hostname: String,
    transport: Arc<T>,
    pipeline: Arc<Pipeline>,
    registry: Arc<BucketRegistry>,
    counters: Arc<DispatchCounters>,
    running: Mutex<Option<Running>>,
}

impl Client<HttpTransport> {
    /// Creates a client for `config.server_url`, opening the queue on disk.
    pub fn open(config: ClientConfig) -> Result<Self, ClientError> {
        let transport = HttpTransport::new(&config.server_url, config.request_timeout())?;
        Self::new(config, transport)
    }

    /// Server information.
    pub async fn info(&self) -> Result<serde_json::Value, ClientError> {
        self.transport.info().await
    }

    /// Bucket metadata keyed by bucket ID.
    pub async fn buckets(&self) -> Result<serde_json::Map<String, serde_json::Value>, ClientError> {
        self.transport.buckets().await
    }

    /// Reads delivered events back from the server. Queued events are not included.
    pub async fn get_events(
        &self,
        bucket: &BucketId,
        limit: Option<u64>,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Vec<Event>, ClientError> {
        self.transport.get_events(bucket, limit, start, end).await
    }

    pub async fn event_count(
        &self,
        bucket: &BucketId,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<u64, ClientError> {
        self.transport.event_count(bucket, start, end).await
    }

    pub async fn delete_bucket(&self, bucket: &BucketId) -> Result<(), ClientError> {
        self.transport.delete_bucket(bucket).await
    }
}

impl<T: Transport> Client<T> {
    /// Creates a client with the queue at [`ClientConfig::resolved_queue_dir`].
    ///
    /// Entries left over from an earlier run are recovered and will be
    /// delivered once the client connects.
    pub fn new(config: ClientConfig, transport: T) -> Result<Self, ClientError> {
        let queue = DurableQueue::open(&config.resolved_queue_dir())?;
        Ok(Self::with_queue(config, transport, queue))
    }

    /// Creates a client on an already opened queue.
    pub fn with_queue(config: ClientConfig, transport: T, queue: DurableQueue) -> Self {
        let queue = queue.with_soft_cap(config.queue_soft_cap);
        let hostname = hostname::get()
            .ok()
            .and_then(|name| name.into_string().ok())
            .unwrap_or_else(|| "unknown".to_string());
        Self {
            config,
            hostname,
            transport: Arc::new(transport),
            pipeline: Arc::new(Pipeline {
                merger: HeartbeatMerger::new(),
                queue: Arc::new(queue),
                wake: Arc::new(Notify::new()),
            }),
            registry: Arc::new(BucketRegistry::default()),
            counters: Arc::new(DispatchCounters::default()),
            running: Mutex::new(None),
        }
    }

    pub const fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn queue(&self) -> &DurableQueue {
        &self.pipeline.queue
    }

    /// Records a heartbeat.
    ///
    /// The heartbeat either extends the bucket's pending event or replaces it,
    /// in which case the previous one is queued for delivery. `pulsetime`
    /// defaults to [`ClientConfig::pulsetime_secs`]. Fails only on invalid
    /// input or a local queue error, never because the server is unreachable.
    pub fn heartbeat(
        &self,
        bucket: &BucketId,
        heartbeat: Event,
        pulsetime: Option<TimeDelta>,
    ) -> Result<MergeAction, ClientError> {
        let pulsetime = match pulsetime {
            Some(pulsetime) => pulsetime,
            None => self.config.pulsetime()?,
        };
        self.pipeline.heartbeat(bucket, heartbeat, pulsetime)
    }

    /// Queues a complete event, bypassing merging.
    ///
    /// The bucket's pending heartbeat is queued first to keep the bucket ordered.
    pub fn insert_event(&self, bucket: &BucketId, event: Event) -> Result<EntryId, ClientError> {
        self.pipeline
            .after_flush(bucket, |queue| queue.enqueue(bucket, &event))
    }

    /// Queues several complete events in order. On error, the events before
    /// the failing one stay queued.
    pub fn insert_events(&self, bucket: &BucketId, events: &[Event]) -> Result<Vec<EntryId>, ClientError> {
        self.pipeline.after_flush(bucket, |queue| {
            events
                .iter()
                .map(|event| queue.enqueue(bucket, event))
                .collect()
        })
    }

    /// Registers a bucket; the dispatcher creates it on the server before
    /// delivering any events.
    pub fn create_bucket(&self, bucket: &BucketId, event_type: &str) {
        self.registry.register(self.bucket_spec(bucket, event_type));
        self.pipeline.wake.notify_one();
    }

    /// Describes a bucket owned by this client and host.
    pub fn bucket_spec(&self, bucket: &BucketId, event_type: &str) -> BucketSpec {
        BucketSpec {
            id: bucket.clone(),
            event_type: event_type.to_string(),
            client: self.config.client_name.clone(),
            hostname: self.hostname.clone(),
        }
    }

    /// Runs a query against the server. Not queued and not retried.
    pub async fn query(&self, query: &QuerySpec) -> Result<serde_json::Value, ClientError> {
        query.validate()?;
        self.transport.query(query).await
    }

    /// Queues the bucket's pending heartbeat, if any.
    pub fn flush_bucket(&self, bucket: &BucketId) -> Result<bool, ClientError> {
        self.pipeline.flush_bucket(bucket)
    }

    /// Queues every pending heartbeat. Returns how many were queued.
    ///
    /// Every bucket is tried even if one fails; the failing bucket keeps its
    /// pending heartbeat and the first error is returned.
    pub fn flush_all(&self) -> Result<usize, ClientError> {
        self.pipeline.flush_all()
    }

    /// Queues pending heartbeats untouched for the configured idle timeout.
    pub fn flush_idle(&self, now: Instant) -> Result<usize, ClientError> {
        match self.config.idle_flush() {
            Some(idle) => self.pipeline.flush_idle(now, idle),
            None => Ok(0),
        }
    }

    /// Starts background delivery. Does nothing if already connected.
    ///
    /// Must be called from within a tokio runtime.
    pub fn connect(&self) {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if running.is_some() {
            return;
        }

        let ctx = DispatchContext {
            transport: Arc::clone(&self.transport),
            queue: Arc::clone(&self.pipeline.queue),
            registry: Arc::clone(&self.registry),
            wake: Arc::clone(&self.pipeline.wake),
            counters: Arc::clone(&self.counters),
        };
        let dispatcher = Dispatcher::new(ctx, self.config.dispatch());
        let state = dispatcher.subscribe();
        let cancel = CancellationToken::new();
        let drain = CancellationToken::new();
        let dispatcher = tokio::spawn(dispatcher.run(cancel.clone(), drain.clone()));

        let ticker = self.config.idle_flush().map(|idle| {
            tokio::spawn(idle_ticker(Arc::clone(&self.pipeline), idle, cancel.clone()))
        });

        tracing::debug!(server = %self.config.server_url, "client connected");
        *running = Some(Running {
            cancel,
            drain,
            dispatcher,
            ticker,
            state,
        });
    }

    /// Queues every pending heartbeat and stops background delivery.
    ///
    /// Waits up to `grace` (default [`ClientConfig::shutdown_grace_ms`]) for
    /// the queue to drain. Undelivered entries stay on disk for the next run.
    pub async fn shutdown(&self, grace: Option<Duration>) -> Result<(), ClientError> {
        let flushed = self.flush_all();
        let running = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(mut running) = running {
            running.drain.cancel();
            let grace = grace.unwrap_or_else(|| self.config.shutdown_grace());
            let joined = match tokio::time::timeout(grace, &mut running.dispatcher).await {
                Ok(joined) => {
                    running.cancel.cancel();
                    joined
                }
                Err(_) => {
                    tracing::debug!("shutdown grace period elapsed");
                    running.cancel.cancel();
                    running.dispatcher.await
                }
            };
            if let Err(err) = joined {
                tracing::error!(error = %err, "dispatcher task failed");
            }
            if let Some(ticker) = running.ticker {
                if let Err(err) = ticker.await {
                    tracing::error!(error = %err, "idle flush task failed");
                }
            }
        }

        let pending = self.pipeline.queue.total_len();
        if pending > 0 {
            tracing::info!(pending, "events remain queued for the next run");
        }
        flushed.map(drop)
    }

    /// Queue depth per bucket.
    pub fn pending(&self) -> Vec<(BucketId, usize)> {
        self.pipeline.queue.pending()
    }

    pub fn stats(&self) -> DispatchStats {
        self.counters.snapshot()
    }

    pub fn state(&self) -> DispatcherState {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map_or(DispatcherState::Idle, |running| *running.state.borrow())
    }
}

impl<T> Drop for Client<T> {
    fn drop(&mut self) {
        let running = self
            .running
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(running) = running {
            running.cancel.cancel();
        }
    }
}

async fn idle_ticker(pipeline: Arc<Pipeline>, idle: Duration, cancel: CancellationToken) {
    let period = (idle / 4).max(Duration::from_millis(100));
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = interval.tick() => {
                if let Err(err) = pipeline.flush_idle(Instant::now(), idle) {
                    tracing::warn!(error = %err, "failed to queue idle heartbeats");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::TimeZone;
    use pulse_core::{EventData, Value};

    use crate::transport::DeliveryError;

    /// A server that is never reachable.
    struct Offline;

    impl Transport for Offline {
        async fn send_events(&self, _bucket: &BucketId, _events: &[Event]) -> Result<(), DeliveryError> {
            Err(DeliveryError::Transient("connection refused".into()))
        }

        async fn bucket_ids(&self) -> Result<Vec<BucketId>, DeliveryError> {
            Err(DeliveryError::Transient("connection refused".into()))
        }

        async fn create_bucket(&self, _bucket: &BucketSpec) -> Result<(), DeliveryError> {
            Err(DeliveryError::Transient("connection refused".into()))
        }

        async fn query(&self, _query: &QuerySpec) -> Result<serde_json::Value, ClientError> {
            Err(DeliveryError::Transient("connection refused".into()).into())
        }
    }

    fn client() -> Client<Offline> {
        let config = ClientConfig {
            poll_interval_ms: 10,
            backoff: pulse_core::BackoffConfig { base_ms: 1, max_ms: 10 },
            ..ClientConfig::default()
        };
        Client::with_queue(config, Offline, DurableQueue::open_in_memory())
    }

    fn bucket() -> BucketId {
        BucketId::new("window").unwrap()
    }

    fn hb(secs: i64, app: &str) -> Event {
        Event::heartbeat(Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap(), EventData::new())
            .with("app", app)
    }

    #[test]
    fn merged_heartbeats_stay_in_memory() {
        let client = client();
        let pulsetime = Some(TimeDelta::seconds(5));

        assert_eq!(client.heartbeat(&bucket(), hb(0, "X"), pulsetime).unwrap(), MergeAction::NewPending);
        assert_eq!(client.heartbeat(&bucket(), hb(3, "X"), pulsetime).unwrap(), MergeAction::Extend);
        assert!(client.pending().is_empty());

        client.heartbeat(&bucket(), hb(10, "X"), pulsetime).unwrap();
        assert_eq!(client.pending(), vec![(bucket(), 1)]);

        let queued = client.queue().peek_batch(&bucket(), 10).unwrap();
        assert_eq!(queued[0].event.timestamp, hb(0, "X").timestamp);
        assert_eq!(queued[0].event.duration, TimeDelta::seconds(3));
    }

    #[test]
    fn insert_queues_pending_heartbeat_first() {
        let client = client();
        client.heartbeat(&bucket(), hb(0, "X"), None).unwrap();
        client.insert_event(&bucket(), hb(1, "Y")).unwrap();

        let queued = client.queue().peek_batch(&bucket(), 10).unwrap();
        let apps: Vec<Value> = queued.iter().map(|e| e.event.data["app"].clone()).collect();
        assert_eq!(apps, vec![Value::from("X"), Value::from("Y")]);
    }

    #[test]
    fn flush_all_queues_every_candidate() {
        let client = client();
        let afk = BucketId::new("afk").unwrap();
        client.heartbeat(&bucket(), hb(0, "X"), None).unwrap();
        client.heartbeat(&afk, hb(0, "idle"), None).unwrap();

        assert_eq!(client.flush_all().unwrap(), 2);
        assert_eq!(client.flush_all().unwrap(), 0);
        assert_eq!(client.queue().total_len(), 2);
    }

    #[test]
    fn flush_idle_honours_timeout() {
        let client = client();
        client.heartbeat(&bucket(), hb(0, "X"), None).unwrap();

        assert_eq!(client.flush_idle(Instant::now()).unwrap(), 0);
        let later = Instant::now() + Duration::from_secs(121);
        assert_eq!(client.flush_idle(later).unwrap(), 1);
        assert_eq!(client.queue().total_len(), 1);
    }

    /// A queue directory where bucket "a" has an unopenable segment.
    fn client_with_broken_bucket(dir: &std::path::Path) -> Client<Offline> {
        std::fs::write(dir.join("a.v1.queue.db"), vec![b'x'; 4096]).unwrap();
        let queue = DurableQueue::open(dir).unwrap();
        Client::with_queue(ClientConfig::default(), Offline, queue)
    }

    #[test]
    fn flush_all_continues_past_a_broken_bucket() {
        let temp = tempfile::tempdir().unwrap();
        let client = client_with_broken_bucket(temp.path());
        let a = BucketId::new("a").unwrap();
        let b = BucketId::new("b").unwrap();
        client.heartbeat(&a, hb(0, "X"), None).unwrap();
        client.heartbeat(&b, hb(0, "X"), None).unwrap();

        assert!(matches!(client.flush_all(), Err(ClientError::Queue(_))));
        assert_eq!(client.pending(), vec![(b, 1)]);

        let state = client.pipeline.merger.state(&a);
        assert!(state.lock().unwrap().candidate().is_some(), "a keeps its candidate");
    }

    #[test]
    fn flush_idle_continues_past_a_broken_bucket() {
        let temp = tempfile::tempdir().unwrap();
        let client = client_with_broken_bucket(temp.path());
        let a = BucketId::new("a").unwrap();
        let b = BucketId::new("b").unwrap();
        client.heartbeat(&a, hb(0, "X"), None).unwrap();
        client.heartbeat(&b, hb(0, "X"), None).unwrap();

        let later = Instant::now() + Duration::from_secs(121);
        assert!(client.flush_idle(later).is_err());
        assert_eq!(client.pending(), vec![(b, 1)]);
    }

    #[tokio::test]
    async fn shutdown_flushes_healthy_buckets_when_one_is_broken() {
        let temp = tempfile::tempdir().unwrap();
        let client = client_with_broken_bucket(temp.path());
        let a = BucketId::new("a").unwrap();
        let b = BucketId::new("b").unwrap();
        client.heartbeat(&a, hb(0, "X"), None).unwrap();
        client.heartbeat(&b, hb(0, "X"), None).unwrap();
        client.connect();

        assert!(client.shutdown(Some(Duration::from_millis(20))).await.is_err());
        assert_eq!(client.queue().len(&b), 1);
    }

    #[tokio::test]
    async fn heartbeats_succeed_while_offline() {
        let client = client();
        client.create_bucket(&bucket(), "currentwindow");
        client.connect();

        for n in 0..5 {
            let app = if n % 2 == 0 { "X" } else { "Y" };
            client.heartbeat(&bucket(), hb(n, app), None).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        client.shutdown(Some(Duration::from_millis(50))).await.unwrap();
        assert_eq!(client.queue().total_len(), 5);
        assert_eq!(client.stats().delivered, 0);
        assert!(client.stats().failed_attempts > 0);
        assert_eq!(client.state(), DispatcherState::Idle);
    }

    #[tokio::test]
    async fn malformed_query_fails_before_network() {
        let client = client();
        let now = Utc::now();
        let query = QuerySpec::new(
            vec![bucket()],
            crate::query::TimeRange::new(now, now),
            Vec::new(),
        );
        assert!(matches!(
            client.query(&query).await,
            Err(ClientError::MalformedQuery(_))
        ));
    }
}
