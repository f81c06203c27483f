//! Delivery behavior of the client against an in-memory event store.
//!
//! Covers retry convergence, isolation of rejected events and of failing
//! buckets, and durability of queued events across restarts and crashes.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{TimeDelta, TimeZone, Utc};
use pulse_client::{
    BucketSpec, Client, ClientConfig, ClientError, DeliveryError, QuerySpec, Transport,
};
use pulse_core::{BackoffConfig, BucketId, Event, EventData, Value};
use tempfile::TempDir;

/// Records accepted events. Can be made to fail or reject on demand.
#[derive(Default)]
struct Store {
    events: Mutex<Vec<(BucketId, Event)>>,
    buckets: Mutex<Vec<BucketId>>,
    /// Number of upcoming `send_events` calls to fail transiently.
    fail_next: AtomicUsize,
    offline: AtomicBool,
    /// Events carrying `"bad": true` are rejected with a 400.
    reject_bad: bool,
}

impl Store {
    fn delivered(&self, bucket: &BucketId) -> Vec<i64> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(b, _)| b == bucket)
            .map(|(_, event)| match event.data.get("n") {
                Some(Value::Int(n)) => *n,
                _ => -1,
            })
            .collect()
    }
}

impl Transport for Store {
    async fn send_events(&self, bucket: &BucketId, events: &[Event]) -> Result<(), DeliveryError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(DeliveryError::Transient("connection refused".into()));
        }
        let fail = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err(DeliveryError::Transient("status 503 Service Unavailable".into()));
        }
        if self.reject_bad
            && events
                .iter()
                .any(|event| event.data.get("bad") == Some(&Value::Bool(true)))
        {
            return Err(DeliveryError::Permanent("status 400 Bad Request".into()));
        }
        let mut stored = self.events.lock().unwrap();
        stored.extend(events.iter().map(|event| (bucket.clone(), event.clone())));
        Ok(())
    }

    async fn bucket_ids(&self) -> Result<Vec<BucketId>, DeliveryError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(DeliveryError::Transient("connection refused".into()));
        }
        Ok(self.buckets.lock().unwrap().clone())
    }

    async fn create_bucket(&self, bucket: &BucketSpec) -> Result<(), DeliveryError> {
        self.buckets.lock().unwrap().push(bucket.id.clone());
        Ok(())
    }

    async fn query(&self, _query: &QuerySpec) -> Result<serde_json::Value, ClientError> {
        Ok(serde_json::json!([]))
    }
}

fn config(queue_dir: &std::path::Path) -> ClientConfig {
    ClientConfig {
        client_name: "test".to_string(),
        queue_dir: Some(queue_dir.to_path_buf()),
        batch_size: 3,
        poll_interval_ms: 10,
        backoff: BackoffConfig { base_ms: 1, max_ms: 20 },
        ..ClientConfig::default()
    }
}

fn bucket() -> BucketId {
    BucketId::new("aw-watcher-window_test").unwrap()
}

fn event(n: i64) -> Event {
    Event::new(
        Utc.timestamp_opt(1_700_000_000 + n * 10, 0).unwrap(),
        TimeDelta::seconds(5),
        EventData::new(),
    )
    .unwrap()
    .with("n", n)
}

async fn wait_until_drained<T: Transport>(client: &Client<T>) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while client.queue().total_len() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("queue drains");
}

#[tokio::test]
async fn retries_until_the_server_accepts() {
    let temp = TempDir::new().unwrap();
    let store = Store {
        fail_next: AtomicUsize::new(4),
        ..Store::default()
    };
    let client = Client::new(config(temp.path()), store).unwrap();
    client.create_bucket(&bucket(), "currentwindow");
    client.connect();

    for n in 0..10 {
        client.insert_event(&bucket(), event(n)).unwrap();
    }
    wait_until_drained(&client).await;
    client.shutdown(None).await.unwrap();

    assert_eq!(client.transport().delivered(&bucket()), (0..10).collect::<Vec<_>>());
    let stats = client.stats();
    assert_eq!(stats.delivered, 10);
    assert_eq!(stats.dropped, 0);
    assert!(stats.failed_attempts >= 4);
}

#[tokio::test]
async fn rejected_event_does_not_block_the_rest() {
    let temp = TempDir::new().unwrap();
    let store = Store {
        reject_bad: true,
        ..Store::default()
    };
    let client = Client::new(config(temp.path()), store).unwrap();

    let events: Vec<Event> = (0..6)
        .map(|n| if n == 2 { event(n).with("bad", true) } else { event(n) })
        .collect();
    client.insert_events(&bucket(), &events).unwrap();
    client.connect();

    wait_until_drained(&client).await;
    client.shutdown(None).await.unwrap();

    assert_eq!(client.transport().delivered(&bucket()), vec![0, 1, 3, 4, 5]);
    assert_eq!(client.stats().dropped, 1);
}

#[tokio::test]
async fn queued_events_survive_a_restart() {
    let temp = TempDir::new().unwrap();

    let offline = Store::default();
    offline.offline.store(true, Ordering::SeqCst);
    let first = Client::new(config(temp.path()), offline).unwrap();
    first.connect();
    let pulsetime = Some(TimeDelta::seconds(60));
    for n in 0..4 {
        // Differing payloads, so each heartbeat finalizes the previous one.
        first.heartbeat(&bucket(), event(n), pulsetime).unwrap();
    }
    first
        .shutdown(Some(Duration::from_millis(20)))
        .await
        .unwrap();
    assert_eq!(first.queue().total_len(), 4);
    assert!(first.transport().delivered(&bucket()).is_empty());
    drop(first);

    let second = Client::new(config(temp.path()), Store::default()).unwrap();
    assert_eq!(second.pending(), vec![(bucket(), 4)]);
    second.connect();
    wait_until_drained(&second).await;
    second.shutdown(None).await.unwrap();

    assert_eq!(second.transport().delivered(&bucket()), vec![0, 1, 2, 3]);

    let third = Client::new(config(temp.path()), Store::default()).unwrap();
    assert!(third.pending().is_empty(), "acknowledged events are gone for good");
}

#[tokio::test]
async fn queued_events_survive_a_crash() {
    let temp = TempDir::new().unwrap();
    {
        let offline = Store::default();
        offline.offline.store(true, Ordering::SeqCst);
        let crashed = Client::new(config(temp.path()), offline).unwrap();
        crashed.connect();
        crashed.insert_events(&bucket(), &[event(0), event(1)]).unwrap();
        crashed
            .heartbeat(&bucket(), event(2), Some(TimeDelta::seconds(60)))
            .unwrap();
        crashed
            .heartbeat(&bucket(), event(3), Some(TimeDelta::seconds(60)))
            .unwrap();
        // Dropped without shutdown: only what reached the queue is kept.
    }

    let recovered = Client::new(config(temp.path()), Store::default()).unwrap();
    assert_eq!(recovered.pending(), vec![(bucket(), 3)]);
    recovered.connect();
    wait_until_drained(&recovered).await;

    assert_eq!(recovered.transport().delivered(&bucket()), vec![0, 1, 2]);
    recovered.shutdown(None).await.unwrap();
}

#[tokio::test]
async fn unreadable_bucket_does_not_hold_back_others() {
    let temp = TempDir::new().unwrap();
    // Sorts before the window bucket, so it is visited first every round.
    let afk = BucketId::new("aw-watcher-afk_test").unwrap();
    let client = Client::new(config(temp.path()), Store::default()).unwrap();

    client.insert_event(&afk, event(0)).unwrap();
    client.insert_event(&bucket(), event(1)).unwrap();
    let segment = temp.path().join("aw-watcher-afk_test.v1.queue.db");
    let conn = rusqlite::Connection::open(segment).unwrap();
    conn.execute("UPDATE entries SET payload = 'not json'", [])
        .unwrap();
    drop(conn);

    client.connect();
    tokio::time::timeout(Duration::from_secs(10), async {
        while client.queue().len(&bucket()) > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("healthy bucket drains");
    client
        .shutdown(Some(Duration::from_millis(20)))
        .await
        .unwrap();

    assert_eq!(client.transport().delivered(&bucket()), vec![1]);
    assert_eq!(client.queue().len(&afk), 1);
}

#[tokio::test]
async fn heartbeats_merge_before_delivery() {
    let temp = TempDir::new().unwrap();
    let client = Client::new(config(temp.path()), Store::default()).unwrap();
    client.connect();

    let pulsetime = Some(TimeDelta::seconds(5));
    let at = |secs: i64| Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap();
    for secs in [0, 3] {
        let hb = Event::heartbeat(at(secs), EventData::new()).with("app", "X");
        client.heartbeat(&bucket(), hb, pulsetime).unwrap();
    }
    let hb = Event::heartbeat(at(10), EventData::new()).with("app", "X");
    client.heartbeat(&bucket(), hb, pulsetime).unwrap();

    wait_until_drained(&client).await;
    client.shutdown(None).await.unwrap();

    let stored: Vec<(i64, f64)> = client
        .transport()
        .events
        .lock()
        .unwrap()
        .iter()
        .map(|(_, e)| (e.timestamp.timestamp() - 1_700_000_000, pulse_core::event::seconds(e.duration)))
        .collect();
    assert_eq!(stored, vec![(0, 3.0), (10, 0.0)]);
}
