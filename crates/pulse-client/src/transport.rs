//! The network boundary: a thin mapping onto the event store's REST API.
//!
//! Nothing here retries. Delivery failures are classified as transient or
//! permanent and handed back to the dispatcher, which owns the retry policy.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use pulse_core::{BucketId, Event};

use crate::ClientError;
use crate::query::QuerySpec;

/// Why a delivery attempt failed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    /// Worth retrying: network trouble, timeouts, 408/429, 5xx.
    #[error("transient delivery failure: {0}")]
    Transient(String),
    /// Retrying cannot help: the server rejected the request (other 4xx).
    #[error("permanent delivery failure: {0}")]
    Permanent(String),
}

impl DeliveryError {
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// A bucket to create on the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BucketSpec {
    #[serde(skip)]
    pub id: BucketId,
    /// Event type stored in the bucket (e.g. `currentwindow`, `afkstatus`).
    #[serde(rename = "type")]
    pub event_type: String,
    pub client: String,
    pub hostname: String,
}

/// Operations the client needs from the event store.
///
/// [`HttpTransport`] is the production implementation; tests substitute their
/// own to simulate outages and rejections.
pub trait Transport: Send + Sync + 'static {
    /// Inserts events into a bucket, in order.
    fn send_events(
        &self,
        bucket: &BucketId,
        events: &[Event],
    ) -> impl Future<Output = Result<(), DeliveryError>> + Send;

    /// Lists the IDs of the buckets that exist on the server.
    fn bucket_ids(&self) -> impl Future<Output = Result<Vec<BucketId>, DeliveryError>> + Send;

    /// Creates a bucket; succeeds if it already exists.
    fn create_bucket(
        &self,
        bucket: &BucketSpec,
    ) -> impl Future<Output = Result<(), DeliveryError>> + Send;

    /// Runs a query and returns the server's JSON result.
    fn query(
        &self,
        query: &QuerySpec,
    ) -> impl Future<Output = Result<serde_json::Value, ClientError>> + Send;
}

/// HTTP implementation of [`Transport`] using `reqwest`.
///
/// # Thread Safety
///
/// The transport is safe to clone and share across threads. Each clone shares
/// the underlying HTTP connection pool.
#[derive(Clone)]
pub struct HttpTransport {
    http: reqwest::Client,
    base: Url,
}

impl fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpTransport")
            .field("base", &self.base.as_str())
            .finish_non_exhaustive()
    }
}

impl HttpTransport {
    /// Creates a transport for the server at `server_url` (e.g. `http://localhost:5600`).
    pub fn new(server_url: &str, timeout: Duration) -> Result<Self, ClientError> {
        let base = Url::parse(server_url)
            .map_err(|err| ClientError::InvalidUrl(format!("{server_url}: {err}")))?;
        if base.cannot_be_a_base() || !matches!(base.scheme(), "http" | "https") {
            return Err(ClientError::InvalidUrl(format!(
                "{server_url}: expected an http(s) URL"
            )));
        }

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(ClientError::ClientBuild)?;

        Ok(Self { http, base })
    }

    /// Builds `<base>/api/0/<segments...>`, percent-encoding each segment.
    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(["api", "0"]).extend(segments);
        }
        url
    }

    /// Server information (`hostname`, `version`, `testing`, ...).
    pub async fn info(&self) -> Result<serde_json::Value, ClientError> {
        let response = self.http.get(self.url(&["info"])).send().await?;
        read_json(response).await
    }

    /// Bucket metadata keyed by bucket ID.
    pub async fn buckets(&self) -> Result<serde_json::Map<String, serde_json::Value>, ClientError> {
        let response = self.http.get(self.url(&["buckets", ""])).send().await?;
        read_json(response).await
    }

    /// Reads events back from a bucket, newest first.
    pub async fn get_events(
        &self,
        bucket: &BucketId,
        limit: Option<u64>,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Vec<Event>, ClientError> {
        let mut params = range_params(start, end);
        if let Some(limit) = limit {
            params.push(("limit", limit.to_string()));
        }
        let response = self
            .http
            .get(self.url(&["buckets", bucket.as_str(), "events"]))
            .query(&params)
            .send()
            .await?;
        read_json(response).await
    }

    /// Counts the events in a bucket.
    pub async fn event_count(
        &self,
        bucket: &BucketId,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<u64, ClientError> {
        let response = self
            .http
            .get(self.url(&["buckets", bucket.as_str(), "events", "count"]))
            .query(&range_params(start, end))
            .send()
            .await?;
        read_json(response).await
    }

    /// Deletes a bucket and all of its events.
    pub async fn delete_bucket(&self, bucket: &BucketId) -> Result<(), ClientError> {
        let response = self
            .http
            .delete(self.url(&["buckets", bucket.as_str()]))
            .query(&[("force", "1")])
            .send()
            .await?;
        check_status(response).await.map(drop)
    }
}

impl Transport for HttpTransport {
    async fn send_events(&self, bucket: &BucketId, events: &[Event]) -> Result<(), DeliveryError> {
        let response = self
            .http
            .post(self.url(&["buckets", bucket.as_str(), "events"]))
            .json(events)
            .send()
            .await
            .map_err(request_failure)?;
        delivery_status(response).await
    }

    async fn bucket_ids(&self) -> Result<Vec<BucketId>, DeliveryError> {
        let response = self
            .http
            .get(self.url(&["buckets", ""]))
            .send()
            .await
            .map_err(request_failure)?;
        let status = response.status();
        let body = response.text().await.map_err(request_failure)?;
        if !status.is_success() {
            return Err(classify(status, &body));
        }
        let buckets: serde_json::Map<String, serde_json::Value> = serde_json::from_str(&body)
            .map_err(|err| DeliveryError::Transient(format!("invalid bucket listing: {err}")))?;
        Ok(buckets
            .into_iter()
            .filter_map(|(id, _)| BucketId::new(id).ok())
            .collect())
    }

    async fn create_bucket(&self, bucket: &BucketSpec) -> Result<(), DeliveryError> {
        let response = self
            .http
            .post(self.url(&["buckets", bucket.id.as_str()]))
            .json(bucket)
            .send()
            .await
            .map_err(request_failure)?;
        // 304 Not Modified: the bucket already exists.
        if response.status() == StatusCode::NOT_MODIFIED {
            return Ok(());
        }
        delivery_status(response).await
    }

    async fn query(&self, query: &QuerySpec) -> Result<serde_json::Value, ClientError> {
        let mut params = Vec::new();
        if let Some(name) = &query.name {
            params.push(("name", name.clone()));
        }
        if query.cache {
            params.push(("cache", "1".to_string()));
        }
        let response = self
            .http
            .post(self.url(&["query", ""]))
            .query(&params)
            .json(&query.body())
            .send()
            .await?;
        read_json(response).await
    }
}

fn range_params(start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> Vec<(&'static str, String)> {
    let mut params = Vec::new();
    if let Some(start) = start {
        params.push(("start", start.to_rfc3339_opts(SecondsFormat::AutoSi, true)));
    }
    if let Some(end) = end {
        params.push(("end", end.to_rfc3339_opts(SecondsFormat::AutoSi, true)));
    }
    params
}

/// Connection problems, timeouts and unreadable responses are all worth a retry.
fn request_failure(err: reqwest::Error) -> DeliveryError {
    DeliveryError::Transient(err.to_string())
}

async fn delivery_status(response: reqwest::Response) -> Result<(), DeliveryError> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    let body = response.text().await.unwrap_or_default();
    Err(classify(status, &body))
}

/// Maps a non-success status to a delivery failure.
pub(crate) fn classify(status: StatusCode, body: &str) -> DeliveryError {
    let message = format!("status {status}: {}", api_message(body).unwrap_or_else(|| body.to_string()));
    if status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
    {
        DeliveryError::Transient(message)
    } else {
        DeliveryError::Permanent(message)
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    tracing::warn!(%status, "event store request failed");
    Err(ClientError::Api {
        status: status.as_u16(),
        message: api_message(&body).unwrap_or(body),
    })
}

async fn read_json<T>(response: reqwest::Response) -> Result<T, ClientError>
where
    T: for<'de> Deserialize<'de>,
{
    let response = check_status(response).await?;
    let body = response.text().await?;
    serde_json::from_str(&body).map_err(|err| ClientError::InvalidResponse(err.to_string()))
}

/// Extracts `message` from the server's JSON error body, if present.
fn api_message(body: &str) -> Option<String> {
    #[derive(Deserialize)]
    struct ErrorPayload {
        message: String,
    }

    serde_json::from_str::<ErrorPayload>(body)
        .ok()
        .map(|payload| payload.message)
}
