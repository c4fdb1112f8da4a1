use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use parl_core::{EntityType, Query, Record, RemoteRecord};
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::Serialize;
use serde_json::Value as JsonValue;
use tokio::sync::Mutex;
use tracing::{debug, info_span, Instrument};

use crate::remote::{RemoteStore, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Retry schedule for reads. Writes are sent once.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

#[derive(Debug)]
pub struct SimpleTokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl SimpleTokenBucket {
    pub fn new(capacity: u32, refill_every: Duration) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub async fn take(&self) {
        loop {
            let mut state = self.state.lock().await;
            let elapsed = state.last_refill.elapsed();
            if self.refill_every.is_zero() {
                state.tokens = self.capacity;
            } else if elapsed >= self.refill_every {
                let refills = elapsed.as_nanos() / self.refill_every.as_nanos();
                let refills = u32::try_from(refills).unwrap_or(u32::MAX);
                state.tokens = state.tokens.saturating_add(refills).min(self.capacity);
                state.last_refill = Instant::now();
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            let sleep_for = self.refill_every;
            drop(state);
            tokio::time::sleep(sleep_for).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpStoreConfig {
    /// Server URL including the parliament endpoint, e.g. `https://api.example.org/pl/sejm`.
    pub base_url: String,
    pub user: Option<String>,
    pub password: Option<String>,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
    pub token_bucket: Option<TokenBucketConfig>,
}

impl HttpStoreConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            user: None,
            password: None,
            timeout: Duration::from_secs(60),
            user_agent: None,
            backoff: BackoffPolicy::default(),
            token_bucket: None,
        }
    }
}

/// Client for an Eve-style document API: `where`/`sort`/`embedded` query
/// parameters, `_items` listings and `_status` on write responses.
#[derive(Debug)]
pub struct HttpStore {
    client: reqwest::Client,
    base_url: String,
    user: Option<String>,
    password: Option<String>,
    token_bucket: Option<Arc<SimpleTokenBucket>>,
    backoff: BackoffPolicy,
}

impl HttpStore {
    pub fn new(config: HttpStoreConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        let token_bucket = config
            .token_bucket
            .map(|c| Arc::new(SimpleTokenBucket::new(c.capacity, c.refill_every)));

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            user: config.user,
            password: config.password,
            token_bucket,
            backoff: config.backoff,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn collection_url(&self, entity: EntityType) -> String {
        format!("{}/{}", self.base_url, entity.endpoint())
    }

    fn link_url(&self, link: &str) -> String {
        if link.starts_with("http://") || link.starts_with("https://") {
            link.to_string()
        } else {
            format!("{}/{}", self.base_url, link.trim_start_matches('/'))
        }
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        let builder = self.client.request(method, url);
        match &self.user {
            Some(user) => builder.basic_auth(user, self.password.as_deref()),
            None => builder,
        }
    }

    async fn throttle(&self) {
        if let Some(bucket) = &self.token_bucket {
            bucket.take().await;
        }
    }

    async fn get_json(
        &self,
        url: &str,
        params: &[(&'static str, String)],
    ) -> Result<RemoteRecord, StoreError> {
        let mut attempt = 0usize;
        loop {
            self.throttle().await;
            match self.request(Method::GET, url).query(params).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        let body = resp.bytes().await.map_err(|source| StoreError::Request {
                            url: url.to_string(),
                            source,
                        })?;
                        return decode_record(url, &body);
                    }
                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(%status, attempt, "retrying read");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(StoreError::HttpStatus {
                        status: status.as_u16(),
                        url: url.to_string(),
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(error = %err, attempt, "retrying read");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(StoreError::Request {
                        url: url.to_string(),
                        source: err,
                    });
                }
            }
        }
    }

    /// Sends a write once. A JSON error body is returned as a record so the
    /// caller sees the store's `_status`.
    async fn write_json<B>(
        &self,
        method: Method,
        url: &str,
        body: &B,
    ) -> Result<RemoteRecord, StoreError>
    where
        B: Serialize + ?Sized + Sync,
    {
        self.throttle().await;
        let resp = self
            .request(method, url)
            .json(body)
            .send()
            .await
            .map_err(|source| StoreError::Request {
                url: url.to_string(),
                source,
            })?;
        let status = resp.status();
        let bytes = resp.bytes().await.map_err(|source| StoreError::Request {
            url: url.to_string(),
            source,
        })?;
        match serde_json::from_slice::<RemoteRecord>(&bytes) {
            Ok(record) => Ok(record),
            Err(_) if !status.is_success() => Err(StoreError::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            }),
            Err(source) => Err(StoreError::Decode {
                url: url.to_string(),
                source,
            }),
        }
    }
}

fn decode_record(url: &str, body: &[u8]) -> Result<RemoteRecord, StoreError> {
    serde_json::from_slice(body).map_err(|source| StoreError::Decode {
        url: url.to_string(),
        source,
    })
}

fn listing_params(query: &Query, max_results: Option<usize>) -> Vec<(&'static str, String)> {
    let mut params = Vec::new();
    if !query.filter.is_empty() {
        params.push(("where", query.where_param()));
    }
    params.extend(link_params(query));
    if let Some(max_results) = max_results {
        params.push(("max_results", max_results.to_string()));
    }
    params
}

fn link_params(query: &Query) -> Vec<(&'static str, String)> {
    let mut params = Vec::new();
    if let Some(sort) = query.sort_param() {
        params.push(("sort", sort));
    }
    if let Some(embedded) = query.embedded_param() {
        params.push(("embedded", embedded));
    }
    params
}

fn listing_items(listing: RemoteRecord) -> Vec<RemoteRecord> {
    listing
        .items()
        .iter()
        .filter_map(JsonValue::as_object)
        .cloned()
        .map(RemoteRecord::new)
        .collect()
}

#[async_trait]
impl RemoteStore for HttpStore {
    async fn find_first(
        &self,
        entity: EntityType,
        query: &Query,
    ) -> Result<Option<RemoteRecord>, StoreError> {
        let url = self.collection_url(entity);
        let listing = self
            .get_json(&url, &listing_params(query, Some(1)))
            .instrument(info_span!("store_request", method = "GET", url = %url))
            .await?;
        Ok(listing_items(listing).into_iter().next())
    }

    async fn find_many(
        &self,
        entity: EntityType,
        query: &Query,
    ) -> Result<Vec<RemoteRecord>, StoreError> {
        let url = self.collection_url(entity);
        let listing = self
            .get_json(&url, &listing_params(query, None))
            .instrument(info_span!("store_request", method = "GET", url = %url))
            .await?;
        Ok(listing_items(listing))
    }

    async fn create(
        &self,
        entity: EntityType,
        record: &Record,
    ) -> Result<RemoteRecord, StoreError> {
        let url = self.collection_url(entity);
        self.write_json(Method::POST, &url, record)
            .instrument(info_span!("store_request", method = "POST", url = %url))
            .await
    }

    async fn update(
        &self,
        entity: EntityType,
        id: &str,
        record: &Record,
    ) -> Result<RemoteRecord, StoreError> {
        let url = format!("{}/{}", self.collection_url(entity), id);
        self.write_json(Method::PUT, &url, record)
            .instrument(info_span!("store_request", method = "PUT", url = %url))
            .await
    }

    async fn bulk_create(
        &self,
        entity: EntityType,
        records: &[Record],
    ) -> Result<RemoteRecord, StoreError> {
        let url = self.collection_url(entity);
        self.write_json(Method::POST, &url, records)
            .instrument(info_span!("store_request", method = "POST", url = %url, count = records.len()))
            .await
    }

    async fn get(&self, link: &str, query: &Query) -> Result<RemoteRecord, StoreError> {
        let url = self.link_url(link);
        self.get_json(&url, &link_params(query))
            .instrument(info_span!("store_request", method = "GET", url = %url))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parl_core::SortOrder;
    use serde_json::json;
    use wiremock::matchers::{basic_auth, body_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn store_for(server: &MockServer) -> HttpStore {
        let mut config = HttpStoreConfig::new(format!("{}/pl/sejm", server.uri()));
        config.user = Some("scraper".to_string());
        config.password = Some("secret".to_string());
        config.backoff = BackoffPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        };
        HttpStore::new(config).expect("store")
    }

    fn record(value: JsonValue) -> Record {
        value.as_object().cloned().expect("object")
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn token_bucket_refills_at_sub_millisecond_intervals() {
        let bucket = SimpleTokenBucket::new(2, Duration::from_micros(500));
        let drained = tokio::time::timeout(Duration::from_secs(1), async {
            for _ in 0..5 {
                bucket.take().await;
            }
        })
        .await;
        assert!(drained.is_ok(), "bucket stalled after its capacity was spent");
    }

    #[tokio::test]
    async fn token_bucket_with_zero_interval_never_blocks() {
        let bucket = SimpleTokenBucket::new(1, Duration::ZERO);
        let drained = tokio::time::timeout(Duration::from_secs(1), async {
            for _ in 0..10 {
                bucket.take().await;
            }
        })
        .await;
        assert!(drained.is_ok());
    }

    #[tokio::test]
    async fn token_bucket_waits_once_capacity_is_spent() {
        let bucket = SimpleTokenBucket::new(1, Duration::from_millis(50));
        let started = Instant::now();
        bucket.take().await;
        bucket.take().await;
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn find_first_sends_where_sort_and_credentials() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/pl/sejm/memberships"))
            .and(basic_auth("scraper", "secret"))
            .and(query_param("where", r#"{"person_id":"p1","start_date":{"$exists":false}}"#))
            .and(query_param("sort", r#"[("start_date", -1)]"#))
            .and(query_param("max_results", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "_items": [{ "id": "m1", "person_id": "p1" }, { "id": "m2" }]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let query = Query::new()
            .where_eq("person_id", json!("p1"))
            .where_missing("start_date")
            .sort_by("start_date", SortOrder::Descending);
        let found = store_for(&server)
            .find_first(EntityType::Memberships, &query)
            .await
            .expect("find_first");
        assert_eq!(found.and_then(|r| r.id().map(str::to_string)), Some("m1".into()));
    }

    #[tokio::test]
    async fn empty_listing_is_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/pl/sejm/events"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "_items": [] })))
            .mount(&server)
            .await;

        let query = Query::new().where_eq("identifier", json!("A"));
        let found = store_for(&server)
            .find_first(EntityType::Events, &query)
            .await
            .expect("find_first");
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn rejected_create_returns_error_status_record() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/pl/sejm/people"))
            .and(body_json(json!({ "name": "Jan" })))
            .respond_with(ResponseTemplate::new(422).set_body_json(json!({
                "_status": "ERR",
                "_issues": { "identifiers": "required field" }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let response = store_for(&server)
            .create(EntityType::People, &record(json!({ "name": "Jan" })))
            .await
            .expect("json error body is a record");
        assert_eq!(response.status(), Some("ERR"));
        assert!(!response.is_ok());
    }

    #[tokio::test]
    async fn writes_are_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/pl/sejm/people/abc"))
            .respond_with(ResponseTemplate::new(503).set_body_string("unavailable"))
            .expect(1)
            .mount(&server)
            .await;

        let err = store_for(&server)
            .update(EntityType::People, "abc", &record(json!({ "name": "Jan" })))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::HttpStatus { status: 503, .. }));
    }

    #[tokio::test]
    async fn reads_retry_on_server_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/pl/sejm/vote-events/ve1"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/pl/sejm/vote-events/ve1"))
            .and(query_param("embedded", r#"{"votes":1}"#))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "ve1",
                "votes": []
            })))
            .mount(&server)
            .await;

        let fetched = store_for(&server)
            .get("vote-events/ve1", &Query::new().embed("votes"))
            .await
            .expect("get after retry");
        assert_eq!(fetched.id(), Some("ve1"));
    }

    #[tokio::test]
    async fn bulk_create_posts_array() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/pl/sejm/votes"))
            .and(body_json(json!([
                { "vote_event_id": "ve1", "voter_id": "p1", "option": "yes" },
                { "vote_event_id": "ve1", "voter_id": "p2", "option": "no" }
            ])))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "_status": "OK",
                "_items": [{ "_status": "OK" }, { "_status": "OK" }]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let votes = vec![
            record(json!({ "vote_event_id": "ve1", "voter_id": "p1", "option": "yes" })),
            record(json!({ "vote_event_id": "ve1", "voter_id": "p2", "option": "no" })),
        ];
        let summary = store_for(&server)
            .bulk_create(EntityType::Votes, &votes)
            .await
            .expect("bulk_create");
        assert!(summary.is_ok());
        assert_eq!(summary.items().len(), 2);
    }
}
