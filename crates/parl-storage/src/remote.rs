use async_trait::async_trait;
use parl_core::{EntityType, Query, Record, RemoteRecord};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("decoding response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("no record at {0}")]
    NotFound(String),
}

/// Document store operations the exporter consumes.
///
/// Write operations return the store's response record; callers inspect its
/// `_status` rather than relying on the transport to reject failed writes.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn find_first(
        &self,
        entity: EntityType,
        query: &Query,
    ) -> Result<Option<RemoteRecord>, StoreError>;

    async fn find_many(
        &self,
        entity: EntityType,
        query: &Query,
    ) -> Result<Vec<RemoteRecord>, StoreError>;

    async fn create(&self, entity: EntityType, record: &Record)
        -> Result<RemoteRecord, StoreError>;

    async fn update(
        &self,
        entity: EntityType,
        id: &str,
        record: &Record,
    ) -> Result<RemoteRecord, StoreError>;

    async fn bulk_create(
        &self,
        entity: EntityType,
        records: &[Record],
    ) -> Result<RemoteRecord, StoreError>;

    /// Fetches a record by its self link. Only `sort` and `embed` of `query`
    /// are applied.
    async fn get(&self, link: &str, query: &Query) -> Result<RemoteRecord, StoreError>;
}
