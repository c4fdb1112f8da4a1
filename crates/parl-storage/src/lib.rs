//! Staged record input and remote document store clients.

mod http;
mod memory;
mod remote;
mod staged;

pub use http::{
    classify_reqwest_error, classify_status, BackoffPolicy, HttpStore, HttpStoreConfig,
    RetryDisposition, SimpleTokenBucket, TokenBucketConfig,
};
pub use memory::MemoryStore;
pub use remote::{RemoteStore, StoreError};
pub use staged::{StagedError, StagedReader, StagedRecords};

pub const CRATE_NAME: &str = "parl-storage";
